// ESP-IDF hardware backends
// Device-target implementations of the hardware trait seams. Nothing in here
// is reachable from host builds; the core stays testable off-device.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use esp_idf_hal::delay::BLOCK;
use esp_idf_hal::i2c::I2cDriver;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_svc::mqtt::client::{EspMqttClient, MqttClientConfiguration, QoS};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sys::EspError;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use log::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::i2c_arbiter::{DisplayFault, TextPanelBus};
use crate::led_manager::{IndicatorPins, SignalLine};
use crate::mqtt_manager::{BrokerDriver, BrokerFault};
use crate::wifi_manager::{LinkDriver, LinkFault, LinkStatus};

const REACHABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

fn esp_fault(context: &str, e: EspError) -> LinkFault {
    LinkFault::Driver(format!("{context}: {e}"))
}

/// Station-mode Wi-Fi driver over the ESP-IDF blocking wrapper.
pub struct EspLinkDriver {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl EspLinkDriver {
    pub fn new(
        modem: esp_idf_svc::hal::modem::Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
    ) -> Result<Self, EspError> {
        let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
        let wifi = BlockingWifi::wrap(wifi, sys_loop)?;
        info!("wifi driver initialized");
        Ok(Self { wifi })
    }
}

impl LinkDriver for EspLinkDriver {
    fn disable(&mut self) -> Result<(), LinkFault> {
        if self.wifi.is_started().map_err(|e| esp_fault("is_started", e))? {
            self.wifi.stop().map_err(|e| esp_fault("stop", e))?;
        }
        Ok(())
    }

    fn enable_station(&mut self) -> Result<(), LinkFault> {
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration::default()))
            .map_err(|e| esp_fault("set_configuration", e))?;
        self.wifi.start().map_err(|e| esp_fault("start", e))
    }

    fn set_power_saving(&mut self, enabled: bool) -> Result<(), LinkFault> {
        let mode = if enabled {
            esp_idf_svc::sys::wifi_ps_type_t_WIFI_PS_MIN_MODEM
        } else {
            esp_idf_svc::sys::wifi_ps_type_t_WIFI_PS_NONE
        };
        esp_idf_svc::sys::esp!(unsafe { esp_idf_svc::sys::esp_wifi_set_ps(mode) })
            .map_err(|e| esp_fault("esp_wifi_set_ps", e))
    }

    fn begin_association(&mut self, link_name: &str, link_secret: &str) -> Result<(), LinkFault> {
        let auth_method = if link_secret.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        let config = Configuration::Client(ClientConfiguration {
            ssid: link_name
                .try_into()
                .map_err(|_| LinkFault::Driver("ssid too long".into()))?,
            password: link_secret
                .try_into()
                .map_err(|_| LinkFault::Driver("password too long".into()))?,
            auth_method,
            ..Default::default()
        });
        self.wifi
            .set_configuration(&config)
            .map_err(|e| esp_fault("set_configuration", e))?;
        // Non-blocking connect on the inner driver; association progress is
        // observed through poll_status.
        self.wifi
            .wifi_mut()
            .connect()
            .map_err(|e| esp_fault("connect", e))
    }

    fn poll_status(&mut self) -> LinkStatus {
        // The blocking wrapper does not surface disconnect reason codes, so
        // conclusive auth/not-found classification is unavailable here; the
        // retry loop simply runs out its poll budget instead.
        match self.wifi.is_connected() {
            Ok(true) => match self.wifi.wifi().sta_netif().get_ip_info() {
                Ok(info) if !info.ip.is_unspecified() => LinkStatus::Associated(info.ip),
                Ok(_) => LinkStatus::Associating,
                Err(e) => {
                    warn!("ip info query failed: {e}");
                    LinkStatus::Failed
                }
            },
            Ok(false) => LinkStatus::Associating,
            Err(e) => {
                warn!("link status query failed: {e}");
                LinkStatus::Failed
            }
        }
    }
}

/// MQTT broker driver over the ESP-IDF client. Plain TCP only; the secure
/// variant is rejected upstream before this driver is reached.
pub struct EspBrokerDriver {
    client: Option<EspMqttClient<'static>>,
}

impl EspBrokerDriver {
    pub fn new() -> Self {
        Self { client: None }
    }
}

impl Default for EspBrokerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerDriver for EspBrokerDriver {
    fn probe_reachability(&mut self, host: &str, port: u16) -> bool {
        let mut addresses = match (host, port).to_socket_addrs() {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!("broker address resolution failed for {host}:{port}: {e}");
                return false;
            }
        };
        match addresses.next() {
            Some(address) => {
                match TcpStream::connect_timeout(&address, REACHABILITY_PROBE_TIMEOUT) {
                    Ok(stream) => {
                        // Open and close is the whole probe.
                        drop(stream);
                        true
                    }
                    Err(e) => {
                        warn!("broker probe to {address} failed: {e}");
                        false
                    }
                }
            }
            None => false,
        }
    }

    fn handshake(&mut self, client_id: &str, config: &ConnectionConfig) -> Result<(), BrokerFault> {
        let url = format!("mqtt://{}:{}", config.broker_host, config.broker_port);
        let mqtt_config = MqttClientConfiguration {
            client_id: Some(client_id),
            username: if config.broker_user.is_empty() {
                None
            } else {
                Some(&config.broker_user)
            },
            password: if config.broker_secret.is_empty() {
                None
            } else {
                Some(&config.broker_secret)
            },
            ..Default::default()
        };

        let (client, mut connection) = EspMqttClient::new(&url, &mqtt_config)
            .map_err(|e| BrokerFault::Handshake(e.to_string()))?;

        // Drain broker events on a background thread so the client keeps
        // servicing keep-alives.
        std::thread::Builder::new()
            .name("mqtt-events".into())
            .spawn(move || {
                while let Ok(event) = connection.next() {
                    debug!("mqtt event: {:?}", event.payload());
                }
                info!("mqtt event stream closed");
            })
            .map_err(|e| BrokerFault::Handshake(format!("event thread spawn failed: {e}")))?;

        self.client = Some(client);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerFault> {
        let client = self.client.as_mut().ok_or(BrokerFault::NotConnected)?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .map(|_| ())
            .map_err(|e| BrokerFault::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// The three status LEDs on their bring-up GPIOs.
pub struct GpioIndicatorPins {
    power: PinDriver<'static, AnyOutputPin, Output>,
    activity: PinDriver<'static, AnyOutputPin, Output>,
    fault: PinDriver<'static, AnyOutputPin, Output>,
}

impl GpioIndicatorPins {
    pub fn new(
        power: AnyOutputPin,
        activity: AnyOutputPin,
        fault: AnyOutputPin,
    ) -> Result<Self, EspError> {
        Ok(Self {
            power: PinDriver::output(power)?,
            activity: PinDriver::output(activity)?,
            fault: PinDriver::output(fault)?,
        })
    }
}

impl IndicatorPins for GpioIndicatorPins {
    fn set_line(&mut self, line: SignalLine, on: bool) {
        let pin = match line {
            SignalLine::Power => &mut self.power,
            SignalLine::Activity => &mut self.activity,
            SignalLine::Fault => &mut self.fault,
        };
        let result = if on { pin.set_high() } else { pin.set_low() };
        if let Err(e) = result {
            warn!("indicator gpio write failed for {line:?}: {e}");
        }
    }
}

// HD44780 text panel behind a PCF8574 I2C backpack, 4-bit mode.
// Bit layout on the expander: P0=RS P1=RW P2=EN P3=backlight P4..P7=data.
const LCD_BACKLIGHT: u8 = 0x08;
const LCD_ENABLE: u8 = 0x04;
const LCD_REGISTER_SELECT: u8 = 0x01;

pub struct I2cTextPanel {
    i2c: I2cDriver<'static>,
    address: u8,
}

impl I2cTextPanel {
    pub fn new(i2c: I2cDriver<'static>) -> Self {
        Self { i2c, address: 0 }
    }

    fn write_expander(&mut self, value: u8) -> Result<(), DisplayFault> {
        self.i2c
            .write(self.address, &[value | LCD_BACKLIGHT], BLOCK)
            .map_err(|e| DisplayFault::Io(e.to_string()))
    }

    fn strobe(&mut self, value: u8) -> Result<(), DisplayFault> {
        self.write_expander(value | LCD_ENABLE)?;
        std::thread::sleep(Duration::from_micros(1));
        self.write_expander(value & !LCD_ENABLE)?;
        std::thread::sleep(Duration::from_micros(50));
        Ok(())
    }

    fn write_nibble(&mut self, nibble: u8, register_select: bool) -> Result<(), DisplayFault> {
        let mut value = (nibble & 0x0F) << 4;
        if register_select {
            value |= LCD_REGISTER_SELECT;
        }
        self.strobe(value)
    }

    fn write_byte(&mut self, byte: u8, register_select: bool) -> Result<(), DisplayFault> {
        self.write_nibble(byte >> 4, register_select)?;
        self.write_nibble(byte & 0x0F, register_select)
    }

    fn command(&mut self, command: u8) -> Result<(), DisplayFault> {
        self.write_byte(command, false)
    }
}

impl TextPanelBus for I2cTextPanel {
    fn probe(&mut self, address: u8) -> bool {
        self.i2c.write(address, &[0x00], BLOCK).is_ok()
    }

    fn initialize(&mut self, address: u8) -> Result<(), DisplayFault> {
        self.address = address;
        // Standard 4-bit HD44780 wake-up sequence.
        std::thread::sleep(Duration::from_millis(50));
        for _ in 0..3 {
            self.write_nibble(0x03, false)?;
            std::thread::sleep(Duration::from_millis(5));
        }
        self.write_nibble(0x02, false)?;
        self.command(0x28)?; // 4-bit, two lines, 5x8 font
        self.command(0x08)?; // display off
        self.command(0x01)?; // clear
        std::thread::sleep(Duration::from_millis(2));
        self.command(0x06)?; // entry mode: increment, no shift
        self.command(0x0C)?; // display on, cursor off
        info!("text panel initialized at 0x{address:02X}");
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DisplayFault> {
        self.command(0x01)?;
        std::thread::sleep(Duration::from_millis(2));
        Ok(())
    }

    fn write_line(&mut self, row: u8, text: &str) -> Result<(), DisplayFault> {
        let base = if row == 0 { 0x80 } else { 0xC0 };
        self.command(base)?;
        for byte in text.bytes() {
            self.write_byte(byte, true)?;
        }
        Ok(())
    }
}
