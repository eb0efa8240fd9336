// Firmware entry point
// Builds the context objects once (bus, indicator, arbiter, shared state),
// launches the subordinate units, and hands control to the orchestrator.
// Host builds wire simulation drivers so the whole boot sequence can run
// off-device.

use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};

use esp32lab::config::ConfigLoader;
use esp32lab::device_info::broker_client_id;
use esp32lab::i2c_arbiter::{spawn_panel_arbiter, DisplayHandle, TextPanelBus};
use esp32lab::led_manager::{IndicatorPins, PatternTiming, StatusIndicator};
use esp32lab::message_bus::MessageBus;
use esp32lab::mqtt_manager::{BrokerDriver, BrokerRetryPolicy, BrokerUnit};
use esp32lab::orchestrator::{Orchestrator, PhaseTimeouts};
use esp32lab::stub_tasks::{spawn_stub_unit, STUB_UNITS};
use esp32lab::system_state::SharedState;
use esp32lab::wifi_manager::{LinkDriver, LinkRetryPolicy, WifiLinkUnit};

#[cfg(target_os = "espidf")]
const SETTINGS_STORE_PATH: &str = "/spiffs/sensitiveData.json";
#[cfg(not(target_os = "espidf"))]
const SETTINGS_STORE_PATH: &str = "sensitiveData.json";

fn main() -> Result<()> {
    init_logging();
    info!("🚀 esp32lab starting. version={}", env!("CARGO_PKG_VERSION"));

    let (pins, panel, link_driver, broker_driver) = build_drivers()?;
    run_device(pins, panel, link_driver, broker_driver)
}

fn run_device(
    pins: Box<dyn IndicatorPins>,
    panel: Box<dyn TextPanelBus>,
    link_driver: impl LinkDriver + 'static,
    broker_driver: impl BrokerDriver + 'static,
) -> Result<()> {
    let bus = Arc::new(MessageBus::new());
    let state = SharedState::new();
    let indicator = Arc::new(StatusIndicator::new(pins, PatternTiming::default()));
    let (display, _arbiter_join) = spawn_panel_arbiter(panel)?;

    let loader = ConfigLoader::new(SETTINGS_STORE_PATH, builtin_override());
    if let Err(e) = loader.ensure_default_file() {
        warn!("could not seed the settings store: {e}");
    }

    let mut orchestrator = Orchestrator::new(
        Arc::clone(&bus),
        Arc::clone(&indicator),
        display.clone(),
        state.clone(),
        loader,
        PhaseTimeouts::default(),
    );

    let launch_bus = Arc::clone(&bus);
    let launch_indicator = Arc::clone(&indicator);
    let launch_state = state.clone();
    let launch_display: DisplayHandle = display.clone();
    orchestrator.run(move |config| {
        for unit in STUB_UNITS {
            spawn_stub_unit(Arc::clone(&launch_bus), unit)?;
        }
        WifiLinkUnit::new(
            Arc::clone(&launch_bus),
            Arc::clone(&launch_indicator),
            launch_display,
            launch_state.clone(),
            link_driver,
            LinkRetryPolicy::default(),
        )
        .spawn()?;
        BrokerUnit::new(
            launch_bus,
            launch_indicator,
            launch_state,
            broker_driver,
            config.clone(),
            broker_client_id(),
            BrokerRetryPolicy::default(),
        )
        .spawn()?;
        Ok(())
    })?;

    orchestrator.steady_loop();
    Ok(())
}

fn builtin_override() -> Option<esp32lab::config::ConnectionConfig> {
    if cfg!(feature = "builtin-credentials") {
        Some(esp32lab::builtin_settings::builtin_connection_config())
    } else {
        None
    }
}

#[cfg(target_os = "espidf")]
fn init_logging() {
    // Required once so the esp-idf-sys runtime patches link properly.
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
}

#[cfg(not(target_os = "espidf"))]
fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[cfg(target_os = "espidf")]
fn build_drivers() -> Result<(
    Box<dyn IndicatorPins>,
    Box<dyn TextPanelBus>,
    esp32lab::hardware::EspLinkDriver,
    esp32lab::hardware::EspBrokerDriver,
)> {
    use esp32lab::hardware::{EspBrokerDriver, EspLinkDriver, GpioIndicatorPins, I2cTextPanel};
    use esp_idf_hal::gpio::OutputPin;
    use esp_idf_hal::i2c::{I2cConfig, I2cDriver};
    use esp_idf_hal::units::Hertz;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::hal::peripherals::Peripherals;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let pins = GpioIndicatorPins::new(
        peripherals.pins.gpio2.downgrade_output(),
        peripherals.pins.gpio4.downgrade_output(),
        peripherals.pins.gpio5.downgrade_output(),
    )?;

    let i2c_config = I2cConfig::new().baudrate(Hertz(100_000));
    let i2c = I2cDriver::new(
        peripherals.i2c0,
        peripherals.pins.gpio8,
        peripherals.pins.gpio9,
        &i2c_config,
    )?;
    let panel = I2cTextPanel::new(i2c);

    let link_driver = EspLinkDriver::new(peripherals.modem, sys_loop, nvs)?;
    let broker_driver = EspBrokerDriver::new();

    Ok((Box::new(pins), Box::new(panel), link_driver, broker_driver))
}

#[cfg(not(target_os = "espidf"))]
fn build_drivers() -> Result<(
    Box<dyn IndicatorPins>,
    Box<dyn TextPanelBus>,
    sim::SimLinkDriver,
    sim::SimBrokerDriver,
)> {
    info!("host build: wiring simulation drivers");
    Ok((
        Box::new(sim::LogIndicatorPins),
        Box::new(sim::LogTextPanel),
        sim::SimLinkDriver::default(),
        sim::SimBrokerDriver,
    ))
}

/// Host-only simulation backends: enough behavior to drive the full boot
/// sequence and watch it in the log output.
#[cfg(not(target_os = "espidf"))]
mod sim {
    use std::net::Ipv4Addr;

    use log::info;

    use esp32lab::config::ConnectionConfig;
    use esp32lab::i2c_arbiter::{DisplayFault, TextPanelBus, PANEL_ADDR_PRIMARY};
    use esp32lab::led_manager::{IndicatorPins, SignalLine};
    use esp32lab::mqtt_manager::{BrokerDriver, BrokerFault};
    use esp32lab::wifi_manager::{LinkDriver, LinkFault, LinkStatus};

    pub struct LogIndicatorPins;

    impl IndicatorPins for LogIndicatorPins {
        fn set_line(&mut self, line: SignalLine, on: bool) {
            info!("[led] {line:?} {}", if on { "on" } else { "off" });
        }
    }

    pub struct LogTextPanel;

    impl TextPanelBus for LogTextPanel {
        fn probe(&mut self, address: u8) -> bool {
            address == PANEL_ADDR_PRIMARY
        }
        fn initialize(&mut self, address: u8) -> Result<(), DisplayFault> {
            info!("[panel] initialized at 0x{address:02X}");
            Ok(())
        }
        fn clear(&mut self) -> Result<(), DisplayFault> {
            Ok(())
        }
        fn write_line(&mut self, row: u8, text: &str) -> Result<(), DisplayFault> {
            info!("[panel row {row}] {text}");
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct SimLinkDriver {
        polls: u32,
    }

    impl LinkDriver for SimLinkDriver {
        fn disable(&mut self) -> Result<(), LinkFault> {
            Ok(())
        }
        fn enable_station(&mut self) -> Result<(), LinkFault> {
            Ok(())
        }
        fn set_power_saving(&mut self, _enabled: bool) -> Result<(), LinkFault> {
            Ok(())
        }
        fn begin_association(&mut self, name: &str, _secret: &str) -> Result<(), LinkFault> {
            info!("[sim] associating with {name}");
            Ok(())
        }
        fn poll_status(&mut self) -> LinkStatus {
            self.polls += 1;
            if self.polls >= 2 {
                LinkStatus::Associated(Ipv4Addr::new(192, 168, 4, 100))
            } else {
                LinkStatus::Associating
            }
        }
    }

    pub struct SimBrokerDriver;

    impl BrokerDriver for SimBrokerDriver {
        fn probe_reachability(&mut self, host: &str, port: u16) -> bool {
            info!("[sim] probing {host}:{port}");
            true
        }
        fn handshake(
            &mut self,
            client_id: &str,
            _config: &ConnectionConfig,
        ) -> Result<(), BrokerFault> {
            info!("[sim] broker handshake as {client_id}");
            Ok(())
        }
        fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerFault> {
            info!(
                "[sim] publish {topic}: {}",
                String::from_utf8_lossy(payload)
            );
            Ok(())
        }
    }
}
