// Broker connectivity manager
// Reaches and authenticates against the message broker, gated by a raw
// transport reachability probe so an unreachable host never drags the unit
// through a long handshake hang. Retry policy is deliberately flat.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::config::ConnectionConfig;
use crate::led_manager::StatusIndicator;
use crate::message_bus::{MessageBus, MessageKind, TaskMessage, UnitId};
use crate::system_state::SharedState;

pub const BROKER_QUEUE_CAPACITY: usize = 8;
pub const PROTOCOL_VERSION: &str = "1.0.0";
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

const REPLY_SEND_TIMEOUT: Duration = Duration::from_millis(200);
const IDLE_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerFault {
    #[error("link layer is not connected")]
    LinkDown,
    #[error("secure transport (TLS) is not implemented on this build")]
    TransportUnimplemented,
    #[error("broker {host}:{port} is unreachable")]
    PeerUnreachable { host: String, port: u16 },
    #[error("broker handshake failed: {0}")]
    Handshake(String),
    #[error("broker handshake gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("not connected to the broker")]
    NotConnected,
}

/// Seam to the broker transport. The probe opens and closes a raw connection
/// to host:port; handshake and publish speak the actual protocol.
pub trait BrokerDriver: Send {
    fn probe_reachability(&mut self, host: &str, port: u16) -> bool;
    fn handshake(&mut self, client_id: &str, config: &ConnectionConfig) -> Result<(), BrokerFault>;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerFault>;
}

/// Flat retry pacing: a fixed number of evenly spaced handshake attempts,
/// no escalation.
#[derive(Debug, Clone)]
pub struct BrokerRetryPolicy {
    pub max_attempts: u32,
    pub attempt_delay: Duration,
}

impl Default for BrokerRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            attempt_delay: Duration::from_millis(200),
        }
    }
}

/// Boot notification document published once the orchestrator reaches the
/// publish phase.
#[derive(Debug, Serialize)]
struct BootNotifyPayload<'a> {
    #[serde(rename = "protocolVersion")]
    protocol_version: &'a str,
    command: &'a str,
    state: &'a str,
    #[serde(rename = "firmwareVersion")]
    firmware_version: &'a str,
}

pub fn boot_notify_topic(client_id: &str) -> String {
    format!("device/{client_id}/boot")
}

pub struct BrokerUnit<D: BrokerDriver> {
    bus: Arc<MessageBus>,
    indicator: Arc<StatusIndicator>,
    state: SharedState,
    driver: D,
    config: ConnectionConfig,
    client_id: String,
    policy: BrokerRetryPolicy,
    connected: bool,
}

impl<D: BrokerDriver + 'static> BrokerUnit<D> {
    pub fn new(
        bus: Arc<MessageBus>,
        indicator: Arc<StatusIndicator>,
        state: SharedState,
        driver: D,
        config: ConnectionConfig,
        client_id: String,
        policy: BrokerRetryPolicy,
    ) -> Self {
        Self {
            bus,
            indicator,
            state,
            driver,
            config,
            client_id,
            policy,
            connected: false,
        }
    }

    /// Register the broker queue and start the unit on its own thread.
    pub fn spawn(mut self) -> anyhow::Result<JoinHandle<()>> {
        self.bus.register(UnitId::Broker, BROKER_QUEUE_CAPACITY)?;
        let join = thread::Builder::new()
            .name("broker".into())
            .spawn(move || self.run_loop())?;
        Ok(join)
    }

    fn run_loop(&mut self) {
        info!("🔌 broker unit started. client_id={}", self.client_id);
        loop {
            let message = match self.bus.receive(UnitId::Broker, IDLE_RECEIVE_TIMEOUT) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    error!("broker unit receive failed, stopping: {e}");
                    return;
                }
            };
            match message.kind {
                MessageKind::StartupRequest => self.acknowledge_startup(message.source),
                MessageKind::BrokerInitRequest => self.handle_init_request(&message),
                MessageKind::PublishRequest => self.handle_publish_request(&message),
                other => debug!("broker unit ignoring {:?}", other),
            }
        }
    }

    fn acknowledge_startup(&self, requester: UnitId) {
        let ack = TaskMessage::new(UnitId::Broker, requester, MessageKind::StartupAck).with_int(1);
        if let Err(e) = self.bus.send(ack, REPLY_SEND_TIMEOUT) {
            error!("broker unit failed to send startup ack: {e}");
        }
    }

    pub fn handle_init_request(&mut self, request: &TaskMessage) {
        let reply = match self.connect() {
            Ok(attempt) => {
                info!("✅ broker connected. attempt={attempt}");
                TaskMessage::new(UnitId::Broker, request.source, MessageKind::BrokerInitDone)
                    .with_int(attempt as i32)
                    .with_bool(true)
            }
            Err(fault) => {
                error!("❌ broker connection failed: {fault}");
                TaskMessage::new(UnitId::Broker, request.source, MessageKind::TaskError)
                    .with_text1(&fault.to_string())
            }
        };
        if let Err(e) = self.bus.send(reply, REPLY_SEND_TIMEOUT) {
            error!("broker unit failed to report init result: {e}");
        }
    }

    pub fn handle_publish_request(&mut self, request: &TaskMessage) {
        let reply = match self.publish_boot_notify() {
            Ok(topic) => {
                info!("📤 boot notification published. topic={topic}");
                TaskMessage::new(UnitId::Broker, request.source, MessageKind::PublishDone)
                    .with_bool(true)
                    .with_text1(&topic)
            }
            Err(fault) => {
                error!("❌ boot notification publish failed: {fault}");
                TaskMessage::new(UnitId::Broker, request.source, MessageKind::TaskError)
                    .with_text1(&fault.to_string())
            }
        };
        if let Err(e) = self.bus.send(reply, REPLY_SEND_TIMEOUT) {
            error!("broker unit failed to report publish result: {e}");
        }
    }

    /// Full connection protocol: precondition checks, reachability probe,
    /// then the flat handshake retry loop.
    pub fn connect(&mut self) -> Result<u32, BrokerFault> {
        if !self.state.link_connected() {
            // Without a link there is nothing to probe; fail visibly and
            // immediately.
            self.indicator.error_pattern();
            return Err(BrokerFault::LinkDown);
        }
        if self.config.broker_use_tls {
            return Err(BrokerFault::TransportUnimplemented);
        }

        let host = self.config.broker_host.clone();
        let port = self.config.broker_port;
        info!("🔌 probing broker reachability at {host}:{port}");
        if !self.driver.probe_reachability(&host, port) {
            // Skipping the handshake loop entirely avoids a long hang
            // against a host that is not even answering the transport.
            return Err(BrokerFault::PeerUnreachable { host, port });
        }

        self.indicator.broker_connecting();
        let config = self.config.clone();
        for attempt in 1..=self.policy.max_attempts {
            debug!(
                "broker handshake attempt {attempt} of {}",
                self.policy.max_attempts
            );
            match self.driver.handshake(&self.client_id, &config) {
                Ok(()) => {
                    self.connected = true;
                    self.state.set_broker_connected(true);
                    self.indicator.broker_connected();
                    return Ok(attempt);
                }
                Err(fault) => {
                    warn!("broker handshake attempt {attempt} failed: {fault}");
                }
            }
            if attempt < self.policy.max_attempts {
                thread::sleep(self.policy.attempt_delay);
            }
        }
        Err(BrokerFault::RetriesExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    fn publish_boot_notify(&mut self) -> Result<String, BrokerFault> {
        if !self.connected {
            return Err(BrokerFault::NotConnected);
        }
        let topic = boot_notify_topic(&self.client_id);
        let payload = BootNotifyPayload {
            protocol_version: PROTOCOL_VERSION,
            command: "deviceBootNotify",
            state: self.state.runtime_state().as_name(),
            firmware_version: FIRMWARE_VERSION,
        };
        let body = serde_json::to_vec(&payload).map_err(|e| BrokerFault::Publish {
            topic: topic.clone(),
            reason: e.to_string(),
        })?;

        self.indicator.activity_pulse();
        self.driver.publish(&topic, &body)?;
        Ok(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::led_manager::{IndicatorPins, PatternTiming, SignalLine};
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;

    struct NullPins;
    impl IndicatorPins for NullPins {
        fn set_line(&mut self, _line: SignalLine, _on: bool) {}
    }

    #[derive(Clone, Default)]
    struct Counters {
        probes: usize,
        handshakes: usize,
        publishes: usize,
    }

    struct MockBroker {
        reachable: bool,
        succeed_on_attempt: Option<u32>,
        counters: Arc<Mutex<Counters>>,
    }

    impl MockBroker {
        fn new(reachable: bool, succeed_on_attempt: Option<u32>) -> (Self, Arc<Mutex<Counters>>) {
            let counters = Arc::new(Mutex::new(Counters::default()));
            (
                Self {
                    reachable,
                    succeed_on_attempt,
                    counters: Arc::clone(&counters),
                },
                counters,
            )
        }
    }

    impl BrokerDriver for MockBroker {
        fn probe_reachability(&mut self, _host: &str, _port: u16) -> bool {
            self.counters.lock().probes += 1;
            self.reachable
        }

        fn handshake(
            &mut self,
            _client_id: &str,
            _config: &ConnectionConfig,
        ) -> Result<(), BrokerFault> {
            let attempt = {
                let mut counters = self.counters.lock();
                counters.handshakes += 1;
                counters.handshakes as u32
            };
            match self.succeed_on_attempt {
                Some(target) if attempt >= target => Ok(()),
                _ => Err(BrokerFault::Handshake("refused".into())),
            }
        }

        fn publish(&mut self, _topic: &str, _payload: &[u8]) -> Result<(), BrokerFault> {
            self.counters.lock().publishes += 1;
            Ok(())
        }
    }

    fn fast_policy() -> BrokerRetryPolicy {
        BrokerRetryPolicy {
            max_attempts: 10,
            attempt_delay: Duration::from_millis(1),
        }
    }

    fn unit_with(
        driver: MockBroker,
        config: ConnectionConfig,
        link_up: bool,
    ) -> (BrokerUnit<MockBroker>, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new());
        bus.register(UnitId::Main, 16).unwrap();
        let indicator = Arc::new(StatusIndicator::new(
            Box::new(NullPins),
            PatternTiming::immediate(),
        ));
        let state = SharedState::new();
        if link_up {
            state.set_link_connected(Some(Ipv4Addr::new(10, 0, 0, 7)));
        }
        let unit = BrokerUnit::new(
            Arc::clone(&bus),
            indicator,
            state,
            driver,
            config,
            "esp32lab-test".into(),
            fast_policy(),
        );
        (unit, bus)
    }

    fn lab_config() -> ConnectionConfig {
        ConnectionConfig {
            broker_host: "10.0.0.5".into(),
            broker_port: 1883,
            ..Default::default()
        }
    }

    #[test]
    fn unreachable_broker_never_enters_the_handshake_loop() {
        let (driver, counters) = MockBroker::new(false, Some(1));
        let (mut unit, bus) = unit_with(driver, lab_config(), true);

        let request =
            TaskMessage::new(UnitId::Main, UnitId::Broker, MessageKind::BrokerInitRequest);
        unit.handle_init_request(&request);

        let seen = counters.lock().clone();
        assert_eq!(seen.probes, 1);
        assert_eq!(seen.handshakes, 0);

        let reply = bus
            .receive(UnitId::Main, Duration::from_millis(200))
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, MessageKind::TaskError);
        assert!(reply.text1.contains("unreachable"));
    }

    #[test]
    fn link_down_fails_immediately_without_probing() {
        let (driver, counters) = MockBroker::new(true, Some(1));
        let (mut unit, _bus) = unit_with(driver, lab_config(), false);

        assert_eq!(unit.connect(), Err(BrokerFault::LinkDown));
        assert_eq!(counters.lock().probes, 0);
    }

    #[test]
    fn tls_variant_fails_fast_with_a_clear_reason() {
        let (driver, counters) = MockBroker::new(true, Some(1));
        let mut config = lab_config();
        config.broker_use_tls = true;
        let (mut unit, _bus) = unit_with(driver, config, true);

        assert_eq!(unit.connect(), Err(BrokerFault::TransportUnimplemented));
        assert_eq!(counters.lock().probes, 0);
    }

    #[test]
    fn handshake_retries_are_flat_and_bounded() {
        let (driver, counters) = MockBroker::new(true, None);
        let (mut unit, _bus) = unit_with(driver, lab_config(), true);

        let result = unit.connect();
        assert_eq!(result, Err(BrokerFault::RetriesExhausted { attempts: 10 }));
        assert_eq!(counters.lock().handshakes, 10);
        assert!(!unit.state.broker_connected());
    }

    #[test]
    fn successful_handshake_reports_the_attempt_number() {
        let (driver, counters) = MockBroker::new(true, Some(3));
        let (mut unit, _bus) = unit_with(driver, lab_config(), true);

        assert_eq!(unit.connect(), Ok(3));
        assert_eq!(counters.lock().handshakes, 3);
        assert!(unit.state.broker_connected());
        assert!(unit.connected);
    }

    #[test]
    fn publish_requires_a_connection_and_reports_done() {
        let (driver, counters) = MockBroker::new(true, Some(1));
        let (mut unit, bus) = unit_with(driver, lab_config(), true);

        // Before connecting, publish is refused.
        let request = TaskMessage::new(UnitId::Main, UnitId::Broker, MessageKind::PublishRequest);
        unit.handle_publish_request(&request);
        let refused = bus
            .receive(UnitId::Main, Duration::from_millis(200))
            .unwrap()
            .unwrap();
        assert_eq!(refused.kind, MessageKind::TaskError);

        unit.connect().unwrap();
        unit.handle_publish_request(&request);
        let done = bus
            .receive(UnitId::Main, Duration::from_millis(200))
            .unwrap()
            .unwrap();
        assert_eq!(done.kind, MessageKind::PublishDone);
        assert_eq!(done.text1, boot_notify_topic("esp32lab-test"));
        assert_eq!(counters.lock().publishes, 1);
    }
}
