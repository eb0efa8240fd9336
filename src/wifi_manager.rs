// Wi-Fi link manager
// Message-driven execution unit that owns link-layer association. Retries
// stay entirely inside this unit; the orchestrator only ever sees a single
// LinkInitDone or TaskError.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::mask;
use crate::i2c_arbiter::DisplayHandle;
use crate::led_manager::StatusIndicator;
use crate::message_bus::{MessageBus, MessageKind, TaskMessage, UnitId};
use crate::system_state::SharedState;

/// Queue depth for the link unit, matching the other peripheral units.
pub const LINK_QUEUE_CAPACITY: usize = 8;

const REPLY_SEND_TIMEOUT: Duration = Duration::from_millis(200);
const IDLE_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Link-layer status as reported by the radio between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Associating,
    Associated(Ipv4Addr),
    /// Conclusive: the access point rejected our credentials.
    AuthRejected,
    /// Conclusive: no such network in range.
    NetworkNotFound,
    Failed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkFault {
    #[error("link driver operation failed: {0}")]
    Driver(String),
    #[error("association rejected by the access point")]
    AuthRejected,
    #[error("configured network not found")]
    NetworkNotFound,
    #[error("association gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Seam to the radio. Granular on purpose: the unit sequences the clean-state
/// dance itself so the recovery protocol lives in one testable place.
pub trait LinkDriver: Send {
    fn disable(&mut self) -> Result<(), LinkFault>;
    fn enable_station(&mut self) -> Result<(), LinkFault>;
    fn set_power_saving(&mut self, enabled: bool) -> Result<(), LinkFault>;
    fn begin_association(&mut self, link_name: &str, link_secret: &str) -> Result<(), LinkFault>;
    fn poll_status(&mut self) -> LinkStatus;
}

/// Retry pacing. Defaults give each attempt a ~7 s poll budget and the whole
/// operation three attempts; tests shrink every field.
#[derive(Debug, Clone)]
pub struct LinkRetryPolicy {
    pub max_attempts: u32,
    pub poll_budget: u32,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub attempt_backoff: Duration,
}

impl Default for LinkRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            poll_budget: 14,
            poll_interval: Duration::from_millis(500),
            settle_delay: Duration::from_millis(100),
            attempt_backoff: Duration::from_millis(1200),
        }
    }
}

pub struct WifiLinkUnit<D: LinkDriver> {
    bus: Arc<MessageBus>,
    indicator: Arc<StatusIndicator>,
    display: DisplayHandle,
    state: SharedState,
    driver: D,
    policy: LinkRetryPolicy,
}

impl<D: LinkDriver + 'static> WifiLinkUnit<D> {
    pub fn new(
        bus: Arc<MessageBus>,
        indicator: Arc<StatusIndicator>,
        display: DisplayHandle,
        state: SharedState,
        driver: D,
        policy: LinkRetryPolicy,
    ) -> Self {
        Self {
            bus,
            indicator,
            display,
            state,
            driver,
            policy,
        }
    }

    /// Register the link queue and start the unit on its own thread.
    pub fn spawn(mut self) -> anyhow::Result<JoinHandle<()>> {
        self.bus.register(UnitId::Link, LINK_QUEUE_CAPACITY)?;
        let join = thread::Builder::new()
            .name("wifi-link".into())
            .spawn(move || self.run_loop())?;
        Ok(join)
    }

    fn run_loop(&mut self) {
        info!("📡 wifi link unit started");
        loop {
            let message = match self.bus.receive(UnitId::Link, IDLE_RECEIVE_TIMEOUT) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    error!("wifi link unit receive failed, stopping: {e}");
                    return;
                }
            };
            match message.kind {
                MessageKind::StartupRequest => self.acknowledge_startup(message.source),
                MessageKind::LinkInitRequest => self.handle_init_request(&message),
                other => debug!("wifi link unit ignoring {:?}", other),
            }
        }
    }

    fn acknowledge_startup(&self, requester: UnitId) {
        let ack = TaskMessage::new(UnitId::Link, requester, MessageKind::StartupAck).with_int(1);
        if let Err(e) = self.bus.send(ack, REPLY_SEND_TIMEOUT) {
            error!("wifi link unit failed to send startup ack: {e}");
        }
    }

    /// Drive the full association protocol for one init request and report
    /// exactly one terminal message back to the requester.
    pub fn handle_init_request(&mut self, request: &TaskMessage) {
        let link_name = request.text1.clone();
        let link_secret = request.text2.clone();
        info!(
            "📡 link init requested. ssid={} secret={}",
            link_name,
            mask(&link_secret)
        );

        let reply = match self.connect_with_retry(&link_name, &link_secret) {
            Ok((address, attempt)) => {
                self.state.set_link_connected(Some(address));
                self.indicator.link_connected();
                // Best-effort status line; a dead panel never blocks the link.
                self.display
                    .request_text("WIFI READY", &address.to_string(), Duration::ZERO);
                info!("✅ link associated. address={address} attempt={attempt}");
                TaskMessage::new(UnitId::Link, request.source, MessageKind::LinkInitDone)
                    .with_int(attempt as i32)
                    .with_bool(true)
                    .with_text1(&address.to_string())
            }
            Err(fault) => {
                self.state.set_link_connected(None);
                error!("❌ link association failed: {fault}");
                TaskMessage::new(UnitId::Link, request.source, MessageKind::TaskError)
                    .with_text1(&fault.to_string())
            }
        };
        if let Err(e) = self.bus.send(reply, REPLY_SEND_TIMEOUT) {
            error!("wifi link unit failed to report result: {e}");
        }
    }

    fn connect_with_retry(
        &mut self,
        link_name: &str,
        link_secret: &str,
    ) -> Result<(Ipv4Addr, u32), LinkFault> {
        let mut last_fault = LinkFault::RetriesExhausted {
            attempts: self.policy.max_attempts,
        };

        for attempt in 1..=self.policy.max_attempts {
            info!(
                "📡 association attempt {attempt} of {}",
                self.policy.max_attempts
            );
            self.indicator.link_connecting();

            if let Err(fault) = self.reset_link_layer() {
                warn!("link reset failed on attempt {attempt}: {fault}");
                last_fault = fault;
            } else if let Err(fault) = self.driver.begin_association(link_name, link_secret) {
                warn!("begin association failed on attempt {attempt}: {fault}");
                last_fault = fault;
            } else {
                match self.poll_until_conclusive() {
                    Ok(address) => return Ok((address, attempt)),
                    Err(fault) => {
                        warn!("attempt {attempt} ended without association: {fault}");
                        last_fault = fault;
                    }
                }
            }

            if attempt < self.policy.max_attempts {
                thread::sleep(self.policy.attempt_backoff);
            }
        }

        error!(
            "link association exhausted {} attempts, last fault: {last_fault}",
            self.policy.max_attempts
        );
        Err(LinkFault::RetriesExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    /// Force a clean link-layer state: radio off, brief settle, station mode
    /// back on with power saving disabled.
    fn reset_link_layer(&mut self) -> Result<(), LinkFault> {
        self.driver.disable()?;
        thread::sleep(self.policy.settle_delay);
        self.driver.enable_station()?;
        self.driver.set_power_saving(false)?;
        Ok(())
    }

    /// Poll the driver within the attempt budget. Conclusive failures break
    /// out early instead of burning the remaining polls.
    fn poll_until_conclusive(&mut self) -> Result<Ipv4Addr, LinkFault> {
        for poll in 1..=self.policy.poll_budget {
            thread::sleep(self.policy.poll_interval);
            match self.driver.poll_status() {
                LinkStatus::Associated(address) => return Ok(address),
                LinkStatus::AuthRejected => {
                    debug!("conclusive failure after {poll} polls: auth rejected");
                    return Err(LinkFault::AuthRejected);
                }
                LinkStatus::NetworkNotFound => {
                    debug!("conclusive failure after {poll} polls: network not found");
                    return Err(LinkFault::NetworkNotFound);
                }
                LinkStatus::Idle | LinkStatus::Associating | LinkStatus::Failed => {}
            }
        }
        Err(LinkFault::RetriesExhausted { attempts: 1 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i2c_arbiter::{spawn_panel_arbiter, DisplayFault, TextPanelBus};
    use crate::led_manager::{IndicatorPins, PatternTiming, SignalLine};
    use parking_lot::Mutex;

    struct NullPins;
    impl IndicatorPins for NullPins {
        fn set_line(&mut self, _line: SignalLine, _on: bool) {}
    }

    struct NullPanel;
    impl TextPanelBus for NullPanel {
        fn probe(&mut self, _address: u8) -> bool {
            true
        }
        fn initialize(&mut self, _address: u8) -> Result<(), DisplayFault> {
            Ok(())
        }
        fn clear(&mut self) -> Result<(), DisplayFault> {
            Ok(())
        }
        fn write_line(&mut self, _row: u8, _text: &str) -> Result<(), DisplayFault> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Counters {
        begins: usize,
        polls: usize,
        resets: usize,
    }

    /// Scripted driver: answers each poll from a per-attempt script, with
    /// the final script entry repeated once a script runs dry.
    struct ScriptedDriver {
        scripts: Vec<Vec<LinkStatus>>,
        attempt: usize,
        poll_in_attempt: usize,
        counters: Arc<Mutex<Counters>>,
    }

    impl ScriptedDriver {
        fn new(scripts: Vec<Vec<LinkStatus>>) -> (Self, Arc<Mutex<Counters>>) {
            let counters = Arc::new(Mutex::new(Counters::default()));
            (
                Self {
                    scripts,
                    attempt: 0,
                    poll_in_attempt: 0,
                    counters: Arc::clone(&counters),
                },
                counters,
            )
        }
    }

    impl LinkDriver for ScriptedDriver {
        fn disable(&mut self) -> Result<(), LinkFault> {
            self.counters.lock().resets += 1;
            Ok(())
        }
        fn enable_station(&mut self) -> Result<(), LinkFault> {
            Ok(())
        }
        fn set_power_saving(&mut self, _enabled: bool) -> Result<(), LinkFault> {
            Ok(())
        }
        fn begin_association(&mut self, _name: &str, _secret: &str) -> Result<(), LinkFault> {
            self.counters.lock().begins += 1;
            self.attempt += 1;
            self.poll_in_attempt = 0;
            Ok(())
        }
        fn poll_status(&mut self) -> LinkStatus {
            self.counters.lock().polls += 1;
            let script = &self.scripts[(self.attempt - 1).min(self.scripts.len() - 1)];
            let status = script
                .get(self.poll_in_attempt)
                .copied()
                .unwrap_or(*script.last().unwrap());
            self.poll_in_attempt += 1;
            status
        }
    }

    fn fast_policy() -> LinkRetryPolicy {
        LinkRetryPolicy {
            max_attempts: 3,
            poll_budget: 14,
            poll_interval: Duration::from_millis(1),
            settle_delay: Duration::ZERO,
            attempt_backoff: Duration::from_millis(1),
        }
    }

    fn unit_with_driver(
        driver: ScriptedDriver,
        policy: LinkRetryPolicy,
    ) -> (WifiLinkUnit<ScriptedDriver>, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new());
        bus.register(UnitId::Main, 16).unwrap();
        let indicator = Arc::new(StatusIndicator::new(
            Box::new(NullPins),
            PatternTiming::immediate(),
        ));
        let (display, _join) = spawn_panel_arbiter(Box::new(NullPanel)).unwrap();
        let unit = WifiLinkUnit::new(
            Arc::clone(&bus),
            indicator,
            display,
            SharedState::new(),
            driver,
            policy,
        );
        (unit, bus)
    }

    #[test]
    fn rejected_credentials_break_early_and_report_task_error() {
        let (driver, counters) = ScriptedDriver::new(vec![vec![LinkStatus::AuthRejected]]);
        let (mut unit, bus) = unit_with_driver(driver, fast_policy());

        let request = TaskMessage::new(UnitId::Main, UnitId::Link, MessageKind::LinkInitRequest)
            .with_text1("lab-ap")
            .with_text2("wrong-secret");
        unit.handle_init_request(&request);

        let seen = counters.lock().clone();
        // Exactly three attempts, each ending on the first conclusive poll:
        // far below the 3 x 14 poll budget.
        assert_eq!(seen.begins, 3);
        assert_eq!(seen.polls, 3);
        assert_eq!(seen.resets, 3);

        let reply = bus
            .receive(UnitId::Main, Duration::from_millis(200))
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, MessageKind::TaskError);
        assert_eq!(reply.source, UnitId::Link);
        assert!(!unit.state.link_connected());
    }

    #[test]
    fn success_on_second_attempt_reports_the_attempt_number() {
        let address = Ipv4Addr::new(10, 0, 0, 42);
        let (driver, counters) = ScriptedDriver::new(vec![
            vec![LinkStatus::NetworkNotFound],
            vec![LinkStatus::Associating, LinkStatus::Associated(address)],
        ]);
        let (mut unit, bus) = unit_with_driver(driver, fast_policy());

        let request = TaskMessage::new(UnitId::Main, UnitId::Link, MessageKind::LinkInitRequest)
            .with_text1("lab-ap")
            .with_text2("secret");
        unit.handle_init_request(&request);

        let reply = bus
            .receive(UnitId::Main, Duration::from_millis(200))
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, MessageKind::LinkInitDone);
        assert_eq!(reply.int_value, 2);
        assert_eq!(reply.text1, address.to_string());
        assert!(unit.state.link_connected());
        assert_eq!(counters.lock().begins, 2);
    }

    #[test]
    fn inconclusive_polls_run_the_whole_budget() {
        let (driver, counters) = ScriptedDriver::new(vec![vec![LinkStatus::Associating]]);
        let mut policy = fast_policy();
        policy.max_attempts = 1;
        policy.poll_budget = 5;
        let (mut unit, _bus) = unit_with_driver(driver, policy);

        let result = unit.connect_with_retry("lab-ap", "secret");
        assert!(matches!(result, Err(LinkFault::RetriesExhausted { .. })));
        assert_eq!(counters.lock().polls, 5);
    }

    #[test]
    fn startup_request_is_acknowledged() {
        let (driver, _counters) = ScriptedDriver::new(vec![vec![LinkStatus::Idle]]);
        let (unit, bus) = unit_with_driver(driver, fast_policy());

        unit.acknowledge_startup(UnitId::Main);
        let reply = bus
            .receive(UnitId::Main, Duration::from_millis(200))
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, MessageKind::StartupAck);
        assert_eq!(reply.source, UnitId::Link);
    }
}
