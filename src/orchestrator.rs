// Boot orchestrator
// Linear state machine run by the main unit. Every forward edge either
// starts a subordinate unit or is gated on a timed response; this layer
// never retries anything. Exceeding a phase gate is fatal: the abort pattern
// is shown once and the unit terminates.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::{ConfigLoader, ConnectionConfig};
use crate::i2c_arbiter::DisplayHandle;
use crate::led_manager::StatusIndicator;
use crate::message_bus::{BusError, MessageBus, MessageKind, TaskMessage, UnitId};
use crate::stub_tasks::STUB_UNITS;
use crate::system_state::{DeviceRuntimeState, SharedState};

pub const MAIN_QUEUE_CAPACITY: usize = 16;

const REQUEST_SEND_TIMEOUT: Duration = Duration::from_millis(200);
const BANNER_HOLD: Duration = Duration::from_millis(500);
const STEADY_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Boot,
    BusReady,
    ConfigLoaded,
    UnitsStarted,
    LinkRequested,
    LinkReady,
    BrokerRequested,
    BrokerReady,
    Published,
    Steady,
    Abort,
}

impl BootState {
    pub fn as_name(self) -> &'static str {
        match self {
            BootState::Boot => "boot",
            BootState::BusReady => "busReady",
            BootState::ConfigLoaded => "configLoaded",
            BootState::UnitsStarted => "unitsStarted",
            BootState::LinkRequested => "linkRequested",
            BootState::LinkReady => "linkReady",
            BootState::BrokerRequested => "brokerRequested",
            BootState::BrokerReady => "brokerReady",
            BootState::Published => "published",
            BootState::Steady => "steady",
            BootState::Abort => "abort",
        }
    }
}

/// Phase gate budgets. Defaults match the wireless and broker bring-up
/// envelopes; tests compress them.
#[derive(Debug, Clone)]
pub struct PhaseTimeouts {
    pub link_init: Duration,
    pub broker_init: Duration,
    pub publish: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            link_init: Duration::from_secs(35),
            broker_init: Duration::from_secs(20),
            publish: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("message bus failure during boot: {0}")]
    Bus(#[from] BusError),
    #[error("failed to start subordinate units: {0}")]
    UnitStart(String),
    #[error("phase gate {phase} expired after {waited:?}")]
    PhaseTimeout { phase: &'static str, waited: Duration },
    #[error("unit {unit} reported an error during {phase}: {detail}")]
    TaskFailed {
        unit: &'static str,
        phase: &'static str,
        detail: String,
    },
}

pub struct Orchestrator {
    bus: Arc<MessageBus>,
    indicator: Arc<StatusIndicator>,
    display: DisplayHandle,
    state: SharedState,
    loader: ConfigLoader,
    timeouts: PhaseTimeouts,
    current: BootState,
    trace: Vec<BootState>,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<MessageBus>,
        indicator: Arc<StatusIndicator>,
        display: DisplayHandle,
        state: SharedState,
        loader: ConfigLoader,
        timeouts: PhaseTimeouts,
    ) -> Self {
        Self {
            bus,
            indicator,
            display,
            state,
            loader,
            timeouts,
            current: BootState::Boot,
            trace: Vec::new(),
        }
    }

    /// Visited states in order, for diagnostics and post-mortems.
    pub fn trace(&self) -> &[BootState] {
        &self.trace
    }

    pub fn current_state(&self) -> BootState {
        self.current
    }

    fn transition(&mut self, next: BootState) {
        info!("orchestrator {} -> {}", self.current.as_name(), next.as_name());
        self.current = next;
        self.trace.push(next);
    }

    /// Run the boot sequence to Steady. `launcher` must start every
    /// subordinate unit (registering queues before returning so requests
    /// cannot race registration). Any failure ends in Abort; this method
    /// returning is the unit terminating.
    pub fn run(
        &mut self,
        launcher: impl FnOnce(&ConnectionConfig) -> anyhow::Result<()>,
    ) -> Result<(), BootError> {
        match self.boot_sequence(launcher) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("❌ boot aborted: {e}");
                self.state.set_runtime_state(DeviceRuntimeState::Error);
                self.indicator.abort_pattern();
                self.transition(BootState::Abort);
                Err(e)
            }
        }
    }

    fn boot_sequence(
        &mut self,
        launcher: impl FnOnce(&ConnectionConfig) -> anyhow::Result<()>,
    ) -> Result<(), BootError> {
        self.transition(BootState::Boot);
        self.indicator.booting();

        self.bus.register(UnitId::Main, MAIN_QUEUE_CAPACITY)?;
        self.transition(BootState::BusReady);

        let config = self.loader.load();
        self.transition(BootState::ConfigLoaded);

        launcher(&config).map_err(|e| BootError::UnitStart(e.to_string()))?;
        self.transition(BootState::UnitsStarted);
        self.ping_stub_units();

        // Boot banner is best-effort: a missing panel must never stop the
        // boot sequence.
        if !self.display.request_text("START", "", BANNER_HOLD) {
            warn!("boot banner render request failed");
        }

        let link_request =
            TaskMessage::new(UnitId::Main, UnitId::Link, MessageKind::LinkInitRequest)
                .with_text1(&config.link_name)
                .with_text2(&config.link_secret);
        self.bus.send(link_request, REQUEST_SEND_TIMEOUT)?;
        self.transition(BootState::LinkRequested);

        self.wait_for(
            "linkInit",
            MessageKind::LinkInitDone,
            UnitId::Link,
            self.timeouts.link_init,
        )?;
        self.transition(BootState::LinkReady);

        let broker_request =
            TaskMessage::new(UnitId::Main, UnitId::Broker, MessageKind::BrokerInitRequest);
        self.bus.send(broker_request, REQUEST_SEND_TIMEOUT)?;
        self.transition(BootState::BrokerRequested);

        self.wait_for(
            "brokerInit",
            MessageKind::BrokerInitDone,
            UnitId::Broker,
            self.timeouts.broker_init,
        )?;
        self.transition(BootState::BrokerReady);

        let publish_request =
            TaskMessage::new(UnitId::Main, UnitId::Broker, MessageKind::PublishRequest);
        self.bus.send(publish_request, REQUEST_SEND_TIMEOUT)?;
        self.wait_for(
            "publish",
            MessageKind::PublishDone,
            UnitId::Broker,
            self.timeouts.publish,
        )?;
        self.transition(BootState::Published);

        if !self.display.request_text("DONE", "", BANNER_HOLD) {
            warn!("done banner render request failed");
        }

        self.state.set_runtime_state(DeviceRuntimeState::Normal);
        self.transition(BootState::Steady);
        info!("✅ boot sequence complete, entering steady operation");
        Ok(())
    }

    /// Probe the peripheral stubs. Their acks are informational only; a
    /// missing stub is logged, never fatal.
    fn ping_stub_units(&self) {
        for unit in STUB_UNITS {
            let probe = TaskMessage::new(UnitId::Main, unit, MessageKind::StartupRequest);
            if let Err(e) = self.bus.send(probe, REQUEST_SEND_TIMEOUT) {
                warn!("startup probe to {} failed: {e}", unit.as_name());
            }
        }
    }

    /// Block until `kind` arrives from `sender` or the gate expires.
    /// A TaskError from the expected sender fails the gate immediately;
    /// anything else (stub acks, stale replies) is drained and logged.
    fn wait_for(
        &self,
        phase: &'static str,
        kind: MessageKind,
        sender: UnitId,
        timeout: Duration,
    ) -> Result<TaskMessage, BootError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BootError::PhaseTimeout {
                    phase,
                    waited: timeout,
                });
            }
            match self.bus.receive(UnitId::Main, remaining)? {
                Some(message) if message.kind == kind && message.source == sender => {
                    return Ok(message);
                }
                Some(message)
                    if message.kind == MessageKind::TaskError && message.source == sender =>
                {
                    return Err(BootError::TaskFailed {
                        unit: sender.as_name(),
                        phase,
                        detail: message.text1,
                    });
                }
                Some(message) => {
                    debug!(
                        "gate {phase}: draining unrelated {:?} from {}",
                        message.kind,
                        message.source.as_name()
                    );
                }
                None => {
                    return Err(BootError::PhaseTimeout {
                        phase,
                        waited: timeout,
                    });
                }
            }
        }
    }

    /// Post-boot service loop for the main unit. Returns only if the main
    /// queue disappears, which cannot happen in normal operation.
    pub fn steady_loop(&self) {
        loop {
            match self.bus.receive(UnitId::Main, STEADY_RECEIVE_TIMEOUT) {
                Ok(Some(message)) => match message.kind {
                    MessageKind::TaskError => error!(
                        "steady: unit {} reported an error: {}",
                        message.source.as_name(),
                        message.text1
                    ),
                    MessageKind::Heartbeat => {
                        debug!("steady: heartbeat from {}", message.source.as_name())
                    }
                    other => debug!(
                        "steady: ignoring {:?} from {}",
                        other,
                        message.source.as_name()
                    ),
                },
                Ok(None) => continue,
                Err(e) => {
                    error!("steady loop receive failed, leaving: {e}");
                    return;
                }
            }
        }
    }
}
