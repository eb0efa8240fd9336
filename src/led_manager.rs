// Status indicator
// Three binary LED signals (blue power, green activity, red fault) behind one
// lock so no two callers can interleave a half-finished pattern. Every public
// operation blocks for its full pattern duration while holding the lock; that
// blocking time is the visual contract, not incidental sleep.

use std::thread;
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;

/// Bounded wait for transient indications before giving up silently.
const TRANSIENT_LOCK_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalLine {
    Power,
    Activity,
    Fault,
}

/// Seam to the physical LED outputs. Implementations must be cheap and
/// infallible; a GPIO write either lands or the LED stays dark.
pub trait IndicatorPins: Send {
    fn set_line(&mut self, line: SignalLine, on: bool);
}

/// Timing table for every pattern. Defaults carry the visual contract;
/// tests zero them out to run the same sequencing instantly.
#[derive(Debug, Clone)]
pub struct PatternTiming {
    pub boot_settle: Duration,
    pub link_blink_interval: Duration,
    pub link_connected_hold: Duration,
    pub broker_blink_interval: Duration,
    pub activity_pulse_on: Duration,
    pub pulse_gap: Duration,
    pub short_pulse: Duration,
    pub reboot_pulse: Duration,
    pub pattern_rest: Duration,
}

impl Default for PatternTiming {
    fn default() -> Self {
        Self {
            boot_settle: Duration::from_millis(500),
            link_blink_interval: Duration::from_millis(500),
            link_connected_hold: Duration::from_secs(2),
            broker_blink_interval: Duration::from_millis(200),
            activity_pulse_on: Duration::from_millis(300),
            pulse_gap: Duration::from_millis(150),
            short_pulse: Duration::from_millis(150),
            reboot_pulse: Duration::from_millis(300),
            pattern_rest: Duration::from_secs(1),
        }
    }
}

impl PatternTiming {
    /// All-zero timing: full sequencing, no real-time holds.
    pub fn immediate() -> Self {
        Self {
            boot_settle: Duration::ZERO,
            link_blink_interval: Duration::ZERO,
            link_connected_hold: Duration::ZERO,
            broker_blink_interval: Duration::ZERO,
            activity_pulse_on: Duration::ZERO,
            pulse_gap: Duration::ZERO,
            short_pulse: Duration::ZERO,
            reboot_pulse: Duration::ZERO,
            pattern_rest: Duration::ZERO,
        }
    }
}

struct IndicatorCore {
    pins: Box<dyn IndicatorPins>,
    timing: PatternTiming,
    // Persistent state of the green line; activity pulses restore this.
    activity_latched: bool,
}

impl IndicatorCore {
    fn set(&mut self, line: SignalLine, on: bool) {
        self.pins.set_line(line, on);
    }

    fn hold(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }

    fn blink(&mut self, line: SignalLine, cycles: u32, interval: Duration) {
        for _ in 0..cycles {
            self.set(line, true);
            self.hold(interval);
            self.set(line, false);
            self.hold(interval);
        }
    }

    /// Repeated fault-line signature: `pulses` short pulses then a rest,
    /// the whole group `groups` times. Pulse count is what distinguishes
    /// reboot/abort/error to an observer.
    fn fault_signature(&mut self, groups: u32, pulses: u32, pulse: Duration) {
        for _ in 0..groups {
            for _ in 0..pulses {
                self.set(SignalLine::Fault, true);
                self.hold(pulse);
                self.set(SignalLine::Fault, false);
                self.hold(self.timing.pulse_gap);
            }
            self.hold(self.timing.pattern_rest);
        }
    }
}

pub struct StatusIndicator {
    core: Mutex<IndicatorCore>,
}

impl StatusIndicator {
    pub fn new(pins: Box<dyn IndicatorPins>, timing: PatternTiming) -> Self {
        Self {
            core: Mutex::new(IndicatorCore {
                pins,
                timing,
                activity_latched: false,
            }),
        }
    }

    /// Critical indications wait for the lock unconditionally; they are
    /// never allowed to be dropped.
    fn with_critical(&self, name: &str, f: impl FnOnce(&mut IndicatorCore)) {
        let mut core = self.core.lock();
        debug!("indicator pattern start: {name}");
        f(&mut core);
    }

    /// Transient indications skip silently when another pattern holds the
    /// lock past the bounded wait.
    fn with_transient(&self, name: &str, f: impl FnOnce(&mut IndicatorCore)) {
        match self.core.try_lock_for(TRANSIENT_LOCK_WAIT) {
            Some(mut core) => f(&mut core),
            None => debug!("indicator busy, skipping transient pattern: {name}"),
        }
    }

    /// Boot-time indication: everything dark through the settle window, then
    /// the blue power line on.
    pub fn booting(&self) {
        self.with_critical("booting", |core| {
            core.set(SignalLine::Power, false);
            core.set(SignalLine::Activity, false);
            core.set(SignalLine::Fault, false);
            core.activity_latched = false;
            let settle = core.timing.boot_settle;
            core.hold(settle);
            core.set(SignalLine::Power, true);
        });
        info!("💡 indicator: boot pattern shown");
    }

    /// Slow green blink while the wireless link associates.
    pub fn link_connecting(&self) {
        self.with_transient("link_connecting", |core| {
            let interval = core.timing.link_blink_interval;
            core.blink(SignalLine::Activity, 3, interval);
        });
    }

    /// Timed solid green once the link is up.
    pub fn link_connected(&self) {
        self.with_critical("link_connected", |core| {
            core.set(SignalLine::Activity, true);
            let hold = core.timing.link_connected_hold;
            core.hold(hold);
            core.set(SignalLine::Activity, false);
        });
    }

    /// Fast green blink while the broker handshake runs.
    pub fn broker_connecting(&self) {
        self.with_transient("broker_connecting", |core| {
            let interval = core.timing.broker_blink_interval;
            core.blink(SignalLine::Activity, 3, interval);
        });
    }

    /// Steady green, latched until reset; later activity pulses return here.
    pub fn broker_connected(&self) {
        self.with_critical("broker_connected", |core| {
            core.set(SignalLine::Activity, true);
            core.activity_latched = true;
        });
        info!("💡 indicator: broker connected latch on");
    }

    /// Brief off/on/off flicker that always restores the latched state.
    pub fn activity_pulse(&self) {
        self.with_transient("activity_pulse", |core| {
            let latched = core.activity_latched;
            core.set(SignalLine::Activity, false);
            let gap = core.timing.pulse_gap;
            core.hold(gap);
            core.set(SignalLine::Activity, true);
            let on = core.timing.activity_pulse_on;
            core.hold(on);
            core.set(SignalLine::Activity, latched);
        });
    }

    /// Red: one long pulse plus rest, three times.
    pub fn reboot_pattern(&self) {
        self.with_critical("reboot", |core| {
            let pulse = core.timing.reboot_pulse;
            core.fault_signature(3, 1, pulse);
        });
    }

    /// Red: two short pulses plus rest, three times.
    pub fn abort_pattern(&self) {
        self.with_critical("abort", |core| {
            let pulse = core.timing.short_pulse;
            core.fault_signature(3, 2, pulse);
        });
    }

    /// Red: four short pulses plus rest, three times.
    pub fn error_pattern(&self) {
        self.with_critical("error", |core| {
            let pulse = core.timing.short_pulse;
            core.fault_signature(3, 4, pulse);
        });
    }
}
