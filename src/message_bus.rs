// Inter-task message bus
// Point-to-point delivery over per-unit bounded queues, one queue per UnitId.
// Every send targets exactly one destination queue; there is no broadcast.

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::RwLock;
use thiserror::Error;

/// Upper bound for each of the three free-form text fields of a message.
/// Longer inputs are truncated on a char boundary by the builders.
pub const TEXT_FIELD_MAX: usize = 64;

/// Logical execution units of the device. At most one queue exists per id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitId {
    Unknown,
    Main,
    Link,
    Broker,
    Bus,
    Indicator,
    Display,
    ExternalDevice,
    Filesystem,
    Certification,
    Update,
}

impl UnitId {
    pub fn is_valid(self) -> bool {
        self != UnitId::Unknown
    }

    pub fn as_name(self) -> &'static str {
        match self {
            UnitId::Unknown => "unknown",
            UnitId::Main => "main",
            UnitId::Link => "link",
            UnitId::Broker => "broker",
            UnitId::Bus => "bus",
            UnitId::Indicator => "indicator",
            UnitId::Display => "display",
            UnitId::ExternalDevice => "externalDevice",
            UnitId::Filesystem => "filesystem",
            UnitId::Certification => "certification",
            UnitId::Update => "update",
        }
    }
}

/// Message discriminator. Request/Done pairs drive the boot phase gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    StartupRequest,
    StartupAck,
    Heartbeat,
    LinkInitRequest,
    LinkInitDone,
    BrokerInitRequest,
    BrokerInitDone,
    PublishRequest,
    PublishDone,
    TaskError,
}

/// One inter-task message. Transient and stack-scoped; never persisted.
#[derive(Debug, Clone)]
pub struct TaskMessage {
    pub source: UnitId,
    pub dest: UnitId,
    pub kind: MessageKind,
    pub int_value: i32,
    pub bool_value: bool,
    pub text1: String,
    pub text2: String,
    pub text3: String,
}

impl TaskMessage {
    pub fn new(source: UnitId, dest: UnitId, kind: MessageKind) -> Self {
        Self {
            source,
            dest,
            kind,
            int_value: 0,
            bool_value: false,
            text1: String::new(),
            text2: String::new(),
            text3: String::new(),
        }
    }

    pub fn with_int(mut self, value: i32) -> Self {
        self.int_value = value;
        self
    }

    pub fn with_bool(mut self, value: bool) -> Self {
        self.bool_value = value;
        self
    }

    pub fn with_text1(mut self, text: &str) -> Self {
        self.text1 = bounded_text(text);
        self
    }

    pub fn with_text2(mut self, text: &str) -> Self {
        self.text2 = bounded_text(text);
        self
    }

    pub fn with_text3(mut self, text: &str) -> Self {
        self.text3 = bounded_text(text);
        self
    }
}

/// Truncate to TEXT_FIELD_MAX bytes without splitting a char.
fn bounded_text(text: &str) -> String {
    if text.len() <= TEXT_FIELD_MAX {
        return text.to_string();
    }
    let mut end = TEXT_FIELD_MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("invalid unit id for queue operation")]
    InvalidUnit,
    #[error("queue capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),
    #[error("no queue registered for destination {0}")]
    ChannelMissing(&'static str),
    #[error("queue for destination {0} stayed full past the send timeout")]
    ChannelFull(&'static str),
}

struct MailSlot {
    tx: Sender<TaskMessage>,
    rx: Receiver<TaskMessage>,
}

/// Registry of per-unit bounded queues. Constructed once at startup and
/// shared by reference into every component; queues are never resized or
/// removed for the lifetime of the process.
pub struct MessageBus {
    slots: RwLock<HashMap<UnitId, MailSlot>>,
}

impl MessageBus {
    pub fn new() -> Self {
        info!("message bus initialized");
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Create the receive queue for `id` with the given fixed capacity.
    /// Registering an already-registered unit is accepted with a warning and
    /// leaves the existing queue untouched.
    pub fn register(&self, id: UnitId, capacity: usize) -> Result<(), BusError> {
        if !id.is_valid() {
            return Err(BusError::InvalidUnit);
        }
        if capacity == 0 {
            return Err(BusError::InvalidCapacity(capacity));
        }

        let mut slots = self.slots.write();
        if slots.contains_key(&id) {
            warn!("queue for {} already registered, keeping existing", id.as_name());
            return Ok(());
        }
        let (tx, rx) = bounded(capacity);
        slots.insert(id, MailSlot { tx, rx });
        info!("queue registered. unit={} capacity={}", id.as_name(), capacity);
        Ok(())
    }

    /// Deliver `message` to its destination queue, waiting up to `timeout`
    /// for space. Back-pressure is a hard failure, never unbounded growth.
    pub fn send(&self, message: TaskMessage, timeout: Duration) -> Result<(), BusError> {
        let dest = message.dest;
        if !dest.is_valid() {
            return Err(BusError::InvalidUnit);
        }
        let tx = {
            let slots = self.slots.read();
            match slots.get(&dest) {
                Some(slot) => slot.tx.clone(),
                None => return Err(BusError::ChannelMissing(dest.as_name())),
            }
        };
        match tx.send_timeout(message, timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(BusError::ChannelFull(dest.as_name())),
            // The registry keeps a receiver alive for every queue, so a
            // disconnect can only mean the slot was never registered.
            Err(SendTimeoutError::Disconnected(_)) => Err(BusError::ChannelMissing(dest.as_name())),
        }
    }

    /// Receive the next message for `id`, blocking up to `timeout`.
    /// Expiry yields `Ok(None)`; only a missing queue is an error.
    pub fn receive(&self, id: UnitId, timeout: Duration) -> Result<Option<TaskMessage>, BusError> {
        if !id.is_valid() {
            return Err(BusError::InvalidUnit);
        }
        let rx = {
            let slots = self.slots.read();
            match slots.get(&id) {
                Some(slot) => slot.rx.clone(),
                None => return Err(BusError::ChannelMissing(id.as_name())),
            }
        };
        match rx.recv_timeout(timeout) {
            Ok(message) => {
                debug!(
                    "message received. unit={} kind={:?} from={}",
                    id.as_name(),
                    message.kind,
                    message.source.as_name()
                );
                Ok(Some(message))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BusError::ChannelMissing(id.as_name())),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn register_rejects_invalid_arguments() {
        let bus = MessageBus::new();
        assert_eq!(bus.register(UnitId::Unknown, 8), Err(BusError::InvalidUnit));
        assert_eq!(bus.register(UnitId::Link, 0), Err(BusError::InvalidCapacity(0)));
    }

    #[test]
    fn register_twice_keeps_the_original_queue() {
        let bus = MessageBus::new();
        bus.register(UnitId::Link, 2).unwrap();

        // Fill the original two-slot queue, then re-register. If a second
        // queue were created the next send would find room again.
        for _ in 0..2 {
            bus.send(TaskMessage::new(UnitId::Main, UnitId::Link, MessageKind::Heartbeat), SHORT)
                .unwrap();
        }
        bus.register(UnitId::Link, 16).unwrap();
        let overflow =
            bus.send(TaskMessage::new(UnitId::Main, UnitId::Link, MessageKind::Heartbeat), SHORT);
        assert_eq!(overflow, Err(BusError::ChannelFull("link")));
    }

    #[test]
    fn send_to_unregistered_destination_fails() {
        let bus = MessageBus::new();
        let result =
            bus.send(TaskMessage::new(UnitId::Main, UnitId::Broker, MessageKind::Heartbeat), SHORT);
        assert_eq!(result, Err(BusError::ChannelMissing("broker")));
    }

    #[test]
    fn full_queue_applies_back_pressure_within_timeout() {
        let bus = MessageBus::new();
        bus.register(UnitId::Display, 1).unwrap();
        bus.send(TaskMessage::new(UnitId::Main, UnitId::Display, MessageKind::Heartbeat), SHORT)
            .unwrap();

        let started = std::time::Instant::now();
        let result =
            bus.send(TaskMessage::new(UnitId::Main, UnitId::Display, MessageKind::Heartbeat), SHORT);
        assert_eq!(result, Err(BusError::ChannelFull("display")));
        assert!(started.elapsed() >= SHORT);

        // The failed send left the queue intact: the original message is
        // still the only one there.
        let first = bus.receive(UnitId::Display, SHORT).unwrap().unwrap();
        assert_eq!(first.kind, MessageKind::Heartbeat);
        assert!(bus.receive(UnitId::Display, SHORT).unwrap().is_none());
    }

    #[test]
    fn receive_returns_none_at_or_after_timeout() {
        let bus = MessageBus::new();
        bus.register(UnitId::Main, 4).unwrap();

        let timeout = Duration::from_millis(50);
        let started = std::time::Instant::now();
        let result = bus.receive(UnitId::Main, timeout).unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= timeout);
    }

    #[test]
    fn delivery_is_fifo_per_destination() {
        let bus = MessageBus::new();
        bus.register(UnitId::Main, 8).unwrap();
        for value in 0..5 {
            bus.send(
                TaskMessage::new(UnitId::Link, UnitId::Main, MessageKind::Heartbeat)
                    .with_int(value),
                SHORT,
            )
            .unwrap();
        }
        for expected in 0..5 {
            let message = bus.receive(UnitId::Main, SHORT).unwrap().unwrap();
            assert_eq!(message.int_value, expected);
        }
    }

    #[test]
    fn text_fields_are_truncated_on_a_char_boundary() {
        let long = "a".repeat(TEXT_FIELD_MAX + 10);
        let message =
            TaskMessage::new(UnitId::Main, UnitId::Link, MessageKind::LinkInitRequest)
                .with_text1(&long)
                .with_text2("käse")
                .with_text3("");
        assert_eq!(message.text1.len(), TEXT_FIELD_MAX);
        assert_eq!(message.text2, "käse");
        assert!(message.text3.is_empty());

        let multibyte = "é".repeat(TEXT_FIELD_MAX); // 2 bytes per char
        let truncated = bounded_text(&multibyte);
        assert!(truncated.len() <= TEXT_FIELD_MAX);
        assert!(truncated.is_char_boundary(truncated.len()));
    }
}
