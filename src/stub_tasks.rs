// Peripheral stub units
// Placeholder execution units for peripherals that have no real logic yet.
// Each one owns a queue, answers the startup handshake, and drops the rest.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};

use crate::message_bus::{MessageBus, MessageKind, TaskMessage, UnitId};

pub const STUB_QUEUE_CAPACITY: usize = 8;

const REPLY_SEND_TIMEOUT: Duration = Duration::from_millis(200);
const IDLE_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// The peripheral roles currently running as stubs.
pub const STUB_UNITS: [UnitId; 5] = [
    UnitId::Display,
    UnitId::ExternalDevice,
    UnitId::Filesystem,
    UnitId::Certification,
    UnitId::Update,
];

/// Register `id`'s queue and park a minimal run loop on its own thread.
pub fn spawn_stub_unit(bus: Arc<MessageBus>, id: UnitId) -> anyhow::Result<JoinHandle<()>> {
    bus.register(id, STUB_QUEUE_CAPACITY)?;
    let join = thread::Builder::new()
        .name(format!("stub-{}", id.as_name()))
        .spawn(move || run_loop(&bus, id))?;
    Ok(join)
}

fn run_loop(bus: &MessageBus, id: UnitId) {
    info!("stub unit {} started (skeleton)", id.as_name());
    loop {
        match bus.receive(id, IDLE_RECEIVE_TIMEOUT) {
            Ok(Some(message)) if message.kind == MessageKind::StartupRequest => {
                let ack =
                    TaskMessage::new(id, message.source, MessageKind::StartupAck).with_int(1);
                if let Err(e) = bus.send(ack, REPLY_SEND_TIMEOUT) {
                    error!("stub unit {} failed to send startup ack: {e}", id.as_name());
                }
            }
            Ok(Some(message)) => {
                debug!("stub unit {} dropping {:?}", id.as_name(), message.kind)
            }
            Ok(None) => continue,
            Err(e) => {
                error!("stub unit {} receive failed, stopping: {e}", id.as_name());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_acknowledges_startup_and_drops_everything_else() {
        let bus = Arc::new(MessageBus::new());
        bus.register(UnitId::Main, 16).unwrap();
        let _join = spawn_stub_unit(Arc::clone(&bus), UnitId::Display).unwrap();

        bus.send(
            TaskMessage::new(UnitId::Main, UnitId::Display, MessageKind::Heartbeat),
            Duration::from_millis(100),
        )
        .unwrap();
        bus.send(
            TaskMessage::new(UnitId::Main, UnitId::Display, MessageKind::StartupRequest),
            Duration::from_millis(100),
        )
        .unwrap();

        let ack = bus
            .receive(UnitId::Main, Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(ack.kind, MessageKind::StartupAck);
        assert_eq!(ack.source, UnitId::Display);
    }
}
