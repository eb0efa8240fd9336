// Shared runtime state for task coordination
// One instance is constructed at startup and handed by Arc into every unit;
// there is deliberately no global static.

use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;

/// Coarse device lifecycle state. This core only ever moves Init -> Normal
/// (steady operation reached) or Init -> Error (boot aborted); the recovery
/// and update modes belong to collaborators outside this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRuntimeState {
    Init,
    Normal,
    RecoveryMode,
    UpdateMode,
    Error,
}

impl DeviceRuntimeState {
    pub fn as_name(self) -> &'static str {
        match self {
            DeviceRuntimeState::Init => "init",
            DeviceRuntimeState::Normal => "normal",
            DeviceRuntimeState::RecoveryMode => "recovery",
            DeviceRuntimeState::UpdateMode => "update",
            DeviceRuntimeState::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemState {
    pub runtime_state: DeviceRuntimeState,
    pub link_connected: bool,
    pub link_address: Option<Ipv4Addr>,
    pub broker_connected: bool,
}

impl SystemState {
    pub const fn new() -> Self {
        Self {
            runtime_state: DeviceRuntimeState::Init,
            link_connected: false,
            link_address: None,
            broker_connected: false,
        }
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle shared between the orchestrator and the connectivity units.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<SystemState>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SystemState::new())),
        }
    }

    pub fn snapshot(&self) -> SystemState {
        self.inner.lock().clone()
    }

    pub fn set_runtime_state(&self, state: DeviceRuntimeState) {
        let mut guard = self.inner.lock();
        log::info!(
            "runtime state {} -> {}",
            guard.runtime_state.as_name(),
            state.as_name()
        );
        guard.runtime_state = state;
    }

    pub fn runtime_state(&self) -> DeviceRuntimeState {
        self.inner.lock().runtime_state
    }

    pub fn set_link_connected(&self, address: Option<Ipv4Addr>) {
        let mut guard = self.inner.lock();
        guard.link_connected = address.is_some();
        guard.link_address = address;
    }

    pub fn link_connected(&self) -> bool {
        self.inner.lock().link_connected
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.inner.lock().broker_connected = connected;
    }

    pub fn broker_connected(&self) -> bool {
        self.inner.lock().broker_connected
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_init_with_nothing_connected() {
        let state = SharedState::new();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.runtime_state, DeviceRuntimeState::Init);
        assert!(!snapshot.link_connected);
        assert!(snapshot.link_address.is_none());
        assert!(!snapshot.broker_connected);
    }

    #[test]
    fn link_address_and_flag_move_together() {
        let state = SharedState::new();
        state.set_link_connected(Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert!(state.link_connected());

        state.set_link_connected(None);
        assert!(!state.link_connected());
        assert!(state.snapshot().link_address.is_none());
    }
}
