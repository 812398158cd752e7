use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::lock::LockStore;
use crate::vm::{power_state_or_unknown, Hypervisor, VmPair, VmPowerState, VmRole};

/// Snapshot of both VMs and the lock flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub linux: VmPowerState,
    pub windows: VmPowerState,
    pub locked: bool,
}

impl StatusReport {
    pub fn state_of(&self, role: VmRole) -> VmPowerState {
        match role {
            VmRole::Linux => self.linux,
            VmRole::Windows => self.windows,
        }
    }

    /// The role that is the only one reported Running, if any.
    pub fn sole_running(&self) -> Option<VmRole> {
        match (self.linux, self.windows) {
            (VmPowerState::Running, VmPowerState::Stopped) => Some(VmRole::Linux),
            (VmPowerState::Stopped, VmPowerState::Running) => Some(VmRole::Windows),
            _ => None,
        }
    }
}

/// Read-only aggregation of live VM state and the lock flag. Never fails:
/// per-VM query failures show up as `Unknown`.
pub struct StatusReporter {
    hypervisor: Arc<dyn Hypervisor>,
    vms: VmPair,
    lock_store: Arc<LockStore>,
    call_timeout: Duration,
}

impl StatusReporter {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        vms: VmPair,
        lock_store: Arc<LockStore>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            hypervisor,
            vms,
            lock_store,
            call_timeout,
        }
    }

    pub async fn report(&self) -> StatusReport {
        let (linux, windows, locked) = tokio::join!(
            self.power_state(VmRole::Linux),
            self.power_state(VmRole::Windows),
            self.lock_store.read(),
        );
        StatusReport {
            linux,
            windows,
            locked,
        }
    }

    pub async fn power_state(&self, role: VmRole) -> VmPowerState {
        power_state_or_unknown(self.hypervisor.as_ref(), self.vms.get(role), self.call_timeout).await
    }
}
