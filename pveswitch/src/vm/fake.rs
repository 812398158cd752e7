//! Scripted in-memory hypervisor for tests. Records every call it receives.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Hypervisor, HypervisorError, VmIdentity, VmPowerState, VmRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    PowerState(VmRole),
    Start(VmRole),
    StopGraceful(VmRole),
    StopForce(VmRole),
}

struct Inner {
    states: HashMap<VmRole, VmPowerState>,
    /// Polls a graceful stop needs before it lands. `None` means the guest
    /// never shuts down on its own.
    graceful_polls: HashMap<VmRole, Option<u32>>,
    pending_graceful: HashMap<VmRole, u32>,
    force_effective: bool,
    fail_start: bool,
    fail_graceful: bool,
    fail_queries: bool,
    hang_start: bool,
    calls: Vec<Call>,
}

/// How long a hung call blocks; far beyond any configured call timeout.
const HANG: Duration = Duration::from_secs(3600);

pub struct FakeHypervisor {
    inner: Mutex<Inner>,
}

impl FakeHypervisor {
    pub fn new(linux: VmPowerState, windows: VmPowerState) -> Self {
        let mut states = HashMap::new();
        states.insert(VmRole::Linux, linux);
        states.insert(VmRole::Windows, windows);
        let mut graceful_polls = HashMap::new();
        graceful_polls.insert(VmRole::Linux, Some(1));
        graceful_polls.insert(VmRole::Windows, Some(1));
        Self {
            inner: Mutex::new(Inner {
                states,
                graceful_polls,
                pending_graceful: HashMap::new(),
                force_effective: true,
                fail_start: false,
                fail_graceful: false,
                fail_queries: false,
                hang_start: false,
                calls: Vec::new(),
            }),
        }
    }

    pub fn set_graceful_polls(&self, role: VmRole, polls: Option<u32>) {
        self.inner.lock().unwrap().graceful_polls.insert(role, polls);
    }

    pub fn set_force_effective(&self, effective: bool) {
        self.inner.lock().unwrap().force_effective = effective;
    }

    pub fn fail_start(&self, fail: bool) {
        self.inner.lock().unwrap().fail_start = fail;
    }

    pub fn fail_graceful(&self, fail: bool) {
        self.inner.lock().unwrap().fail_graceful = fail;
    }

    pub fn fail_queries(&self, fail: bool) {
        self.inner.lock().unwrap().fail_queries = fail;
    }

    /// Make `start` block for an hour before doing anything.
    pub fn hang_start(&self, hang: bool) {
        self.inner.lock().unwrap().hang_start = hang;
    }

    pub fn state(&self, role: VmRole) -> VmPowerState {
        self.inner.lock().unwrap().states[&role]
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: Call) -> usize {
        self.inner.lock().unwrap().calls.iter().filter(|c| **c == call).count()
    }

    /// Calls other than power-state queries.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::PowerState(_)))
            .collect()
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn power_state(&self, vm: &VmIdentity) -> Result<VmPowerState, HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::PowerState(vm.role));
        if inner.fail_queries {
            return Err(HypervisorError::Unreachable("connection refused".into()));
        }
        if let Some(remaining) = inner.pending_graceful.get_mut(&vm.role) {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                inner.pending_graceful.remove(&vm.role);
                inner.states.insert(vm.role, VmPowerState::Stopped);
            }
        }
        Ok(inner.states[&vm.role])
    }

    async fn start(&self, vm: &VmIdentity) -> Result<(), HypervisorError> {
        let hang = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(Call::Start(vm.role));
            inner.hang_start
        };
        if hang {
            tokio::time::sleep(HANG).await;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.fail_start {
            return Err(HypervisorError::Rejected {
                status: 500,
                body: "start failed".into(),
            });
        }
        inner.states.insert(vm.role, VmPowerState::Running);
        Ok(())
    }

    async fn stop_graceful(&self, vm: &VmIdentity) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::StopGraceful(vm.role));
        if inner.fail_graceful {
            return Err(HypervisorError::Rejected {
                status: 500,
                body: "shutdown failed".into(),
            });
        }
        let polls = inner.graceful_polls[&vm.role];
        match polls {
            Some(0) => {
                inner.states.insert(vm.role, VmPowerState::Stopped);
            }
            Some(polls) => {
                inner.pending_graceful.insert(vm.role, polls);
            }
            None => {}
        }
        Ok(())
    }

    async fn stop_force(&self, vm: &VmIdentity) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::StopForce(vm.role));
        if inner.force_effective {
            inner.pending_graceful.remove(&vm.role);
            inner.states.insert(vm.role, VmPowerState::Stopped);
        }
        Ok(())
    }
}
