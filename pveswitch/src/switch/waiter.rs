use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SwitchConfig;
use crate::vm::{bounded, power_state_or_unknown, Hypervisor, VmIdentity, VmPowerState};

/// How a VM ended up stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopVia {
    Graceful,
    Forced,
}

/// The VM was still not confirmed stopped after the forced stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StillRunning;

/// Waits for a VM that was asked to shut down gracefully, forcing it off if
/// the guest does not comply within the grace period.
#[derive(Debug, Clone)]
pub struct ShutdownWaiter {
    poll_interval: Duration,
    grace_period: Duration,
    force_confirm_window: Duration,
    call_timeout: Duration,
}

impl ShutdownWaiter {
    pub fn new(
        poll_interval: Duration,
        grace_period: Duration,
        force_confirm_window: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            poll_interval,
            grace_period,
            force_confirm_window,
            call_timeout,
        }
    }

    pub fn from_config(config: &SwitchConfig) -> Self {
        Self::new(
            config.poll_interval(),
            config.shutdown_timeout(),
            config.force_confirm_timeout(),
            config.call_timeout(),
        )
    }

    /// Block until `vm` reports Stopped.
    ///
    /// `on_escalate` runs once, right before the forced stop is issued. An
    /// `Unknown` state never counts as stopped.
    pub async fn wait_for_stop<F>(
        &self,
        hypervisor: &dyn Hypervisor,
        vm: &VmIdentity,
        on_escalate: F,
    ) -> Result<StopVia, StillRunning>
    where
        F: FnOnce(),
    {
        if self.poll_until_stopped(hypervisor, vm, self.grace_period).await {
            info!(role = %vm.role, vmid = vm.vmid, "VM shut down gracefully");
            return Ok(StopVia::Graceful);
        }

        warn!(
            role = %vm.role,
            vmid = vm.vmid,
            grace_secs = self.grace_period.as_secs(),
            "VM did not shut down within grace period, forcing stop"
        );
        on_escalate();

        if let Err(e) = bounded(self.call_timeout, hypervisor.stop_force(vm)).await {
            // The stop may still land; the confirmation window decides.
            warn!(role = %vm.role, vmid = vm.vmid, error = %e, "forced stop request failed");
        }

        if self
            .poll_until_stopped(hypervisor, vm, self.force_confirm_window)
            .await
        {
            info!(role = %vm.role, vmid = vm.vmid, "VM stopped after forced stop");
            return Ok(StopVia::Forced);
        }

        warn!(role = %vm.role, vmid = vm.vmid, "VM still not stopped after forced stop");
        Err(StillRunning)
    }

    /// Poll every `poll_interval` until Stopped or `window` elapses. Returns
    /// as soon as Stopped is observed.
    async fn poll_until_stopped(
        &self,
        hypervisor: &dyn Hypervisor,
        vm: &VmIdentity,
        window: Duration,
    ) -> bool {
        let deadline = Instant::now() + window;
        loop {
            let state = power_state_or_unknown(hypervisor, vm, self.call_timeout).await;
            if state == VmPowerState::Stopped {
                return true;
            }
            debug!(role = %vm.role, vmid = vm.vmid, %state, "waiting for VM to stop");

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline - now;
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}
