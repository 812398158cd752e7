pub mod proxmox;

#[cfg(test)]
pub mod fake;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Logical identity of a member of the VM pair, fixed at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmRole {
    Linux,
    Windows,
}

impl VmRole {
    /// The other member of the pair.
    pub fn other(self) -> Self {
        match self {
            VmRole::Linux => VmRole::Windows,
            VmRole::Windows => VmRole::Linux,
        }
    }

    /// Human-facing name used in chat messages and CLI output.
    pub fn display_name(self) -> &'static str {
        match self {
            VmRole::Linux => "Linux",
            VmRole::Windows => "Windows",
        }
    }
}

impl fmt::Display for VmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmRole::Linux => write!(f, "linux"),
            VmRole::Windows => write!(f, "windows"),
        }
    }
}

impl FromStr for VmRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(VmRole::Linux),
            "windows" | "win" => Ok(VmRole::Windows),
            other => Err(format!("unknown VM role '{}' (expected linux or windows)", other)),
        }
    }
}

/// A VM as the hypervisor knows it: its role plus the Proxmox VM id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VmIdentity {
    pub role: VmRole,
    pub vmid: u32,
}

/// The two VMs sharing the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmPair {
    pub linux: VmIdentity,
    pub windows: VmIdentity,
}

impl VmPair {
    pub fn new(linux_vmid: u32, windows_vmid: u32) -> Self {
        Self {
            linux: VmIdentity { role: VmRole::Linux, vmid: linux_vmid },
            windows: VmIdentity { role: VmRole::Windows, vmid: windows_vmid },
        }
    }

    pub fn get(&self, role: VmRole) -> &VmIdentity {
        match role {
            VmRole::Linux => &self.linux,
            VmRole::Windows => &self.windows,
        }
    }
}

/// Power state as reported live by the hypervisor. Never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmPowerState {
    Running,
    Stopped,
    /// The hypervisor could not be asked, or reported something other than
    /// running/stopped (paused, suspended, ...).
    Unknown,
}

impl fmt::Display for VmPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmPowerState::Running => write!(f, "running"),
            VmPowerState::Stopped => write!(f, "stopped"),
            VmPowerState::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("hypervisor unreachable: {0}")]
    Unreachable(String),

    #[error("hypervisor rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("hypervisor call timed out")]
    Timeout,

    #[error("unexpected hypervisor response: {0}")]
    Decode(String),
}

/// VM lifecycle operations the switch logic needs from the hypervisor.
///
/// `stop_graceful` only asks the guest to shut down; it returns before the VM
/// is actually off. Callers confirm with `power_state`.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn power_state(&self, vm: &VmIdentity) -> Result<VmPowerState, HypervisorError>;

    async fn start(&self, vm: &VmIdentity) -> Result<(), HypervisorError>;

    async fn stop_graceful(&self, vm: &VmIdentity) -> Result<(), HypervisorError>;

    async fn stop_force(&self, vm: &VmIdentity) -> Result<(), HypervisorError>;
}

/// Run a hypervisor call with an upper bound on how long it may take.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, HypervisorError>
where
    F: Future<Output = Result<T, HypervisorError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(HypervisorError::Timeout),
    }
}

/// Query a VM's power state, folding any failure into `Unknown`.
pub async fn power_state_or_unknown(
    hypervisor: &dyn Hypervisor,
    vm: &VmIdentity,
    limit: Duration,
) -> VmPowerState {
    match bounded(limit, hypervisor.power_state(vm)).await {
        Ok(state) => state,
        Err(e) => {
            warn!(role = %vm.role, vmid = vm.vmid, error = %e, "power state query failed, reporting unknown");
            VmPowerState::Unknown
        }
    }
}
