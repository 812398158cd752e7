use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, trace};

use super::{Hypervisor, HypervisorError, VmIdentity, VmPowerState};
use crate::config::ProxmoxConfig;

/// Proxmox VE REST client scoped to a single node.
///
/// Authenticates with an API token (`PVEAPIToken=user!name=secret`) rather
/// than a ticket, so there is no session to refresh.
pub struct ProxmoxClient {
    http: Client,
    base_url: String,
    node: String,
    auth_header: String,
}

/// Proxmox wraps every payload in `{"data": ...}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct CurrentStatus {
    status: String,
}

impl ProxmoxClient {
    pub fn new(config: &ProxmoxConfig) -> Result<Self> {
        Self::with_base_url(config, config.api_base_url())
    }

    /// Build a client against an explicit API root (`.../api2/json`).
    pub fn with_base_url(config: &ProxmoxConfig, base_url: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .context("building Proxmox HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            node: config.node.clone(),
            auth_header: format!(
                "PVEAPIToken={}!{}={}",
                config.user, config.token_name, config.token_value
            ),
        })
    }

    fn status_url(&self, vm: &VmIdentity, action: &str) -> String {
        format!(
            "{}/nodes/{}/qemu/{}/status/{}",
            self.base_url, self.node, vm.vmid, action
        )
    }

    async fn post_action(&self, vm: &VmIdentity, action: &str) -> Result<(), HypervisorError> {
        let url = self.status_url(vm, action);
        debug!(role = %vm.role, vmid = vm.vmid, action, "issuing Proxmox VM action");

        let response = self
            .http
            .post(&url)
            .header("Authorization", &self.auth_header)
            .send()
            .await
            .map_err(map_transport_error)?;

        check_status(response).await?;
        Ok(())
    }
}

fn map_transport_error(e: reqwest::Error) -> HypervisorError {
    if e.is_timeout() {
        HypervisorError::Timeout
    } else {
        HypervisorError::Unreachable(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, HypervisorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(HypervisorError::Rejected {
        status: status.as_u16(),
        body: if body.is_empty() {
            status.canonical_reason().unwrap_or("no reason").to_string()
        } else {
            body
        },
    })
}

/// Map a Proxmox `status` string to a power state.
pub(crate) fn parse_power_state(status: &str) -> VmPowerState {
    match status {
        "running" => VmPowerState::Running,
        "stopped" => VmPowerState::Stopped,
        _ => VmPowerState::Unknown,
    }
}

#[async_trait]
impl Hypervisor for ProxmoxClient {
    async fn power_state(&self, vm: &VmIdentity) -> Result<VmPowerState, HypervisorError> {
        let url = self.status_url(vm, "current");
        let response = self
            .http
            .get(&url)
            .header("Authorization", &self.auth_header)
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response).await?;

        let body: Envelope<CurrentStatus> = response
            .json()
            .await
            .map_err(|e| HypervisorError::Decode(e.to_string()))?;

        let state = parse_power_state(&body.data.status);
        trace!(role = %vm.role, vmid = vm.vmid, status = %body.data.status, "Proxmox VM status");
        Ok(state)
    }

    async fn start(&self, vm: &VmIdentity) -> Result<(), HypervisorError> {
        self.post_action(vm, "start").await
    }

    async fn stop_graceful(&self, vm: &VmIdentity) -> Result<(), HypervisorError> {
        self.post_action(vm, "shutdown").await
    }

    async fn stop_force(&self, vm: &VmIdentity) -> Result<(), HypervisorError> {
        self.post_action(vm, "stop").await
    }
}
