pub mod status;
pub mod waiter;

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::config::SwitchConfig;
use crate::lock::LockStore;
use crate::vm::{bounded, Hypervisor, HypervisorError, VmPair, VmPowerState, VmRole};

use self::status::{StatusReport, StatusReporter};
use self::waiter::ShutdownWaiter;

/// Why a switch (or lock change) did not happen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchError {
    #[error("switching is locked; unlock first")]
    Locked,

    #[error("another switch is already in progress")]
    SwitchInProgress,

    #[error("{role} VM did not stop, even after a forced stop; target was not started")]
    ShutdownTimeout { role: VmRole },

    #[error("hypervisor error: {0}")]
    Upstream(String),

    #[error("cannot tell which VM is active (linux: {linux}, windows: {windows})")]
    AmbiguousState {
        linux: VmPowerState,
        windows: VmPowerState,
    },

    #[error("failed to persist lock flag: {0}")]
    Storage(String),
}

impl SwitchError {
    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            SwitchError::Locked => "LOCKED",
            SwitchError::SwitchInProgress => "SWITCH_IN_PROGRESS",
            SwitchError::ShutdownTimeout { .. } => "SHUTDOWN_TIMEOUT",
            SwitchError::Upstream(_) => "UPSTREAM_ERROR",
            SwitchError::AmbiguousState { .. } => "AMBIGUOUS_STATE",
            SwitchError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Rejected before any VM was touched.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            SwitchError::Locked
                | SwitchError::SwitchInProgress
                | SwitchError::AmbiguousState { .. }
                | SwitchError::Storage(_)
        )
    }
}

impl From<HypervisorError> for SwitchError {
    fn from(e: HypervisorError) -> Self {
        SwitchError::Upstream(e.to_string())
    }
}

impl Serialize for SwitchError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("SwitchError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

/// Result of one switch or toggle call. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwitchOutcome {
    pub success: bool,
    /// Role that was (or was assumed to be) running before the call.
    pub previous: Option<VmRole>,
    /// Role running after a successful call.
    pub new: Option<VmRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SwitchError>,
}

impl SwitchOutcome {
    fn switched(previous: Option<VmRole>, new: VmRole) -> Self {
        Self {
            success: true,
            previous,
            new: Some(new),
            error: None,
        }
    }

    fn failed(previous: Option<VmRole>, error: SwitchError) -> Self {
        Self {
            success: false,
            previous,
            new: None,
            error: Some(error),
        }
    }

    /// Target was already the only running VM; nothing was done.
    pub fn was_noop(&self) -> bool {
        self.success && self.previous.is_some() && self.previous == self.new
    }
}

/// Progress notifications published while a switch runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchEvent {
    Started { target: VmRole },
    ShuttingDown { source: VmRole },
    ForceStopping { source: VmRole },
    Starting { target: VmRole },
    Finished { target: VmRole, outcome: SwitchOutcome },
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Role(VmRole),
    Toggle,
}

/// Arbitrates the VM pair: at most one switch in flight, lock flag honoured,
/// source VM confirmed stopped before the target is started.
pub struct SwitchController {
    hypervisor: Arc<dyn Hypervisor>,
    vms: VmPair,
    lock_store: Arc<LockStore>,
    reporter: StatusReporter,
    waiter: ShutdownWaiter,
    call_timeout: Duration,
    in_flight: Mutex<()>,
    events: broadcast::Sender<SwitchEvent>,
}

impl SwitchController {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        vms: VmPair,
        lock_store: Arc<LockStore>,
        config: &SwitchConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            reporter: StatusReporter::new(
                hypervisor.clone(),
                vms,
                lock_store.clone(),
                config.call_timeout(),
            ),
            waiter: ShutdownWaiter::from_config(config),
            call_timeout: config.call_timeout(),
            hypervisor,
            vms,
            lock_store,
            in_flight: Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwitchEvent> {
        self.events.subscribe()
    }

    /// Resolves once no switch is in flight. Used on daemon shutdown so a
    /// half-finished switch is not abandoned between stop and start.
    pub async fn wait_idle(&self) {
        let _guard = self.in_flight.lock().await;
    }

    /// Best-effort status; never fails for upstream errors.
    pub async fn status(&self) -> StatusReport {
        self.reporter.report().await
    }

    pub async fn is_locked(&self) -> bool {
        self.lock_store.read().await
    }

    /// Persist the lock flag. Does not wait for an in-flight switch; the flag
    /// applies from the next switch attempt.
    pub async fn lock(&self) -> Result<(), SwitchError> {
        self.set_lock(true).await
    }

    pub async fn unlock(&self) -> Result<(), SwitchError> {
        self.set_lock(false).await
    }

    async fn set_lock(&self, locked: bool) -> Result<(), SwitchError> {
        self.lock_store.write(locked).await.map_err(|e| {
            error!(error = %e, locked, "failed to persist lock flag");
            SwitchError::Storage(e.to_string())
        })
    }

    /// Make `target` the running VM, shutting the other one down first.
    pub async fn switch_to(&self, target: VmRole) -> SwitchOutcome {
        self.run(Target::Role(target)).await
    }

    /// Switch to whichever VM is not currently running.
    pub async fn toggle(&self) -> SwitchOutcome {
        self.run(Target::Toggle).await
    }

    async fn run(&self, target: Target) -> SwitchOutcome {
        let guard = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(?target, "switch rejected: another switch is in progress");
                return SwitchOutcome::failed(None, SwitchError::SwitchInProgress);
            }
        };

        // The in-process guard does not cover a one-shot CLI switch racing
        // the daemon; the flock does. Held until this function returns.
        let _flock = match self.lock_store.try_acquire_switch() {
            Ok(Some(flock)) => flock,
            Ok(None) => {
                warn!(?target, "switch rejected: another process is switching");
                return SwitchOutcome::failed(None, SwitchError::SwitchInProgress);
            }
            Err(e) => {
                error!(?target, error = %e, "switch rejected: cannot take switch lock");
                return SwitchOutcome::failed(None, SwitchError::Storage(e.to_string()));
            }
        };

        if self.lock_store.read().await {
            warn!(?target, "switch rejected: switching is locked");
            return SwitchOutcome::failed(None, SwitchError::Locked);
        }

        let report = self.reporter.report().await;
        let target = match target {
            Target::Role(role) => role,
            Target::Toggle => match toggle_target(&report) {
                Ok(role) => role,
                Err(e) => {
                    warn!(linux = %report.linux, windows = %report.windows, "toggle rejected: ambiguous state");
                    return SwitchOutcome::failed(None, e);
                }
            },
        };

        self.switch_locked(guard, target, report).await
    }

    /// Body of a switch. The guard is held until this returns.
    async fn switch_locked(
        &self,
        _guard: MutexGuard<'_, ()>,
        target: VmRole,
        report: StatusReport,
    ) -> SwitchOutcome {
        if report.sole_running() == Some(target) {
            info!(%target, "target already running, nothing to do");
            return SwitchOutcome::switched(Some(target), target);
        }

        let source = target.other();
        let source_state = report.state_of(source);
        let target_state = report.state_of(target);
        let previous = match (source_state, target_state) {
            (VmPowerState::Running | VmPowerState::Unknown, _) => Some(source),
            (_, VmPowerState::Running) => Some(target),
            _ => None,
        };

        info!(
            %target,
            %source,
            source_state = %source_state,
            target_state = %target_state,
            "switch started"
        );
        self.emit(SwitchEvent::Started { target });

        let outcome = self.execute(source, source_state, target, previous).await;

        if outcome.success {
            info!(%target, ?previous, "switch completed");
        } else if let Some(e) = &outcome.error {
            error!(%target, kind = e.kind(), error = %e, "switch failed");
        }
        self.emit(SwitchEvent::Finished {
            target,
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn execute(
        &self,
        source: VmRole,
        source_state: VmPowerState,
        target: VmRole,
        previous: Option<VmRole>,
    ) -> SwitchOutcome {
        let source_vm = self.vms.get(source);
        let target_vm = self.vms.get(target);

        // Unknown is treated as running: better an unneeded shutdown than two
        // VMs on one host.
        if source_state != VmPowerState::Stopped {
            self.emit(SwitchEvent::ShuttingDown { source });
            info!(%source, vmid = source_vm.vmid, "requesting graceful shutdown");
            if let Err(e) = bounded(self.call_timeout, self.hypervisor.stop_graceful(source_vm)).await {
                // The waiter escalates to a forced stop if this never lands.
                warn!(%source, error = %e, "graceful shutdown request failed");
            }

            let stopped = self
                .waiter
                .wait_for_stop(self.hypervisor.as_ref(), source_vm, || {
                    self.emit(SwitchEvent::ForceStopping { source })
                })
                .await;
            if stopped.is_err() {
                return SwitchOutcome::failed(previous, SwitchError::ShutdownTimeout { role: source });
            }
        }

        // Re-query right before starting; the earlier snapshot may be stale.
        let target_now = self.reporter.power_state(target).await;
        if target_now == VmPowerState::Running {
            info!(%target, "target already running, not issuing start");
            return SwitchOutcome::switched(previous, target);
        }

        self.emit(SwitchEvent::Starting { target });
        info!(%target, vmid = target_vm.vmid, "starting target VM");
        match bounded(self.call_timeout, self.hypervisor.start(target_vm)).await {
            Ok(()) => SwitchOutcome::switched(previous, target),
            // No rollback: neither VM is confirmed running, the operator decides.
            Err(e) => SwitchOutcome::failed(previous, e.into()),
        }
    }

    fn emit(&self, event: SwitchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Pick the toggle target: the VM that is not running. Refuses to guess when
/// the state does not single one out.
fn toggle_target(report: &StatusReport) -> Result<VmRole, SwitchError> {
    use VmPowerState::*;
    match (report.linux, report.windows) {
        (Running, Stopped | Unknown) => Ok(VmRole::Windows),
        (Stopped | Unknown, Running) => Ok(VmRole::Linux),
        (Stopped, Unknown) => Ok(VmRole::Linux),
        (Unknown, Stopped) => Ok(VmRole::Windows),
        (linux, windows) => Err(SwitchError::AmbiguousState { linux, windows }),
    }
}
