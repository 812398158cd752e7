//! One-shot subcommands: `status`, `switch`, `toggle`, `lock`, `unlock`, `check`.
//!
//! These talk to Proxmox directly and do not need the daemon. `lock`/`unlock`
//! write the same flag file a running daemon reads on every switch attempt.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::lock::LockStore;
use crate::switch::{SwitchController, SwitchOutcome};
use crate::vm::proxmox::ProxmoxClient;
use crate::vm::{Hypervisor, VmRole};

pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::from_env(),
    }
}

/// Wire the Proxmox client and lock store into a controller.
pub fn build_controller(config: &Config) -> Result<Arc<SwitchController>> {
    config.validate_for_serve()?;
    let hypervisor: Arc<dyn Hypervisor> = Arc::new(ProxmoxClient::new(&config.proxmox)?);
    let lock_store = Arc::new(LockStore::new(&config.switch.lock_file));
    Ok(Arc::new(SwitchController::new(
        hypervisor,
        config.vm_pair(),
        lock_store,
        &config.switch,
    )))
}

/// Path of the per-host instance lock, next to the lock flag file.
pub fn instance_lock_path(config: &Config) -> PathBuf {
    let lock_file = &config.switch.lock_file;
    let mut name = lock_file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "pveswitch".into());
    name.push(".instance");
    lock_file.with_file_name(name)
}

/// Take an exclusive, non-blocking `flock` so two daemons never arbitrate the
/// same VM pair. The returned file must stay open for the daemon's lifetime.
pub fn acquire_instance_lock(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).ok();
    }
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open instance lock file: {}", path.display()))?;

    use std::os::unix::io::AsRawFd;
    let fd = lock_file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        anyhow::bail!(
            "Another pveswitch instance is already running (lock held on {}).\n\
             Two instances would each believe they are the only switcher for this VM pair.",
            path.display()
        );
    }
    Ok(lock_file)
}

pub async fn run_status(controller: &SwitchController, json: bool) -> Result<()> {
    let report = controller.status().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Linux:   {}", report.linux);
        println!("Windows: {}", report.windows);
        println!("Locked:  {}", report.locked);
    }
    Ok(())
}

/// Switch (or toggle when `target` is None) and print the outcome.
pub async fn run_switch(controller: &SwitchController, target: Option<VmRole>) -> Result<()> {
    let outcome = match target {
        Some(role) => controller.switch_to(role).await,
        None => controller.toggle().await,
    };
    print_outcome(&outcome);
    match outcome.error {
        None => Ok(()),
        Some(e) => Err(anyhow::Error::new(e).context("switch failed")),
    }
}

fn print_outcome(outcome: &SwitchOutcome) {
    let role = |r: Option<VmRole>| r.map(|r| r.to_string()).unwrap_or_else(|| "none".into());
    if outcome.was_noop() {
        println!("{} is already running, nothing to do", role(outcome.new));
    } else if outcome.success {
        println!("Switched: {} -> {}", role(outcome.previous), role(outcome.new));
    } else if let Some(e) = &outcome.error {
        println!("Switch failed [{}]: {}", e.kind(), e);
    }
}

pub async fn run_set_lock(config: &Config, locked: bool) -> Result<()> {
    let store = LockStore::new(&config.switch.lock_file);
    store.write(locked).await?;
    println!(
        "Switching {} ({})",
        if locked { "LOCKED" } else { "UNLOCKED" },
        store.path().display()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `pveswitch check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub async fn run_check(config: &Config) -> Result<()> {
    println!("Checking configuration...\n");

    let mut checks: Vec<Check> = Vec::new();

    checks.push(match config.validate_for_serve() {
        Ok(()) => Check::pass("Proxmox settings", config.proxmox.api_base_url()),
        Err(e) => Check::fail(
            "Proxmox settings",
            e.to_string(),
            "Set proxmox.host/node/token_* in the config or PROXMOX_* environment variables",
        ),
    });

    checks.push(check_lock_dir(config));

    if checks[0].ok {
        checks.extend(check_hypervisor(config).await);
    }

    if config.bot.enabled {
        checks.push(Check::pass("Telegram bot", format!("chat {}", config.bot.chat_id)));
    }

    let all_pass = checks.iter().all(|c| c.ok);

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if let Some(fix) = c.fix.as_ref().filter(|_| !c.ok) {
            println!("    Fix: {}", fix);
        }
    }

    println!();
    if all_pass {
        println!("All checks passed. Run: pveswitch serve");
        Ok(())
    } else {
        let failed = checks.iter().filter(|c| !c.ok).count();
        anyhow::bail!("{} check(s) failed", failed)
    }
}

fn check_lock_dir(config: &Config) -> Check {
    let lock_file = &config.switch.lock_file;
    let dir = lock_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let probe = dir.join(".pveswitch-write-check");

    match std::fs::write(&probe, b"ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            let current = match std::fs::read_to_string(lock_file) {
                Ok(content) => content.trim().to_string(),
                Err(_) => "absent, unlocked".to_string(),
            };
            Check::pass("Lock flag", format!("{} ({})", lock_file.display(), current))
        }
        Err(e) => Check::fail(
            "Lock flag",
            format!("{} not writable: {}", dir.display(), e),
            format!("Create {} and make it writable, or set LOCK_FILE_PATH", dir.display()),
        ),
    }
}

async fn check_hypervisor(config: &Config) -> Vec<Check> {
    let client = match ProxmoxClient::new(&config.proxmox) {
        Ok(c) => c,
        Err(e) => {
            return vec![Check::fail(
                "Proxmox API",
                e.to_string(),
                "Check proxmox.* settings",
            )]
        }
    };

    let pair = config.vm_pair();
    let mut checks = Vec::new();
    for (label, vm) in [("Linux VM", pair.linux), ("Windows VM", pair.windows)] {
        checks.push(match client.power_state(&vm).await {
            Ok(state) => Check::pass(label, format!("vmid {}: {}", vm.vmid, state)),
            Err(e) => Check::fail(
                label,
                format!("vmid {}: {}", vm.vmid, e),
                "Verify the API token has VM.PowerMgmt and VM.Audit on this VM",
            ),
        });
    }
    checks
}
