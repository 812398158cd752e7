use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::vm::VmPair;

/// Upper bound for every `*_secs` setting. Keeps deadline arithmetic far
/// from overflow.
const MAX_DURATION_SECS: u64 = 24 * 60 * 60;

/// Top-level configuration for the pveswitch daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxmox: ProxmoxConfig,
    pub vms: VmsConfig,
    pub switch: SwitchConfig,
    pub api: ApiConfig,
    pub bot: BotConfig,
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration from defaults plus environment only (no file).
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from the environment. `lookup` is injected so tests do
    /// not have to mutate the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e))
        }

        if let Some(v) = lookup("PROXMOX_HOST") {
            self.proxmox.host = v;
        }
        if let Some(v) = lookup("PROXMOX_PORT") {
            self.proxmox.port = parsed("PROXMOX_PORT", v)?;
        }
        if let Some(v) = lookup("PROXMOX_USER") {
            self.proxmox.user = v;
        }
        if let Some(v) = lookup("PROXMOX_TOKEN_NAME") {
            self.proxmox.token_name = v;
        }
        if let Some(v) = lookup("PROXMOX_TOKEN_VALUE") {
            self.proxmox.token_value = v;
        }
        if let Some(v) = lookup("PROXMOX_NODE_NAME") {
            self.proxmox.node = v;
        }
        if let Some(v) = lookup("PROXMOX_LINUX_VM_ID") {
            self.vms.linux_vmid = parsed("PROXMOX_LINUX_VM_ID", v)?;
        }
        if let Some(v) = lookup("PROXMOX_WIN_VM_ID") {
            self.vms.windows_vmid = parsed("PROXMOX_WIN_VM_ID", v)?;
        }
        if let Some(v) = lookup("BOT_TOKEN") {
            self.bot.token = v;
            self.bot.enabled = true;
        }
        if let Some(v) = lookup("BOT_CHAT_ID") {
            self.bot.chat_id = parsed("BOT_CHAT_ID", v)?;
        }
        if let Some(v) = lookup("LOCK_FILE_PATH") {
            self.switch.lock_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("API_ADMIN_TOKEN") {
            self.api.admin_token = v;
        }
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.vms.linux_vmid > 0, "vms.linux_vmid must be set");
        anyhow::ensure!(self.vms.windows_vmid > 0, "vms.windows_vmid must be set");
        anyhow::ensure!(
            self.vms.linux_vmid != self.vms.windows_vmid,
            "vms.linux_vmid and vms.windows_vmid must differ"
        );
        anyhow::ensure!(
            self.switch.poll_interval_secs >= 1,
            "switch.poll_interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.switch.poll_interval_secs < self.switch.shutdown_timeout_secs,
            "switch.poll_interval_secs must be less than switch.shutdown_timeout_secs"
        );
        anyhow::ensure!(
            self.switch.force_confirm_timeout_secs >= 1,
            "switch.force_confirm_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.switch.call_timeout_secs >= 1,
            "switch.call_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.proxmox.request_timeout_secs >= 1,
            "proxmox.request_timeout_secs must be >= 1"
        );
        for (key, secs) in [
            ("switch.poll_interval_secs", self.switch.poll_interval_secs),
            ("switch.shutdown_timeout_secs", self.switch.shutdown_timeout_secs),
            ("switch.force_confirm_timeout_secs", self.switch.force_confirm_timeout_secs),
            ("switch.call_timeout_secs", self.switch.call_timeout_secs),
            ("proxmox.request_timeout_secs", self.proxmox.request_timeout_secs),
            ("bot.poll_timeout_secs", self.bot.poll_timeout_secs),
        ] {
            anyhow::ensure!(
                secs <= MAX_DURATION_SECS,
                "{} must be at most {} (one day)",
                key,
                MAX_DURATION_SECS
            );
        }
        if self.bot.enabled {
            anyhow::ensure!(!self.bot.token.is_empty(), "bot.token must be set when the bot is enabled");
            anyhow::ensure!(self.bot.chat_id != 0, "bot.chat_id must be set when the bot is enabled");
        }
        Ok(())
    }

    /// Extra checks needed only when actually talking to Proxmox.
    pub fn validate_for_serve(&self) -> Result<()> {
        anyhow::ensure!(!self.proxmox.host.is_empty(), "proxmox.host must be set");
        anyhow::ensure!(!self.proxmox.node.is_empty(), "proxmox.node must be set");
        anyhow::ensure!(
            !self.proxmox.token_value.is_empty(),
            "proxmox.token_value must be set"
        );
        Ok(())
    }

    pub fn vm_pair(&self) -> VmPair {
        VmPair::new(self.vms.linux_vmid, self.vms.windows_vmid)
    }
}

/// Proxmox VE API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxConfig {
    /// Hostname or IP of the Proxmox node's API.
    pub host: String,
    /// API port (Proxmox default: 8006).
    pub port: u16,
    /// API user, e.g. "root@pam".
    pub user: String,
    /// API token id (the part after `!`).
    pub token_name: String,
    /// API token secret.
    #[serde(skip_serializing)]
    pub token_value: String,
    /// Node name the VMs live on.
    pub node: String,
    /// Verify the API's TLS certificate. Proxmox ships self-signed certs.
    pub verify_tls: bool,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8006,
            user: "root@pam".into(),
            token_name: String::new(),
            token_value: String::new(),
            node: "pve".into(),
            verify_tls: false,
            request_timeout_secs: 10,
        }
    }
}

impl ProxmoxConfig {
    /// API root, e.g. "https://pve.lan:8006/api2/json".
    pub fn api_base_url(&self) -> String {
        format!("https://{}:{}/api2/json", self.host, self.port)
    }
}

/// VM ids of the pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VmsConfig {
    pub linux_vmid: u32,
    pub windows_vmid: u32,
}

/// Switch timing and lock flag location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// File holding the persisted lock flag.
    pub lock_file: PathBuf,
    /// Interval between power state polls while waiting for a shutdown.
    pub poll_interval_secs: u64,
    /// Grace period for a graceful shutdown before forcing the VM off.
    pub shutdown_timeout_secs: u64,
    /// How long to wait for a forced stop to be confirmed.
    pub force_confirm_timeout_secs: u64,
    /// Upper bound on any single hypervisor call made during a switch.
    pub call_timeout_secs: u64,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            lock_file: PathBuf::from("lock.local"),
            poll_interval_secs: 2,
            shutdown_timeout_secs: 60,
            force_confirm_timeout_secs: 10,
            call_timeout_secs: 15,
        }
    }
}

impl SwitchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn force_confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.force_confirm_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// HTTP API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_addr: String,
    pub port: u16,
    /// Bearer token required on every route except /healthz. Empty disables auth.
    #[serde(skip_serializing)]
    pub admin_token: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "0.0.0.0".into(),
            port: 8000,
            admin_token: String::new(),
        }
    }
}

/// Telegram bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub enabled: bool,
    #[serde(skip_serializing)]
    pub token: String,
    /// The only chat allowed to control the VMs.
    pub chat_id: i64,
    /// Bot API root, overridable for testing against a local server.
    pub api_base: String,
    /// Long-poll timeout passed to getUpdates.
    pub poll_timeout_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            chat_id: 0,
            api_base: "https://api.telegram.org".into(),
            poll_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn valid() -> Config {
        let mut config = Config::default();
        config.vms.linux_vmid = 100;
        config.vms.windows_vmid = 101;
        config
    }

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.proxmox.port, 8006);
        assert_eq!(config.proxmox.user, "root@pam");
        assert!(!config.proxmox.verify_tls);
        assert_eq!(config.switch.lock_file, PathBuf::from("lock.local"));
        assert_eq!(config.switch.poll_interval_secs, 2);
        assert_eq!(config.switch.shutdown_timeout_secs, 60);
        assert_eq!(config.switch.force_confirm_timeout_secs, 10);
        assert!(config.api.enabled);
        assert_eq!(config.api.port, 8000);
        assert!(!config.bot.enabled);
        assert_eq!(config.bot.api_base, "https://api.telegram.org");
    }

    #[test]
    fn defaults_need_vm_ids() {
        assert!(Config::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn config_load_from_toml() {
        let toml_content = r#"
[proxmox]
host = "pve.lan"
token_name = "switch"
token_value = "abc"

[vms]
linux_vmid = 200
windows_vmid = 201

[switch]
shutdown_timeout_secs = 120
"#;
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        tmpfile.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(tmpfile.path()).unwrap();
        assert_eq!(config.proxmox.host, "pve.lan");
        assert_eq!(config.vms.linux_vmid, 200);
        assert_eq!(config.switch.shutdown_timeout_secs, 120);
        // Unset fields use defaults
        assert_eq!(config.switch.poll_interval_secs, 2);
        assert_eq!(config.proxmox.node, "pve");
        assert_eq!(config.proxmox.api_base_url(), "https://pve.lan:8006/api2/json");
    }

    #[test]
    fn validation_rejects_same_vm_ids() {
        let mut config = valid();
        config.vms.windows_vmid = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_poll_interval_not_below_timeout() {
        let mut config = valid();
        config.switch.poll_interval_secs = 60;
        assert!(config.validate().is_err());

        config.switch.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_caps_durations() {
        let mut config = valid();
        config.switch.shutdown_timeout_secs = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("switch.shutdown_timeout_secs"));

        let mut config = valid();
        config.switch.call_timeout_secs = MAX_DURATION_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.switch.shutdown_timeout_secs = MAX_DURATION_SECS;
        config.switch.force_confirm_timeout_secs = MAX_DURATION_SECS;
        config.switch.call_timeout_secs = MAX_DURATION_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_requires_bot_credentials_when_enabled() {
        let mut config = valid();
        config.bot.enabled = true;
        assert!(config.validate().is_err());

        config.bot.token = "123:abc".into();
        config.bot.chat_id = 42;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn serve_validation_requires_proxmox_credentials() {
        let mut config = valid();
        assert!(config.validate_for_serve().is_err());
        config.proxmox.host = "pve.lan".into();
        config.proxmox.token_value = "abc".into();
        assert!(config.validate_for_serve().is_ok());
    }

    #[test]
    fn env_overrides_use_deployment_variable_names() {
        let env: HashMap<&str, &str> = [
            ("PROXMOX_HOST", "10.0.0.5"),
            ("PROXMOX_TOKEN_VALUE", "tok"),
            ("PROXMOX_NODE_NAME", "node1"),
            ("PROXMOX_LINUX_VM_ID", "300"),
            ("PROXMOX_WIN_VM_ID", "301"),
            ("BOT_TOKEN", "123:abc"),
            ("BOT_CHAT_ID", "-100123"),
            ("LOCK_FILE_PATH", "/var/lib/pveswitch/lock"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.proxmox.host, "10.0.0.5");
        assert_eq!(config.proxmox.node, "node1");
        assert_eq!(config.vms.linux_vmid, 300);
        assert_eq!(config.vms.windows_vmid, 301);
        assert!(config.bot.enabled);
        assert_eq!(config.bot.chat_id, -100123);
        assert_eq!(config.switch.lock_file, PathBuf::from("/var/lib/pveswitch/lock"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_override_rejects_bad_number() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|k| (k == "PROXMOX_LINUX_VM_ID").then(|| "abc".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PROXMOX_LINUX_VM_ID"));
    }

    #[test]
    fn secrets_are_not_serialized() {
        let mut config = valid();
        config.proxmox.token_value = "very-secret".into();
        config.bot.token = "bot-secret".into();
        config.api.admin_token = "admin-secret".into();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("very-secret"));
        assert!(!json.contains("bot-secret"));
        assert!(!json.contains("admin-secret"));
    }
}
