mod api;
mod bot;
mod cli;
mod config;
mod lock;
mod switch;
mod vm;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::bot::telegram::TelegramClient;
use crate::bot::{Bot, ProgressRelay};
use crate::vm::VmRole;

#[derive(Parser)]
#[command(name = "pveswitch", about = "Mutually exclusive Linux/Windows VM switcher for Proxmox")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: HTTP API and/or Telegram bot.
    Serve {
        /// Path to config file (TOML). Environment variables are used when omitted.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Show power state of both VMs and the lock flag.
    Status {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Switch to the given VM (linux or windows).
    Switch {
        role: VmRole,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Switch to whichever VM is not running.
    Toggle {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Forbid switching until unlocked.
    Lock {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Allow switching again.
    Unlock {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Verify config, lock directory and Proxmox access. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status { config, json } => {
            let config = cli::load_config(config)?;
            let controller = cli::build_controller(&config)?;
            cli::run_status(&controller, json).await?;
        }
        Commands::Switch { role, config } => {
            let config = cli::load_config(config)?;
            let controller = cli::build_controller(&config)?;
            cli::run_switch(&controller, Some(role)).await?;
        }
        Commands::Toggle { config } => {
            let config = cli::load_config(config)?;
            let controller = cli::build_controller(&config)?;
            cli::run_switch(&controller, None).await?;
        }
        Commands::Lock { config } => {
            let config = cli::load_config(config)?;
            cli::run_set_lock(&config, true).await?;
        }
        Commands::Unlock { config } => {
            let config = cli::load_config(config)?;
            cli::run_set_lock(&config, false).await?;
        }
        Commands::Check { config } => {
            let config = cli::load_config(config)?;
            cli::run_check(&config).await?;
        }
        Commands::Serve { config } => {
            let config = cli::load_config(config)?;
            config.validate_for_serve()?;

            if !config.api.enabled && !config.bot.enabled {
                anyhow::bail!("nothing to serve: both [api] and [bot] are disabled");
            }

            // Held until process exit.
            let instance_lock_path = cli::instance_lock_path(&config);
            let _instance_lock = cli::acquire_instance_lock(&instance_lock_path)?;

            tracing::info!(
                host = %config.proxmox.host,
                node = %config.proxmox.node,
                linux_vmid = config.vms.linux_vmid,
                windows_vmid = config.vms.windows_vmid,
                "starting pveswitch"
            );

            let controller = cli::build_controller(&config)?;
            if controller.is_locked().await {
                tracing::info!(
                    path = %config.switch.lock_file.display(),
                    "restored LOCKED state, switching is disabled until unlocked"
                );
            }

            let mut tasks = Vec::new();

            if config.api.enabled {
                let state = Arc::new(api::ApiState {
                    controller: Arc::clone(&controller),
                    config: Arc::new(config.api.clone()),
                });
                tasks.push(api::start_api(state).await.context("failed to start HTTP API")?);
            }

            if config.bot.enabled {
                let client = Arc::new(TelegramClient::new(
                    &config.bot.api_base,
                    &config.bot.token,
                    config.bot.poll_timeout_secs,
                )?);
                let relay = ProgressRelay::new(Arc::clone(&client), config.bot.chat_id);
                let events = controller.subscribe();
                tasks.push(tokio::spawn(relay.run(events)));

                let bot = Bot::new(client, Arc::clone(&controller), config.bot.chat_id);
                tasks.push(tokio::spawn(bot.run()));
                tracing::info!(chat_id = config.bot.chat_id, "Telegram bot started");
            }

            let mut sigterm = tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            )
            .context("failed to register SIGTERM handler")?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, initiating shutdown");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating shutdown");
                }
            }

            // Stop accepting new commands, then let a running switch finish.
            for task in &tasks {
                task.abort();
            }
            let drain = config.switch.shutdown_timeout()
                + config.switch.force_confirm_timeout()
                + config.switch.call_timeout() * 4;
            if tokio::time::timeout(drain, controller.wait_idle()).await.is_err() {
                tracing::warn!("in-flight switch did not finish before shutdown");
            }
            tracing::info!("pveswitch shut down");
        }
    }

    Ok(())
}
