//! Telegram front end. Only the configured chat may issue commands.

pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::switch::status::StatusReport;
use crate::switch::{SwitchController, SwitchError, SwitchEvent, SwitchOutcome};
use crate::vm::{VmPowerState, VmRole};

use self::telegram::{TelegramClient, Update};

const RETRY_DELAY: Duration = Duration::from_secs(5);

pub const HELP_TEXT: &str = "🤖 <b>Proxmox VM Switch</b>\n\n\
<b>Commands:</b>\n\
/status - Show current status of VMs and lock\n\
/switch_linux - Switch to the Linux VM\n\
/switch_windows - Switch to the Windows VM\n\
/switch - Toggle the active VM\n\
/lock - Prevent API/bot from switching VMs\n\
/unlock - Allow switching VMs\n\
/help - Show this help message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    SwitchTo(VmRole),
    Toggle,
    Lock,
    Unlock,
    Help,
}

impl Command {
    /// Parse the leading `/command[@botname]` of a message.
    pub fn parse(text: &str) -> Option<Self> {
        let first = text.split_whitespace().next()?;
        let name = first.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name).to_ascii_lowercase();
        match name.as_str() {
            "status" => Some(Command::Status),
            "switch_linux" => Some(Command::SwitchTo(VmRole::Linux)),
            "switch_windows" => Some(Command::SwitchTo(VmRole::Windows)),
            "switch" => Some(Command::Toggle),
            "lock" => Some(Command::Lock),
            "unlock" => Some(Command::Unlock),
            "help" | "start" => Some(Command::Help),
            _ => None,
        }
    }
}

fn state_label(state: VmPowerState) -> String {
    format!("<code>{}</code>", state)
}

pub fn render_status(report: &StatusReport) -> String {
    format!(
        "🖥 <b>System Status</b>\n🐧 Linux: {}\n🪟 Windows: {}\n🔒 Locked: <code>{}</code>",
        state_label(report.linux),
        state_label(report.windows),
        report.locked
    )
}

fn switching_header(target: VmRole) -> String {
    format!("🔄 <b>Switching to {}...</b>", target.display_name())
}

pub fn render_error(error: &SwitchError) -> String {
    match error {
        SwitchError::Locked => "🔒 System is locked. Use /unlock first.".to_string(),
        SwitchError::SwitchInProgress => "⏳ An operation is already in progress.".to_string(),
        SwitchError::AmbiguousState {
            linux: VmPowerState::Stopped,
            windows: VmPowerState::Stopped,
        } => "⚠️ Both VMs are stopped. Use a specific command to start one.".to_string(),
        SwitchError::AmbiguousState { linux, windows } => format!(
            "⚠️ Cannot tell which VM is active (Linux: <code>{}</code>, Windows: <code>{}</code>). Use a specific command.",
            linux, windows
        ),
        SwitchError::Storage(e) => format!("❌ <b>Lock file error</b>\n{}", html_escape(e)),
        other => format!("❌ <b>Switch Failed</b>\n{}", html_escape(&other.to_string())),
    }
}

/// Progress message text for a switch event.
pub fn render_event(event: &SwitchEvent) -> String {
    match event {
        SwitchEvent::Started { target } => format!("{}\n⏳ Initializing...", switching_header(*target)),
        SwitchEvent::ShuttingDown { source } => format!(
            "{}\n🛑 Shutting down {}...",
            switching_header(source.other()),
            source.display_name()
        ),
        SwitchEvent::ForceStopping { source } => format!(
            "{}\n⚠️ {} stuck. Force stopping...",
            switching_header(source.other()),
            source.display_name()
        ),
        SwitchEvent::Starting { target } => format!(
            "{}\n🚀 Starting {}...",
            switching_header(*target),
            target.display_name()
        ),
        SwitchEvent::Finished { target, outcome } => match &outcome.error {
            None => format!(
                "✅ <b>Switched to {}</b>\n{} is starting.",
                target.display_name(),
                target.display_name()
            ),
            Some(e) => render_error(e),
        },
    }
}

/// Reply for a switch command that the progress relay will not cover: no-ops
/// and pre-flight rejections publish no events.
pub fn direct_reply(outcome: &SwitchOutcome) -> Option<String> {
    if outcome.was_noop() {
        let role = outcome.new?;
        return Some(format!(
            "ℹ️ <b>{}</b> is already running. No action taken.",
            role.display_name()
        ));
    }
    match &outcome.error {
        Some(e) if e.is_preflight() => Some(render_error(e)),
        _ => None,
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Polls Telegram for commands from the allow-listed chat.
#[derive(Clone)]
pub struct Bot {
    client: Arc<TelegramClient>,
    controller: Arc<SwitchController>,
    chat_id: i64,
}

impl Bot {
    pub fn new(client: Arc<TelegramClient>, controller: Arc<SwitchController>, chat_id: i64) -> Self {
        Self {
            client,
            controller,
            chat_id,
        }
    }

    /// Long-poll forever. Transport errors are logged and retried.
    pub async fn run(self) {
        info!(chat_id = self.chat_id, "Telegram bot polling started");
        let mut offset: Option<i64> = None;
        loop {
            match self.client.get_updates(offset).await {
                Ok(updates) => {
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        self.dispatch(update);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Telegram polling failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    /// Handle one update on its own task so a long switch does not stall
    /// polling (and `/status` stays responsive mid-switch).
    fn dispatch(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        if message.chat.id != self.chat_id {
            debug!(chat_id = message.chat.id, "ignoring message from non-allow-listed chat");
            return;
        }
        let Some(command) = message.text.as_deref().and_then(Command::parse) else {
            return;
        };

        let bot = self.clone();
        tokio::spawn(async move {
            if let Err(e) = bot.handle(command).await {
                warn!(?command, error = %e, "failed to handle bot command");
            }
        });
    }

    pub async fn handle(&self, command: Command) -> Result<()> {
        info!(?command, "bot command received");
        let reply = match command {
            Command::Status => Some(render_status(&self.controller.status().await)),
            Command::Help => Some(HELP_TEXT.to_string()),
            Command::Lock => Some(match self.controller.lock().await {
                Ok(()) => "🔒 System <b>LOCKED</b>. Switching disabled.".to_string(),
                Err(e) => render_error(&e),
            }),
            Command::Unlock => Some(match self.controller.unlock().await {
                Ok(()) => "🔓 System <b>UNLOCKED</b>.".to_string(),
                Err(e) => render_error(&e),
            }),
            Command::SwitchTo(role) => direct_reply(&self.controller.switch_to(role).await),
            Command::Toggle => direct_reply(&self.controller.toggle().await),
        };

        if let Some(text) = reply {
            self.client.send_message(self.chat_id, &text).await?;
        }
        Ok(())
    }
}

/// Mirrors switch progress into a single, edited chat message, whichever
/// front end started the switch.
pub struct ProgressRelay {
    client: Arc<TelegramClient>,
    chat_id: i64,
}

impl ProgressRelay {
    pub fn new(client: Arc<TelegramClient>, chat_id: i64) -> Self {
        Self { client, chat_id }
    }

    pub async fn run(self, mut events: broadcast::Receiver<SwitchEvent>) {
        let mut progress: Option<i64> = None;
        loop {
            match events.recv().await {
                Ok(event) => self.on_event(&mut progress, &event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "progress relay lagged behind switch events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn on_event(&self, progress: &mut Option<i64>, event: &SwitchEvent) {
        let text = render_event(event);
        let finished = matches!(event, SwitchEvent::Finished { .. });

        let result = match (*progress, event) {
            (_, SwitchEvent::Started { .. }) | (None, SwitchEvent::Finished { .. }) => {
                match self.client.send_message(self.chat_id, &text).await {
                    Ok(message) => {
                        *progress = Some(message.message_id);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            (Some(message_id), _) => self.client.edit_message_text(self.chat_id, message_id, &text).await,
            (None, _) => Ok(()),
        };

        if let Err(e) = result {
            warn!(error = %e, "failed to update progress message");
        }
        if finished {
            *progress = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::extract::{Path, State};
    use axum::routing::post;
    use axum::{Json, Router};

    use super::*;
    use crate::config::SwitchConfig;
    use crate::lock::LockStore;
    use crate::vm::fake::FakeHypervisor;
    use crate::vm::VmPair;

    #[test]
    fn parse_commands() {
        assert_eq!(Command::parse("/status"), Some(Command::Status));
        assert_eq!(Command::parse("/switch_linux"), Some(Command::SwitchTo(VmRole::Linux)));
        assert_eq!(
            Command::parse("/switch_windows@PveSwitchBot now"),
            Some(Command::SwitchTo(VmRole::Windows))
        );
        assert_eq!(Command::parse("/SWITCH"), Some(Command::Toggle));
        assert_eq!(Command::parse("/lock"), Some(Command::Lock));
        assert_eq!(Command::parse("/unlock"), Some(Command::Unlock));
        assert_eq!(Command::parse("/start"), Some(Command::Help));
        assert_eq!(Command::parse("status"), None);
        assert_eq!(Command::parse("/reboot"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn status_rendering() {
        let text = render_status(&StatusReport {
            linux: VmPowerState::Running,
            windows: VmPowerState::Unknown,
            locked: true,
        });
        assert!(text.contains("Linux: <code>running</code>"));
        assert!(text.contains("Windows: <code>unknown</code>"));
        assert!(text.contains("Locked: <code>true</code>"));
    }

    #[test]
    fn direct_reply_only_for_noop_and_preflight() {
        let noop = SwitchOutcome {
            success: true,
            previous: Some(VmRole::Linux),
            new: Some(VmRole::Linux),
            error: None,
        };
        assert!(direct_reply(&noop).unwrap().contains("already running"));

        let locked = SwitchOutcome {
            success: false,
            previous: None,
            new: None,
            error: Some(SwitchError::Locked),
        };
        assert!(direct_reply(&locked).unwrap().contains("locked"));

        let switched = SwitchOutcome {
            success: true,
            previous: Some(VmRole::Linux),
            new: Some(VmRole::Windows),
            error: None,
        };
        assert_eq!(direct_reply(&switched), None);

        let timeout = SwitchOutcome {
            success: false,
            previous: Some(VmRole::Linux),
            new: None,
            error: Some(SwitchError::ShutdownTimeout { role: VmRole::Linux }),
        };
        assert_eq!(direct_reply(&timeout), None);
    }

    #[test]
    fn both_stopped_gets_specific_hint() {
        let text = render_error(&SwitchError::AmbiguousState {
            linux: VmPowerState::Stopped,
            windows: VmPowerState::Stopped,
        });
        assert!(text.contains("Both VMs are stopped"));
    }

    #[test]
    fn event_rendering_names_the_right_vms() {
        let text = render_event(&SwitchEvent::ShuttingDown { source: VmRole::Linux });
        assert!(text.contains("Switching to Windows"));
        assert!(text.contains("Shutting down Linux"));

        let text = render_event(&SwitchEvent::ForceStopping { source: VmRole::Windows });
        assert!(text.contains("Windows stuck"));
    }

    #[test]
    fn upstream_errors_are_html_escaped() {
        let text = render_error(&SwitchError::Upstream("<html>bad gateway</html>".into()));
        assert!(text.contains("&lt;html&gt;"));
    }

    #[derive(Default)]
    struct MockTelegram {
        sent: Mutex<Vec<(String, serde_json::Value)>>,
    }

    async fn bot_method(
        State(tg): State<Arc<MockTelegram>>,
        Path((_bot, method)): Path<(String, String)>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        let mut sent = tg.sent.lock().unwrap();
        sent.push((method, body.clone()));
        let message_id = sent.len() as i64;
        Json(serde_json::json!({
            "ok": true,
            "result": {
                "message_id": message_id,
                "chat": {"id": body["chat_id"]},
                "text": body["text"],
            }
        }))
    }

    async fn spawn_mock(tg: Arc<MockTelegram>) -> String {
        let app = Router::new()
            .route("/{bot}/{method}", post(bot_method))
            .with_state(tg);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn controller(dir: &tempfile::TempDir) -> Arc<SwitchController> {
        let fake = Arc::new(FakeHypervisor::new(VmPowerState::Running, VmPowerState::Stopped));
        Arc::new(SwitchController::new(
            fake,
            VmPair::new(100, 101),
            Arc::new(LockStore::new(dir.path().join("lock.local"))),
            &SwitchConfig::default(),
        ))
    }

    #[tokio::test]
    async fn status_command_replies_to_allow_listed_chat() {
        let tg = Arc::new(MockTelegram::default());
        let base = spawn_mock(tg.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(TelegramClient::new(&base, "123:abc", 1).unwrap());
        let bot = Bot::new(client, controller(&dir), 42);

        bot.handle(Command::Status).await.unwrap();

        let sent = tg.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "sendMessage");
        assert_eq!(sent[0].1["chat_id"], 42);
        assert_eq!(sent[0].1["parse_mode"], "HTML");
        assert!(sent[0].1["text"].as_str().unwrap().contains("Linux: <code>running</code>"));
    }

    #[tokio::test]
    async fn lock_command_persists_flag() {
        let tg = Arc::new(MockTelegram::default());
        let base = spawn_mock(tg.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let ctrl = controller(&dir);
        let client = Arc::new(TelegramClient::new(&base, "123:abc", 1).unwrap());
        let bot = Bot::new(client, ctrl.clone(), 42);

        bot.handle(Command::Lock).await.unwrap();
        assert!(ctrl.is_locked().await);

        bot.handle(Command::SwitchTo(VmRole::Windows)).await.unwrap();
        let sent = tg.sent.lock().unwrap();
        assert!(sent[1].1["text"].as_str().unwrap().contains("locked"));
    }

    #[tokio::test]
    async fn relay_sends_then_edits_one_message() {
        let tg = Arc::new(MockTelegram::default());
        let base = spawn_mock(tg.clone()).await;
        let client = Arc::new(TelegramClient::new(&base, "123:abc", 1).unwrap());
        let relay = ProgressRelay::new(client, 42);

        let (tx, rx) = broadcast::channel(16);
        let handle = tokio::spawn(relay.run(rx));

        tx.send(SwitchEvent::Started { target: VmRole::Windows }).unwrap();
        tx.send(SwitchEvent::ShuttingDown { source: VmRole::Linux }).unwrap();
        tx.send(SwitchEvent::Finished {
            target: VmRole::Windows,
            outcome: SwitchOutcome {
                success: true,
                previous: Some(VmRole::Linux),
                new: Some(VmRole::Windows),
                error: None,
            },
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let sent = tg.sent.lock().unwrap();
        let methods: Vec<&str> = sent.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(methods, vec!["sendMessage", "editMessageText", "editMessageText"]);
        assert_eq!(sent[1].1["message_id"], 1);
        assert!(sent[2].1["text"].as_str().unwrap().contains("Switched to Windows"));
    }
}
