use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Minimal Telegram Bot API client: long polling plus send/edit.
pub struct TelegramClient {
    http: Client,
    base_url: String,
    poll_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct BotApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Serialize)]
struct GetUpdates<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Serialize)]
struct EditMessageText<'a> {
    chat_id: i64,
    message_id: i64,
    text: &'a str,
    parse_mode: &'a str,
}

impl TelegramClient {
    pub fn new(api_base: &str, token: &str, poll_timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            // Long polls hold the request open for poll_timeout_secs.
            .timeout(Duration::from_secs(poll_timeout_secs + 10))
            .build()
            .context("building Telegram HTTP client")?;
        Ok(Self {
            http,
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
            poll_timeout_secs,
        })
    }

    async fn call<B: Serialize, T: DeserializeOwned>(&self, method: &str, body: &B) -> Result<T> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Telegram {} request failed", method))?;

        let parsed: BotApiResponse<T> = response
            .json()
            .await
            .with_context(|| format!("decoding Telegram {} response", method))?;

        if !parsed.ok {
            bail!(
                "Telegram {} failed: {}",
                method,
                parsed.description.unwrap_or_else(|| "no description".into())
            );
        }
        parsed
            .result
            .with_context(|| format!("Telegram {} returned no result", method))
    }

    pub async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>> {
        let updates: Vec<Update> = self
            .call(
                "getUpdates",
                &GetUpdates {
                    offset,
                    timeout: self.poll_timeout_secs,
                    allowed_updates: &["message"],
                },
            )
            .await?;
        trace!(count = updates.len(), "received Telegram updates");
        Ok(updates)
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<Message> {
        self.call(
            "sendMessage",
            &SendMessage {
                chat_id,
                text,
                parse_mode: "HTML",
            },
        )
        .await
    }

    pub async fn edit_message_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        let result: Result<serde_json::Value> = self
            .call(
                "editMessageText",
                &EditMessageText {
                    chat_id,
                    message_id,
                    text,
                    parse_mode: "HTML",
                },
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // Editing to identical text is rejected by Telegram; harmless.
            Err(e) if e.to_string().contains("message is not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }
}
