//! Minimal Telegram Bot API client: long-poll `getUpdates` for inbound
//! messages and `sendMessage` for replies and notifications.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::db::ChatId;
use crate::notify::Notifier;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Seconds the server may hold a `getUpdates` request open.
pub const LONG_POLL_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
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
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: ChatId,
}

fn into_result<T>(method: &str, resp: ApiResponse<T>) -> Result<T> {
    if !resp.ok {
        bail!(
            "telegram {method} failed: {}",
            resp.description.as_deref().unwrap_or("no description")
        );
    }
    resp.result
        .ok_or_else(|| anyhow!("telegram {method} response missing result"))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct TelegramClient {
    client: reqwest::Client,
    /// `{api_base}/bot{token}`
    base: String,
}

impl TelegramClient {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_api_base(DEFAULT_API_BASE, token)
    }

    pub fn with_api_base(api_base: &str, token: &str) -> Result<Self> {
        let api_base = api_base.trim().trim_end_matches('/');
        if api_base.is_empty() {
            bail!("telegram api base cannot be empty");
        }
        // Must outlive the long-poll window.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECS + 10))
            .build()
            .context("failed to build telegram http client")?;
        Ok(Self {
            client,
            base: format!("{api_base}/bot{token}"),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let resp: ApiResponse<T> = self
            .client
            .post(format!("{}/{method}", self.base))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("telegram {method} request failed"))?
            .json()
            .await
            .with_context(|| format!("telegram {method} returned invalid json"))?;
        into_result(method, resp)
    }

    /// Updates with `update_id >= offset`, waiting up to `LONG_POLL_SECS`.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": LONG_POLL_SECS,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    pub async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "MarkdownV2",
                }),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramClient {
    async fn send(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.send_message(chat_id, text).await
    }
}
