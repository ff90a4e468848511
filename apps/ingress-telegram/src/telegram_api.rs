//! Telegram Bot API client and the mapping from Bot API updates to relay updates.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use relay_core::{
    ChannelDirectory, ChannelId, ChannelRef, Peer, RawMessage, RawUpdate, ResolvedChannel,
    normalize_handle,
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Update kinds requested from Telegram.
pub const ALLOWED_UPDATES: [&str; 4] = [
    "channel_post",
    "edited_channel_post",
    "message",
    "edited_message",
];

/// Message fields that mean the post carries media.
const MEDIA_FIELDS: [&str; 11] = [
    "photo",
    "video",
    "document",
    "audio",
    "voice",
    "animation",
    "sticker",
    "video_note",
    "poll",
    "location",
    "contact",
];

#[derive(Debug, Clone, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
}

/// Bot API refusal that sending the same request again will not change.
#[derive(Debug, thiserror::Error)]
#[error("telegram {method} rejected ({status}): {description}")]
pub struct RejectedRequest {
    pub method: String,
    pub status: StatusCode,
    pub description: String,
}

/// Client errors are final, except rate limiting.
fn is_permanent(status: StatusCode) -> bool {
    status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub channel_post: Option<TelegramMessage>,
    #[serde(default)]
    pub edited_channel_post: Option<TelegramMessage>,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub edited_message: Option<TelegramMessage>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub date: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl TelegramChat {
    fn is_channel(&self) -> bool {
        self.r#type.as_deref() == Some("channel")
    }

    fn peer(&self) -> Peer {
        match self.r#type.as_deref() {
            Some("channel") => match ChannelId::from_marked(self.id) {
                Some(id) => Peer::Channel {
                    id,
                    handle: self.username.clone(),
                },
                None => Peer::Group { chat_id: self.id },
            },
            Some("private") => Peer::User { user_id: self.id },
            _ => Peer::Group { chat_id: self.id },
        }
    }
}

impl From<TelegramMessage> for RawMessage {
    fn from(msg: TelegramMessage) -> Self {
        let media = MEDIA_FIELDS
            .iter()
            .find(|field| msg.extra.contains_key(**field))
            .map(|field| field.to_string());
        RawMessage {
            id: msg.message_id,
            date: msg.date,
            peer: msg.chat.peer(),
            text: msg.text.or(msg.caption),
            media,
        }
    }
}

impl From<TelegramUpdate> for RawUpdate {
    fn from(update: TelegramUpdate) -> Self {
        if let Some(msg) = update.channel_post {
            RawUpdate::NewChannelMessage(msg.into())
        } else if let Some(msg) = update.edited_channel_post {
            RawUpdate::EditedChannelMessage(msg.into())
        } else if let Some(msg) = update.message {
            RawUpdate::NewMessage(msg.into())
        } else if let Some(msg) = update.edited_message {
            RawUpdate::EditedMessage(msg.into())
        } else {
            let kind = update
                .other
                .keys()
                .next()
                .cloned()
                .unwrap_or_else(|| "unknown".into());
            RawUpdate::Other(kind)
        }
    }
}

#[async_trait]
pub trait TelegramApi: Send + Sync {
    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
        allowed_updates: &[&str],
    ) -> Result<Vec<TelegramUpdate>>;
    async fn get_chat(&self, chat_id: &str) -> Result<TelegramChat>;
    async fn set_webhook(
        &self,
        url: &str,
        secret: Option<&str>,
        allowed_updates: &[&str],
    ) -> Result<()>;
    async fn delete_webhook(&self, drop_pending: bool) -> Result<()>;
}

#[derive(Clone)]
pub struct HttpTelegramApi {
    client: Client,
    api_base: String,
    bot_token: String,
}

impl HttpTelegramApi {
    pub fn new(client: Client, api_base: Option<String>, bot_token: impl Into<String>) -> Self {
        let api_base = api_base.unwrap_or_else(|| "https://api.telegram.org".into());
        Self {
            client,
            api_base,
            bot_token: bot_token.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.bot_token,
            method
        )
    }

    async fn with_retry<F, Fut, T>(mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let delays = [
            Duration::from_millis(250),
            Duration::from_secs(1),
            Duration::from_secs(4),
        ];
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.downcast_ref::<RejectedRequest>().is_some() => return Err(err),
                Err(err) if attempt < delays.len() => {
                    tracing::debug!(error = %err, attempt, "telegram request failed; retrying");
                    sleep(delays[attempt]).await;
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call<T: DeserializeOwned + Send>(
        &self,
        method: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<T> {
        let endpoint = self.url(method);
        Self::with_retry(|| async {
            let res = self
                .client
                .post(&endpoint)
                .timeout(timeout)
                .json(payload)
                .send()
                .await
                // the request URL embeds the bot token
                .map_err(|err| anyhow::Error::new(err.without_url()))
                .with_context(|| format!("telegram {method} request"))?;
            let status = res.status();
            if is_permanent(status) {
                let description = res.text().await.unwrap_or_default();
                return Err(RejectedRequest {
                    method: method.to_string(),
                    status,
                    description,
                }
                .into());
            }
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                return Err(anyhow!("telegram {method} {status}: {body}"));
            }
            let body: TelegramResponse<T> = res
                .json()
                .await
                .map_err(|err| anyhow::Error::new(err.without_url()))
                .with_context(|| format!("decode telegram {method} response"))?;
            let description = body.description.unwrap_or_else(|| "unknown error".into());
            match (body.ok, body.result) {
                (true, Some(result)) => Ok(result),
                _ => match body
                    .error_code
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .filter(|status| is_permanent(*status))
                {
                    Some(status) => Err(RejectedRequest {
                        method: method.to_string(),
                        status,
                        description,
                    }
                    .into()),
                    None => Err(anyhow!("telegram {method} failed: {description}")),
                },
            }
        })
        .await
    }
}

#[async_trait]
impl TelegramApi for HttpTelegramApi {
    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
        allowed_updates: &[&str],
    ) -> Result<Vec<TelegramUpdate>> {
        let mut payload = serde_json::json!({
            "timeout": timeout_secs,
            "allowed_updates": allowed_updates,
        });
        if let Some(offset) = offset {
            payload["offset"] = Value::from(offset);
        }
        self.call(
            "getUpdates",
            &payload,
            Duration::from_secs(timeout_secs) + REQUEST_TIMEOUT,
        )
        .await
    }

    async fn get_chat(&self, chat_id: &str) -> Result<TelegramChat> {
        let payload = serde_json::json!({ "chat_id": chat_id });
        self.call("getChat", &payload, REQUEST_TIMEOUT).await
    }

    async fn set_webhook(
        &self,
        url: &str,
        secret: Option<&str>,
        allowed_updates: &[&str],
    ) -> Result<()> {
        let payload = serde_json::json!({
            "url": url,
            "secret_token": secret,
            "allowed_updates": allowed_updates,
        });
        self.call::<Value>("setWebhook", &payload, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn delete_webhook(&self, drop_pending: bool) -> Result<()> {
        let payload = serde_json::json!({ "drop_pending_updates": drop_pending });
        self.call::<Value>("deleteWebhook", &payload, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }
}

/// Resolves channel references with `getChat`.
pub struct TelegramDirectory {
    api: Arc<dyn TelegramApi>,
}

impl TelegramDirectory {
    pub fn new(api: Arc<dyn TelegramApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ChannelDirectory for TelegramDirectory {
    async fn lookup(&self, reference: &ChannelRef) -> Result<ResolvedChannel> {
        let chat_id = match reference {
            ChannelRef::Numeric(id) => id
                .marked()
                .with_context(|| format!("channel id {id} is out of range"))?
                .to_string(),
            ChannelRef::Handle(handle) => format!("@{handle}"),
        };
        let chat = self.api.get_chat(&chat_id).await?;
        if !chat.is_channel() {
            anyhow::bail!(
                "{reference} is a {} chat, not a channel",
                chat.r#type.as_deref().unwrap_or("unknown")
            );
        }
        let id = ChannelId::from_marked(chat.id)
            .with_context(|| format!("unexpected channel chat id {}", chat.id))?;
        Ok(ResolvedChannel {
            id,
            handle: chat
                .username
                .as_deref()
                .map(normalize_handle)
                .filter(|h| !h.is_empty()),
        })
    }
}
