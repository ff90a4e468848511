//! Outbound queue seam for channel envelopes.
//!
//! [`QueueClient`] is the narrow interface the relay needs from a durable queue:
//! one discrete send per message, a type-tag header, and (for ordered queues) a
//! group key plus a deduplication key. [`JetStreamQueue`] implements it on NATS
//! JetStream, [`InMemoryQueue`] backs tests, and [`DeliveryPublisher`] turns
//! envelope batches into sends with per-message failure isolation.

use std::{fmt::Display, str::FromStr, time::Duration};

use async_trait::async_trait;
use relay_core::DedupKey;
use serde::Deserialize;

mod jetstream;
mod memory;
mod publisher;

pub use jetstream::JetStreamQueue;
pub use memory::InMemoryQueue;
pub use publisher::{DeliveryPublisher, PublishResult};

/// Header carrying the payload type tag.
pub const MESSAGE_TYPE_HEADER: &str = "Relay-Message-Type";
/// Header carrying the ordering group key on ordered queues.
pub const GROUP_KEY_HEADER: &str = "Relay-Group-Key";

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Publish(#[from] anyhow::Error),
}

/// Delivery semantics of the destination queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    /// Ordered, exactly-once within the duplicate window; needs group and dedup keys.
    #[default]
    Fifo,
    Standard,
}

impl QueueClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Fifo => "fifo",
            QueueClass::Standard => "standard",
        }
    }
}

impl FromStr for QueueClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(QueueClass::Fifo),
            "standard" => Ok(QueueClass::Standard),
            other => anyhow::bail!("unknown queue class {other:?} (expected fifo or standard)"),
        }
    }
}

impl Display for QueueClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how envelopes are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueSettings {
    /// NATS server URL.
    pub url: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default)]
    pub class: QueueClass,
    #[serde(default = "default_group_key")]
    pub group_key: String,
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: u64,
}

impl QueueSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subject: default_subject(),
            stream: default_stream(),
            class: QueueClass::default(),
            group_key: default_group_key(),
            duplicate_window_secs: default_duplicate_window_secs(),
        }
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_window_secs.max(1))
    }
}

pub fn default_subject() -> String {
    "relay.telegram.channel".into()
}

pub fn default_stream() -> String {
    "TELEGRAM_CHANNELS".into()
}

pub fn default_group_key() -> String {
    "telegram-channels".into()
}

pub fn default_duplicate_window_secs() -> u64 {
    120
}

/// Keys an ordered queue needs to keep order and suppress duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedDelivery {
    pub group_key: String,
    pub dedup_key: DedupKey,
}

/// One discrete queue send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSend {
    pub subject: String,
    pub body: String,
    pub message_type: String,
    pub ordered: Option<OrderedDelivery>,
}

/// Queue acknowledgement for a send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// The queue recognised the dedup key and did not store a second copy.
    pub duplicate: bool,
    pub sequence: Option<u64>,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    fn class(&self) -> QueueClass;

    async fn send(&self, message: &QueueSend) -> Result<SendReceipt, BusError>;

    /// Flushes buffered sends and releases the connection.
    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_class_parses() {
        assert_eq!("FIFO".parse::<QueueClass>().unwrap(), QueueClass::Fifo);
        assert_eq!(
            " standard ".parse::<QueueClass>().unwrap(),
            QueueClass::Standard
        );
        assert!("priority".parse::<QueueClass>().is_err());
    }

    #[test]
    fn settings_defaults_apply_when_deserializing() {
        let settings: QueueSettings =
            serde_json::from_value(serde_json::json!({ "url": "nats://q:4222" })).unwrap();
        assert_eq!(settings, QueueSettings::new("nats://q:4222"));
        assert_eq!(settings.duplicate_window(), Duration::from_secs(120));
    }
}
