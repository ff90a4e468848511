//! Relay configuration: an optional YAML file, otherwise environment variables.

use std::{fmt, fs, net::SocketAddr, path::Path, str::FromStr};

use anyhow::{Context, Result};
use relay_bus::{QueueClass, QueueSettings};
use relay_core::{ChannelRef, ChannelSelection};
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TELEGRAM_BOT_TOKEN is not set")]
    MissingBotToken,
    #[error("invalid {key}={value:?}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// How updates reach the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngressMode {
    #[default]
    Polling,
    Webhook,
}

impl FromStr for IngressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polling" | "poll" => Ok(IngressMode::Polling),
            "webhook" => Ok(IngressMode::Webhook),
            other => Err(format!("unknown mode {other:?} (expected polling or webhook)")),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct TelegramSettings {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub mode: IngressMode,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Expected `X-Telegram-Bot-Api-Secret-Token` value in webhook mode.
    #[serde(default)]
    pub secret_token: Option<String>,
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Public URL registered with `setWebhook`; left alone when unset.
    #[serde(default)]
    pub public_webhook_url: Option<String>,
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
            mode: IngressMode::default(),
            poll_timeout_secs: default_poll_timeout_secs(),
            secret_token: None,
            bind: default_bind(),
            public_webhook_url: None,
        }
    }
}

impl fmt::Debug for TelegramSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramSettings")
            .field("bot_token", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("mode", &self.mode)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("secret_token", &self.secret_token.as_ref().map(|_| "<redacted>"))
            .field("bind", &self.bind)
            .field("public_webhook_url", &self.public_webhook_url)
            .finish()
    }
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.into()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Immutable process configuration, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub channels: ChannelSelection,
    /// `None` disables delivery.
    pub queue: Option<QueueSettings>,
    pub telegram: TelegramSettings,
}

#[derive(Debug, Deserialize)]
struct RelayFile {
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default)]
    queue: Option<QueueSettings>,
    #[serde(default)]
    telegram: TelegramSettings,
}

/// Loads configuration from `path` when it names an existing file, otherwise
/// from the process environment.
pub fn load_config(path: Option<&str>) -> Result<RelayConfig> {
    load_with(path, |key| std::env::var(key).ok())
}

pub fn load_with<F>(path: Option<&str>, lookup: F) -> Result<RelayConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = path.map(Path::new).filter(|p| p.exists()) {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read relay config {}", path.display()))?;
        let file: RelayFile = serde_yaml_bw::from_str(&raw)
            .with_context(|| format!("parse relay config {}", path.display()))?;

        let mut telegram = file.telegram;
        if telegram.bot_token.trim().is_empty() {
            telegram.bot_token = non_empty(&lookup, "TELEGRAM_BOT_TOKEN")
                .ok_or(ConfigError::MissingBotToken)?;
        }
        return Ok(RelayConfig {
            channels: parse_channels(file.channels.iter().map(String::as_str)),
            queue: file.queue,
            telegram,
        });
    }

    from_lookup(lookup).context("load relay config from environment")
}

/// Builds the configuration from an environment-like lookup.
pub fn from_lookup<F>(lookup: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let channels = lookup("CHANNELS")
        .map(|raw| parse_channels(raw.split(',')))
        .unwrap_or_default();

    let queue = match non_empty(&lookup, "QUEUE_URL") {
        Some(url) => {
            let mut settings = QueueSettings::new(url);
            if let Some(subject) = non_empty(&lookup, "QUEUE_SUBJECT") {
                settings.subject = subject;
            }
            if let Some(stream) = non_empty(&lookup, "QUEUE_STREAM") {
                settings.stream = stream;
            }
            if let Some(class) = parsed::<QueueClass, _>(&lookup, "QUEUE_CLASS")? {
                settings.class = class;
            }
            if let Some(group_key) = non_empty(&lookup, "QUEUE_GROUP_KEY") {
                settings.group_key = group_key;
            }
            if let Some(window) = parsed::<u64, _>(&lookup, "QUEUE_DUPLICATE_WINDOW_SECS")? {
                settings.duplicate_window_secs = window;
            }
            Some(settings)
        }
        None => None,
    };

    let defaults = TelegramSettings::default();
    let telegram = TelegramSettings {
        bot_token: non_empty(&lookup, "TELEGRAM_BOT_TOKEN").ok_or(ConfigError::MissingBotToken)?,
        api_base: non_empty(&lookup, "TELEGRAM_API_BASE").unwrap_or(defaults.api_base),
        mode: parsed(&lookup, "TELEGRAM_MODE")?.unwrap_or(defaults.mode),
        poll_timeout_secs: parsed(&lookup, "TELEGRAM_POLL_TIMEOUT_SECS")?
            .unwrap_or(defaults.poll_timeout_secs),
        secret_token: non_empty(&lookup, "TELEGRAM_SECRET_TOKEN"),
        bind: parsed(&lookup, "BIND")?.unwrap_or(defaults.bind),
        public_webhook_url: non_empty(&lookup, "TELEGRAM_WEBHOOK_URL"),
    };

    Ok(RelayConfig {
        channels,
        queue,
        telegram,
    })
}

/// Parses channel entries, skipping blank ones and warning on malformed ones.
///
/// Only a list with no non-blank entry selects every channel; malformed
/// entries still count as configured.
pub fn parse_channels<'a>(entries: impl IntoIterator<Item = &'a str>) -> ChannelSelection {
    let mut configured = false;
    let mut channels = Vec::new();
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        configured = true;
        match entry.parse::<ChannelRef>() {
            Ok(channel) => channels.push(channel),
            Err(err) => warn!(entry, error = %err, "skipping invalid channel reference"),
        }
    }
    if !configured {
        return ChannelSelection::All;
    }
    if channels.is_empty() {
        warn!("every configured channel entry is invalid; no channel will be relayed");
    }
    ChannelSelection::Listed(channels)
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|err: T::Err| ConfigError::InvalidValue {
                key,
                value,
                reason: err.to_string(),
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ChannelId;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_with_only_a_token() {
        let cfg = from_lookup(env(&[("TELEGRAM_BOT_TOKEN", "123:abc")])).unwrap();
        assert_eq!(cfg.channels, ChannelSelection::All);
        assert!(cfg.queue.is_none());
        assert_eq!(cfg.telegram.bot_token, "123:abc");
        assert_eq!(cfg.telegram.api_base, DEFAULT_API_BASE);
        assert_eq!(cfg.telegram.mode, IngressMode::Polling);
        assert_eq!(cfg.telegram.poll_timeout_secs, 30);
        assert_eq!(cfg.telegram.bind, "0.0.0.0:8080".parse().unwrap());
    }

    #[test]
    fn missing_token_is_an_error() {
        let err = from_lookup(env(&[("CHANNELS", "@news")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBotToken));
    }

    #[test]
    fn channels_are_split_trimmed_and_filtered() {
        let cfg = from_lookup(env(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("CHANNELS", " @News , -100555,, bad handle!, 777 "),
        ]))
        .unwrap();
        assert_eq!(
            cfg.channels,
            ChannelSelection::Listed(vec![
                ChannelRef::Handle("news".into()),
                ChannelRef::Numeric(ChannelId(555)),
                ChannelRef::Numeric(ChannelId(777)),
            ])
        );
    }

    #[test]
    fn blank_channel_list_selects_everything() {
        for raw in ["", "  ", " , ,"] {
            let cfg = from_lookup(env(&[("TELEGRAM_BOT_TOKEN", "t"), ("CHANNELS", raw)])).unwrap();
            assert_eq!(cfg.channels, ChannelSelection::All, "{raw:?}");
        }
    }

    #[test]
    fn only_malformed_channels_select_nothing() {
        let cfg = from_lookup(env(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("CHANNELS", "https://t.me/news, -1009223372036854775807"),
        ]))
        .unwrap();
        assert_eq!(cfg.channels, ChannelSelection::Listed(Vec::new()));
        assert!(!cfg.channels.tracks_all());
    }

    #[test]
    fn queue_settings_come_from_env() {
        let cfg = from_lookup(env(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("QUEUE_URL", "nats://queue:4222"),
            ("QUEUE_CLASS", "standard"),
            ("QUEUE_SUBJECT", "feeds.tg"),
            ("QUEUE_DUPLICATE_WINDOW_SECS", "300"),
        ]))
        .unwrap();
        let queue = cfg.queue.unwrap();
        assert_eq!(queue.url, "nats://queue:4222");
        assert_eq!(queue.class, QueueClass::Standard);
        assert_eq!(queue.subject, "feeds.tg");
        assert_eq!(queue.stream, "TELEGRAM_CHANNELS");
        assert_eq!(queue.group_key, "telegram-channels");
        assert_eq!(queue.duplicate_window_secs, 300);
    }

    #[test]
    fn malformed_values_are_reported() {
        let err = from_lookup(env(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("TELEGRAM_MODE", "carrier-pigeon"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "TELEGRAM_MODE",
                ..
            }
        ));
    }

    #[test]
    fn load_from_file_parses_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        fs::write(
            &path,
            r#"
channels: ["@news", "-100555", ""]
queue:
  url: "nats://127.0.0.1:4222"
  class: fifo
telegram:
  mode: webhook
  secret_token: "s3cret"
  bind: "127.0.0.1:9000"
"#,
        )
        .unwrap();

        let cfg = load_with(path.to_str(), env(&[("TELEGRAM_BOT_TOKEN", "from-env")])).unwrap();
        assert_eq!(cfg.channels.references().len(), 2);
        assert_eq!(cfg.queue.unwrap().subject, "relay.telegram.channel");
        assert_eq!(cfg.telegram.bot_token, "from-env");
        assert_eq!(cfg.telegram.mode, IngressMode::Webhook);
        assert_eq!(cfg.telegram.secret_token.as_deref(), Some("s3cret"));
        assert_eq!(cfg.telegram.bind, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn missing_file_falls_back_to_env() {
        let cfg = load_with(
            Some("/definitely/not/here.yaml"),
            env(&[("TELEGRAM_BOT_TOKEN", "t"), ("CHANNELS", "@news")]),
        )
        .unwrap();
        assert_eq!(cfg.channels.references().len(), 1);
    }

    #[test]
    fn file_with_only_invalid_channels_selects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        fs::write(&path, "channels: [\"t.me/news\"]\n").unwrap();
        let cfg = load_with(path.to_str(), env(&[("TELEGRAM_BOT_TOKEN", "t")])).unwrap();
        assert_eq!(cfg.channels, ChannelSelection::Listed(Vec::new()));
    }

    #[test]
    fn malformed_yaml_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        fs::write(&path, "channels: [unterminated").unwrap();
        assert!(load_with(path.to_str(), env(&[("TELEGRAM_BOT_TOKEN", "t")])).is_err());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let cfg = from_lookup(env(&[
            ("TELEGRAM_BOT_TOKEN", "123:supersecret"),
            ("TELEGRAM_SECRET_TOKEN", "hook-secret"),
        ]))
        .unwrap();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("supersecret"));
        assert!(!rendered.contains("hook-secret"));
    }
}
