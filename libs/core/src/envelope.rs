//! Normalized outbound record and the keys derived from it.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::{channel::ChannelId, filter::CandidateMessage};

/// Type tag attached to every queue send so consumers can route on payload kind.
pub const ENVELOPE_MESSAGE_TYPE: &str = "telegram.channel_message";

/// Record handed to the outbound queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub channel_id: ChannelId,
    pub message_id: i64,
    #[serde(default)]
    pub handle: Option<String>,
    pub text: String,
    pub permalink: String,
    pub timestamp: String, // RFC 3339
    #[serde(default)]
    pub edited: bool,
}

impl OutboundEnvelope {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.channel_id, self.message_id)
    }
}

/// Queue-side deduplication key for one logical channel message.
///
/// Derived only from the channel ID and the message sequence number, so a
/// re-send or an edit of the same post carries the same key.
///
/// ```
/// use relay_core::{ChannelId, DedupKey};
///
/// let a = DedupKey::new(ChannelId(100), 1);
/// assert_eq!(a, DedupKey::new(ChannelId(100), 1));
/// assert_ne!(a, DedupKey::new(ChannelId(100), 2));
/// assert_eq!(a.as_str(), "tg-100-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(channel_id: ChannelId, message_id: i64) -> Self {
        Self(format!("tg-{}-{}", channel_id.0, message_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DedupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Public link when the channel has a handle, `t.me/c/` private form otherwise.
///
/// ```
/// use relay_core::{ChannelId, permalink};
///
/// assert_eq!(permalink(Some("news"), ChannelId(555), 42), "https://t.me/news/42");
/// assert_eq!(permalink(None, ChannelId(555), 42), "https://t.me/c/555/42");
/// ```
pub fn permalink(handle: Option<&str>, channel_id: ChannelId, message_id: i64) -> String {
    match handle.filter(|h| !h.is_empty()) {
        Some(handle) => format!("https://t.me/{handle}/{message_id}"),
        None => format!("https://t.me/c/{}/{message_id}", channel_id.0),
    }
}

/// Turns an accepted candidate into its outbound envelope. Never fails and
/// never truncates the body.
pub fn build_envelope(msg: &CandidateMessage) -> OutboundEnvelope {
    let timestamp = OffsetDateTime::from_unix_timestamp(msg.date)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into());

    OutboundEnvelope {
        channel_id: msg.channel_id,
        message_id: msg.message_id,
        handle: msg.handle.clone(),
        text: msg.text.clone().unwrap_or_default(),
        permalink: permalink(msg.handle.as_deref(), msg.channel_id, msg.message_id),
        timestamp,
        edited: msg.edited,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn candidate(handle: Option<&str>, channel: i64, id: i64) -> CandidateMessage {
        CandidateMessage {
            channel_id: ChannelId(channel),
            message_id: id,
            text: Some("hello".into()),
            date: 1_700_000_000,
            handle: handle.map(Into::into),
            edited: false,
        }
    }

    #[test]
    fn public_permalink_uses_handle() {
        let env = build_envelope(&candidate(Some("news"), 555, 42));
        assert_eq!(env.permalink, "https://t.me/news/42");
    }

    #[test]
    fn private_permalink_uses_numeric_ids() {
        let env = build_envelope(&candidate(None, 555, 42));
        assert!(env.permalink.contains("555"));
        assert!(env.permalink.contains("42"));
        assert_eq!(env.permalink, "https://t.me/c/555/42");
    }

    #[test]
    fn missing_text_becomes_empty_and_long_text_is_kept() {
        let mut msg = candidate(None, 1, 1);
        msg.text = None;
        assert_eq!(build_envelope(&msg).text, "");

        let long = "x".repeat(10_000);
        msg.text = Some(long.clone());
        assert_eq!(build_envelope(&msg).text, long);
    }

    #[test]
    fn timestamp_is_rfc3339() {
        let env = build_envelope(&candidate(None, 1, 1));
        assert_eq!(env.timestamp, "2023-11-14T22:13:20Z");
    }

    #[test]
    fn dedup_keys_are_deterministic_and_unique() {
        let first = build_envelope(&candidate(Some("news"), 100, 1)).dedup_key();
        let again = build_envelope(&candidate(None, 100, 1)).dedup_key();
        assert_eq!(first, again);

        let mut seen = HashSet::new();
        for channel in [1, 11, 100, 1001] {
            for id in [1, 11, 100, 1001] {
                assert!(seen.insert(DedupKey::new(ChannelId(channel), id)));
            }
        }
    }

    #[test]
    fn edit_shares_key_with_original() {
        let mut edited = candidate(None, 100, 1);
        edited.edited = true;
        assert_eq!(
            build_envelope(&edited).dedup_key(),
            build_envelope(&candidate(None, 100, 1)).dedup_key()
        );
    }
}
