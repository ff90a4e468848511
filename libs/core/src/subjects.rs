//! Queue subject helpers for channel envelopes.

use std::borrow::Cow;

use crate::channel::ChannelId;

/// Normalizes identifiers to be subject-safe (replace spaces and wildcards, trim dots).
fn norm(s: &str) -> Cow<'_, str> {
    let t = s
        .trim()
        .trim_matches('.')
        .replace([' ', '\t', '\n', '\r', '*', '>', '/'], "-");
    if t.is_empty() {
        Cow::Borrowed("unknown")
    } else {
        Cow::Owned(t)
    }
}

/// Subject one channel's envelopes are published on.
///
/// ```
/// use relay_core::{ChannelId, envelope_subject};
///
/// assert_eq!(
///     envelope_subject("relay.telegram.channel", ChannelId(555)),
///     "relay.telegram.channel.555"
/// );
/// ```
pub fn envelope_subject(base: &str, channel_id: ChannelId) -> String {
    format!("{}.{}", norm(base), channel_id.0)
}

/// Wildcard covering every channel subject under `base`, used to bind the stream.
///
/// ```
/// use relay_core::stream_subject;
///
/// assert_eq!(stream_subject("relay.telegram.channel"), "relay.telegram.channel.>");
/// ```
pub fn stream_subject(base: &str) -> String {
    format!("{}.>", norm(base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_format() {
        assert_eq!(
            envelope_subject(" relay.tg chan. ", ChannelId(7)),
            "relay.tg-chan.7"
        );
        assert_eq!(stream_subject("a/b*"), "a-b-.>");
        assert_eq!(envelope_subject("", ChannelId(1)), "unknown.1");
    }
}
