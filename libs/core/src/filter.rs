//! Decides which inbound updates are channel posts the relay should forward.

use std::sync::Arc;

use crate::{
    channel::{ChannelId, TrackedChannelSet, normalize_handle},
    update::{Peer, RawMessage, RawUpdate},
};

/// Fields extracted from an accepted channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateMessage {
    pub channel_id: ChannelId,
    /// Sequence number of the message within the channel.
    pub message_id: i64,
    pub text: Option<String>,
    /// Unix timestamp (seconds).
    pub date: i64,
    /// Normalized public handle, `None` for private channels.
    pub handle: Option<String>,
    pub edited: bool,
}

/// Why an update was dropped. Rejection is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotChannelMessage,
    Empty,
    NotFromChannel,
    Untracked,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NotChannelMessage => "not_channel_message",
            RejectReason::Empty => "empty",
            RejectReason::NotFromChannel => "not_from_channel",
            RejectReason::Untracked => "untracked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Accepted(CandidateMessage),
    Rejected(RejectReason),
}

impl Classification {
    pub fn accepted(self) -> Option<CandidateMessage> {
        match self {
            Classification::Accepted(msg) => Some(msg),
            Classification::Rejected(_) => None,
        }
    }
}

/// Matches updates against the tracked channel set.
///
/// ```
/// use relay_core::{
///     ChannelId, Classification, Peer, RawMessage, RawUpdate, TrackedChannelSet, UpdateFilter,
/// };
///
/// let filter = UpdateFilter::new(TrackedChannelSet::track_all());
/// let update = RawUpdate::NewChannelMessage(RawMessage {
///     id: 7,
///     date: 1_700_000_000,
///     peer: Peer::Channel { id: ChannelId(555), handle: None },
///     text: Some("hello".into()),
///     media: None,
/// });
/// assert!(matches!(filter.classify(&update), Classification::Accepted(_)));
/// ```
#[derive(Debug, Clone)]
pub struct UpdateFilter {
    tracked: Arc<TrackedChannelSet>,
}

impl UpdateFilter {
    pub fn new(tracked: impl Into<Arc<TrackedChannelSet>>) -> Self {
        Self {
            tracked: tracked.into(),
        }
    }

    pub fn tracked(&self) -> &TrackedChannelSet {
        &self.tracked
    }

    pub fn classify(&self, update: &RawUpdate) -> Classification {
        classify(update, &self.tracked)
    }
}

pub fn classify(update: &RawUpdate, tracked: &TrackedChannelSet) -> Classification {
    let (message, edited) = match update {
        RawUpdate::NewChannelMessage(message) => (message, false),
        RawUpdate::EditedChannelMessage(message) => (message, true),
        RawUpdate::NewMessage(_) | RawUpdate::EditedMessage(_) | RawUpdate::Other(_) => {
            return Classification::Rejected(RejectReason::NotChannelMessage);
        }
    };

    if message.is_empty() {
        return Classification::Rejected(RejectReason::Empty);
    }

    let Peer::Channel { id, handle } = &message.peer else {
        return Classification::Rejected(RejectReason::NotFromChannel);
    };
    let handle = handle
        .as_deref()
        .map(normalize_handle)
        .filter(|h| !h.is_empty());

    if !tracked.matches(*id, handle.as_deref()) {
        return Classification::Rejected(RejectReason::Untracked);
    }

    Classification::Accepted(candidate(message, *id, handle, edited))
}

fn candidate(
    message: &RawMessage,
    channel_id: ChannelId,
    handle: Option<String>,
    edited: bool,
) -> CandidateMessage {
    CandidateMessage {
        channel_id,
        message_id: message.id,
        text: message.text.clone(),
        date: message.date,
        handle,
        edited,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_post(id: i64, handle: Option<&str>, text: Option<&str>) -> RawMessage {
        RawMessage {
            id: 1,
            date: 1_700_000_000,
            peer: Peer::Channel {
                id: ChannelId(id),
                handle: handle.map(Into::into),
            },
            text: text.map(Into::into),
            media: None,
        }
    }

    fn listed(ids: &[i64], handles: &[(&str, i64)]) -> TrackedChannelSet {
        let mut set = TrackedChannelSet::listed();
        for id in ids {
            set.insert_id(ChannelId(*id));
        }
        for (handle, id) in handles {
            set.insert_handle(handle, ChannelId(*id));
        }
        set
    }

    #[test]
    fn non_channel_kinds_are_rejected() {
        let all = TrackedChannelSet::track_all();
        let dm = RawMessage {
            peer: Peer::User { user_id: 5 },
            ..channel_post(1, None, Some("hi"))
        };
        for update in [
            RawUpdate::NewMessage(dm.clone()),
            RawUpdate::EditedMessage(dm),
            RawUpdate::Other("typing".into()),
            RawUpdate::Other("delete_messages".into()),
        ] {
            assert_eq!(
                classify(&update, &all),
                Classification::Rejected(RejectReason::NotChannelMessage)
            );
        }
    }

    #[test]
    fn empty_posts_are_rejected() {
        let update = RawUpdate::NewChannelMessage(channel_post(1, None, None));
        assert_eq!(
            classify(&update, &TrackedChannelSet::track_all()),
            Classification::Rejected(RejectReason::Empty)
        );
    }

    #[test]
    fn media_only_posts_are_accepted_without_text() {
        let mut msg = channel_post(1, None, None);
        msg.media = Some("photo".into());
        let accepted = classify(
            &RawUpdate::NewChannelMessage(msg),
            &TrackedChannelSet::track_all(),
        )
        .accepted()
        .unwrap();
        assert_eq!(accepted.text, None);
    }

    #[test]
    fn channel_variant_from_group_peer_is_rejected() {
        let msg = RawMessage {
            peer: Peer::Group { chat_id: -42 },
            ..channel_post(1, None, Some("x"))
        };
        assert_eq!(
            classify(
                &RawUpdate::NewChannelMessage(msg),
                &TrackedChannelSet::track_all()
            ),
            Classification::Rejected(RejectReason::NotFromChannel)
        );
    }

    #[test]
    fn track_all_accepts_every_channel() {
        let all = TrackedChannelSet::track_all();
        for id in [1, 555, 999_999] {
            let update = RawUpdate::NewChannelMessage(channel_post(id, None, Some("x")));
            assert!(matches!(classify(&update, &all), Classification::Accepted(_)));
        }
    }

    #[test]
    fn numeric_reference_matches_regardless_of_handle() {
        let set = listed(&[555], &[]);
        let renamed = RawUpdate::NewChannelMessage(channel_post(555, Some("renamed"), Some("x")));
        let other = RawUpdate::NewChannelMessage(channel_post(999, Some("renamed"), Some("x")));
        assert!(matches!(classify(&renamed, &set), Classification::Accepted(_)));
        assert_eq!(
            classify(&other, &set),
            Classification::Rejected(RejectReason::Untracked)
        );
    }

    #[test]
    fn handle_match_is_case_insensitive() {
        let set = listed(&[], &[("@news", 777)]);
        let update = RawUpdate::NewChannelMessage(channel_post(12, Some("News"), Some("x")));
        let accepted = classify(&update, &set).accepted().unwrap();
        assert_eq!(accepted.handle.as_deref(), Some("news"));
        assert_eq!(accepted.channel_id, ChannelId(12));
    }

    #[test]
    fn edits_are_flagged() {
        let update = RawUpdate::EditedChannelMessage(channel_post(1, None, Some("x")));
        let accepted = classify(&update, &TrackedChannelSet::track_all())
            .accepted()
            .unwrap();
        assert!(accepted.edited);
    }

    #[test]
    fn blank_handle_is_treated_as_missing() {
        let update = RawUpdate::NewChannelMessage(channel_post(1, Some(""), Some("x")));
        let accepted = classify(&update, &TrackedChannelSet::track_all())
            .accepted()
            .unwrap();
        assert_eq!(accepted.handle, None);
    }
}
