//! Inbound update shapes as delivered by the messaging platform adapter.

use crate::channel::ChannelId;

/// Where a message was posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    /// Broadcast channel, with its public handle when it has one.
    Channel {
        id: ChannelId,
        handle: Option<String>,
    },
    Group {
        chat_id: i64,
    },
    User {
        user_id: i64,
    },
}

/// Message payload shared by every message-carrying update kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Sequence number of the message within its chat.
    pub id: i64,
    /// Unix timestamp (seconds) of the post.
    pub date: i64,
    pub peer: Peer,
    pub text: Option<String>,
    /// Kind of attached media (`"photo"`, `"video"`, ...), if any.
    pub media: Option<String>,
}

impl RawMessage {
    /// True when the message has neither text nor media (service notices).
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(str::is_empty) && self.media.is_none()
    }
}

/// One inbound event. Only the two channel variants can pass the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawUpdate {
    NewChannelMessage(RawMessage),
    EditedChannelMessage(RawMessage),
    /// Direct or group message.
    NewMessage(RawMessage),
    EditedMessage(RawMessage),
    /// Anything else (typing indicators, deletions, membership changes, ...).
    Other(String),
}

impl RawUpdate {
    pub fn kind(&self) -> &str {
        match self {
            RawUpdate::NewChannelMessage(_) => "new_channel_message",
            RawUpdate::EditedChannelMessage(_) => "edited_channel_message",
            RawUpdate::NewMessage(_) => "new_message",
            RawUpdate::EditedMessage(_) => "edited_message",
            RawUpdate::Other(kind) => kind.as_str(),
        }
    }
}

/// Updates in the order one delivery from the platform carried them.
pub type UpdateBatch = Vec<RawUpdate>;

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: Option<&str>, media: Option<&str>) -> RawMessage {
        RawMessage {
            id: 1,
            date: 0,
            peer: Peer::User { user_id: 1 },
            text: text.map(Into::into),
            media: media.map(Into::into),
        }
    }

    #[test]
    fn empty_detection() {
        assert!(message(None, None).is_empty());
        assert!(message(Some(""), None).is_empty());
        assert!(!message(Some("hi"), None).is_empty());
        assert!(!message(None, Some("photo")).is_empty());
    }

    #[test]
    fn kind_names() {
        assert_eq!(RawUpdate::Other("typing".into()).kind(), "typing");
        assert_eq!(
            RawUpdate::EditedChannelMessage(message(Some("x"), None)).kind(),
            "edited_channel_message"
        );
    }
}
