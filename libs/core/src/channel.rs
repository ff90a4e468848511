//! Channel references as configured and the set of channels the relay tracks.

use std::{
    collections::{HashMap, HashSet},
    fmt::{Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix Telegram puts in front of channel IDs when they are used as chat IDs.
pub const MARKED_CHANNEL_PREFIX: &str = "-100";

const MARKED_OFFSET: i64 = 1_000_000_000_000;

/// Largest bare channel ID that still has a `-100<id>` chat ID form.
pub const MAX_CHANNEL_ID: i64 = i64::MAX - MARKED_OFFSET;

/// Canonical numeric channel identifier, in the bare form (no `-100` prefix).
///
/// ```
/// use relay_core::ChannelId;
///
/// let id = ChannelId::from_marked(-1001234567890).unwrap();
/// assert_eq!(id, ChannelId(1234567890));
/// assert_eq!(id.marked(), Some(-1001234567890));
/// assert!(ChannelId::from_marked(-4242).is_none());
/// assert!(ChannelId(i64::MAX).marked().is_none());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

impl ChannelId {
    /// Converts a chat ID in the `-100<id>` form into a bare channel ID.
    /// Returns `None` for chat IDs that do not belong to a channel.
    pub fn from_marked(chat_id: i64) -> Option<Self> {
        chat_id
            .checked_neg()?
            .checked_sub(MARKED_OFFSET)
            .filter(|id| *id > 0)
            .map(Self)
    }

    /// Chat ID form (`-100<id>`) used by the Bot API, or `None` when the ID
    /// is outside the range that form can hold.
    pub fn marked(self) -> Option<i64> {
        if self.0 <= 0 {
            return None;
        }
        self.0.checked_add(MARKED_OFFSET).map(|v| -v)
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelRefError {
    #[error("empty channel reference")]
    Empty,
    #[error("channel reference {0:?} is not a valid handle or channel id")]
    Invalid(String),
}

/// A channel as written in configuration: either a numeric ID or a public handle.
///
/// Handles are stored normalized (no leading `@`, lower-cased).
///
/// ```
/// use relay_core::{ChannelId, ChannelRef};
///
/// assert_eq!("-100555".parse::<ChannelRef>().unwrap(), ChannelRef::Numeric(ChannelId(555)));
/// assert_eq!("@News".parse::<ChannelRef>().unwrap(), ChannelRef::Handle("news".into()));
/// assert_eq!(ChannelRef::Numeric(ChannelId(555)).to_string(), "-100555");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChannelRef {
    Numeric(ChannelId),
    Handle(String),
}

impl ChannelRef {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ChannelRef::Numeric(_))
    }
}

impl FromStr for ChannelRef {
    type Err = ChannelRefError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ChannelRefError::Empty);
        }

        let digits = trimmed
            .strip_prefix(MARKED_CHANNEL_PREFIX)
            .unwrap_or(trimmed);
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            return digits
                .parse::<i64>()
                .ok()
                .filter(|id| (1..=MAX_CHANNEL_ID).contains(id))
                .map(|id| ChannelRef::Numeric(ChannelId(id)))
                .ok_or_else(|| ChannelRefError::Invalid(trimmed.to_string()));
        }

        let handle = normalize_handle(trimmed);
        if handle.is_empty() || !handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ChannelRefError::Invalid(trimmed.to_string()));
        }
        Ok(ChannelRef::Handle(handle))
    }
}

impl TryFrom<String> for ChannelRef {
    type Error = ChannelRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelRef> for String {
    fn from(value: ChannelRef) -> Self {
        value.to_string()
    }
}

impl Display for ChannelRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelRef::Numeric(id) => write!(f, "{MARKED_CHANNEL_PREFIX}{id}"),
            ChannelRef::Handle(handle) => write!(f, "@{handle}"),
        }
    }
}

/// Which channels the relay was configured to follow.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChannelSelection {
    /// Nothing was configured: every channel the bot sees is followed.
    #[default]
    All,
    /// Only these channels. Stays a list even when every configured entry was
    /// dropped as malformed, in which case nothing is followed.
    Listed(Vec<ChannelRef>),
}

impl ChannelSelection {
    pub fn tracks_all(&self) -> bool {
        matches!(self, ChannelSelection::All)
    }

    pub fn references(&self) -> &[ChannelRef] {
        match self {
            ChannelSelection::All => &[],
            ChannelSelection::Listed(references) => references,
        }
    }
}

/// Strips surrounding whitespace and a leading `@`, and lower-cases the handle.
pub fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackingMode {
    All,
    Listed,
}

/// Channels accepted by the update filter. Built once at startup and shared
/// read-only afterwards.
#[derive(Debug, Clone)]
pub struct TrackedChannelSet {
    mode: TrackingMode,
    ids: HashSet<ChannelId>,
    handles: HashMap<String, ChannelId>,
}

impl TrackedChannelSet {
    /// Accepts every channel message.
    pub fn track_all() -> Self {
        Self {
            mode: TrackingMode::All,
            ids: HashSet::new(),
            handles: HashMap::new(),
        }
    }

    /// Accepts only channels added with [`insert_id`](Self::insert_id) or
    /// [`insert_handle`](Self::insert_handle). An empty listed set accepts nothing.
    pub fn listed() -> Self {
        Self {
            mode: TrackingMode::Listed,
            ..Self::track_all()
        }
    }

    pub fn insert_id(&mut self, id: ChannelId) {
        self.ids.insert(id);
    }

    pub fn insert_handle(&mut self, handle: &str, id: ChannelId) {
        self.handles.insert(normalize_handle(handle), id);
        self.ids.insert(id);
    }

    pub fn tracks_all(&self) -> bool {
        self.mode == TrackingMode::All
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.handles.is_empty()
    }

    pub fn contains_id(&self, id: ChannelId) -> bool {
        self.ids.contains(&id)
    }

    pub fn contains_handle(&self, handle: &str) -> bool {
        self.handles.contains_key(&normalize_handle(handle))
    }

    /// True when a message from channel `id` (currently known as `handle`) should be kept.
    pub fn matches(&self, id: ChannelId, handle: Option<&str>) -> bool {
        self.tracks_all()
            || self.contains_id(id)
            || handle.is_some_and(|h| self.contains_handle(h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_forms() {
        assert_eq!(
            "-1001234".parse::<ChannelRef>().unwrap(),
            ChannelRef::Numeric(ChannelId(1234))
        );
        assert_eq!(
            " 1234 ".parse::<ChannelRef>().unwrap(),
            ChannelRef::Numeric(ChannelId(1234))
        );
    }

    #[test]
    fn parses_handles_case_insensitively() {
        assert_eq!(
            "@Durov_News".parse::<ChannelRef>().unwrap(),
            ChannelRef::Handle("durov_news".into())
        );
        assert_eq!(
            "news".parse::<ChannelRef>().unwrap(),
            ChannelRef::Handle("news".into())
        );
    }

    #[test]
    fn rejects_blank_and_garbage() {
        assert_eq!("  ".parse::<ChannelRef>(), Err(ChannelRefError::Empty));
        assert!(matches!(
            "-42".parse::<ChannelRef>(),
            Err(ChannelRefError::Invalid(_))
        ));
        assert!(matches!(
            "@".parse::<ChannelRef>(),
            Err(ChannelRefError::Invalid(_))
        ));
        assert!(matches!(
            "https://t.me/news".parse::<ChannelRef>(),
            Err(ChannelRefError::Invalid(_))
        ));
    }

    #[test]
    fn out_of_range_ids_are_rejected() {
        for raw in [
            "-1009223372036854775807",
            "9223372036854775807",
            "99999999999999999999",
            "-1000",
        ] {
            assert!(
                matches!(raw.parse::<ChannelRef>(), Err(ChannelRefError::Invalid(_))),
                "{raw} should be rejected"
            );
        }
        let largest = format!("-100{MAX_CHANNEL_ID}");
        assert_eq!(
            largest.parse::<ChannelRef>().unwrap(),
            ChannelRef::Numeric(ChannelId(MAX_CHANNEL_ID))
        );
    }

    #[test]
    fn marked_conversions_never_overflow() {
        assert_eq!(ChannelId::from_marked(i64::MIN), None);
        assert_eq!(ChannelId::from_marked(-MARKED_OFFSET), None);
        assert_eq!(ChannelId::from_marked(0), None);
        assert_eq!(ChannelId(i64::MAX).marked(), None);
        assert_eq!(ChannelId(0).marked(), None);
        assert_eq!(ChannelId(MAX_CHANNEL_ID).marked(), Some(-i64::MAX));
        assert_eq!(
            ChannelId::from_marked(-i64::MAX),
            Some(ChannelId(MAX_CHANNEL_ID))
        );
    }

    #[test]
    fn selection_exposes_configured_references() {
        assert!(ChannelSelection::default().tracks_all());
        assert!(ChannelSelection::All.references().is_empty());
        let listed = ChannelSelection::Listed(Vec::new());
        assert!(!listed.tracks_all());
        assert!(listed.references().is_empty());
    }

    #[test]
    fn channel_ref_serde_uses_display_form() {
        let refs: Vec<ChannelRef> = serde_json::from_str(r#"["-100555", "@news"]"#).unwrap();
        assert_eq!(refs[0], ChannelRef::Numeric(ChannelId(555)));
        assert_eq!(
            serde_json::to_string(&refs).unwrap(),
            r#"["-100555","@news"]"#
        );
    }

    #[test]
    fn listed_set_matches_ids_and_handles() {
        let mut set = TrackedChannelSet::listed();
        set.insert_id(ChannelId(555));
        set.insert_handle("@News", ChannelId(777));

        assert!(set.matches(ChannelId(555), Some("renamed")));
        assert!(set.matches(ChannelId(777), None));
        assert!(set.matches(ChannelId(1), Some("NEWS")));
        assert!(!set.matches(ChannelId(999), Some("other")));
        assert!(!set.matches(ChannelId(999), None));
    }

    #[test]
    fn empty_listed_set_rejects_everything() {
        let set = TrackedChannelSet::listed();
        assert!(set.is_empty());
        assert!(!set.matches(ChannelId(1), Some("any")));
    }

    #[test]
    fn track_all_matches_anything() {
        let set = TrackedChannelSet::track_all();
        assert!(set.tracks_all());
        assert!(set.matches(ChannelId(42), None));
    }
}
