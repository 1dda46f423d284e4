//! Domain types shared by the store, the counting engine and the sources.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SourceError};

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// SQLite stores integers as i64; snowflakes fit below 2^63.
            #[must_use]
            pub(crate) const fn as_sql(self) -> i64 {
                self.0 as i64
            }

            #[must_use]
            pub(crate) const fn from_sql(value: i64) -> Self {
                Self(value as u64)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

snowflake_id!(
    /// Community (guild) identifier.
    CommunityId
);
snowflake_id!(
    /// User identifier.
    UserId
);
snowflake_id!(
    /// Channel or thread identifier.
    ChannelId
);
snowflake_id!(
    /// Message identifier. Ordered by creation time.
    MessageId
);

/// What kind of channel a [`ChannelInfo`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Announcement,
    Voice,
    Stage,
    Forum,
    Category,
    PublicThread,
    PrivateThread,
    AnnouncementThread,
}

impl ChannelKind {
    /// Whether messages can be read from this channel directly.
    #[must_use]
    pub const fn has_history(self) -> bool {
        !matches!(self, Self::Forum | Self::Category)
    }

    /// Whether this channel can parent threads (archived ones included).
    #[must_use]
    pub const fn can_have_threads(self) -> bool {
        matches!(self, Self::Text | Self::Announcement | Self::Forum)
    }

    #[must_use]
    pub const fn is_thread(self) -> bool {
        matches!(
            self,
            Self::PublicThread | Self::PrivateThread | Self::AnnouncementThread
        )
    }
}

/// A channel or thread as reported by the history source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    pub kind: ChannelKind,
    /// Category for top-level channels, parent channel for threads.
    pub parent_id: Option<ChannelId>,
    pub parent_name: Option<String>,
    pub nsfw: bool,
    pub parent_nsfw: bool,
    /// Whether the reader may fetch message history here.
    pub can_read_history: bool,
    pub archived: bool,
}

impl ChannelInfo {
    /// A readable text channel with no parent. Convenient for fixtures.
    #[must_use]
    pub fn text(id: u64, name: impl Into<String>) -> Self {
        Self {
            id: ChannelId(id),
            name: name.into(),
            kind: ChannelKind::Text,
            parent_id: None,
            parent_name: None,
            nsfw: false,
            parent_nsfw: false,
            can_read_history: true,
            archived: false,
        }
    }

    /// Attach a parent (category or parent channel).
    #[must_use]
    pub fn with_parent(mut self, parent: &ChannelInfo) -> Self {
        self.parent_id = Some(parent.id);
        self.parent_name = Some(parent.name.clone());
        self.parent_nsfw = parent.nsfw || parent.parent_nsfw;
        self
    }

    /// A thread under `parent`.
    #[must_use]
    pub fn thread(id: u64, name: impl Into<String>, parent: &ChannelInfo, archived: bool) -> Self {
        Self {
            id: ChannelId(id),
            name: name.into(),
            kind: ChannelKind::PublicThread,
            parent_id: None,
            parent_name: None,
            nsfw: false,
            parent_nsfw: false,
            can_read_history: parent.can_read_history,
            archived,
        }
        .with_parent(parent)
    }
}

/// One message from a history page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: MessageId,
    pub author_id: UserId,
    pub author_bot: bool,
    pub created_at: DateTime<Utc>,
}

/// A message observed live by the surrounding bot runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub community: CommunityId,
    pub user: UserId,
    pub channel: ChannelId,
    pub author_bot: bool,
    pub created_at: DateTime<Utc>,
}

/// Membership snapshot of one user in one community.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSnapshot {
    pub user: UserId,
    pub display_name: String,
    pub joined_at: Option<DateTime<Utc>>,
    pub is_bot: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl MemberSnapshot {
    #[must_use]
    pub fn new(user: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user,
            display_name: display_name.into(),
            joined_at: None,
            is_bot: false,
            last_seen_at: None,
        }
    }
}

/// Signed adjustment for one (user, channel) counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountDelta {
    pub user: UserId,
    pub channel: ChannelId,
    pub delta: i64,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// A channel that could not be processed during a count, backfill or audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFailure {
    pub channel: ChannelId,
    pub name: String,
    pub kind: ErrorKind,
    pub error: String,
}

impl ChannelFailure {
    #[must_use]
    pub fn new(channel: &ChannelInfo, err: &SourceError) -> Self {
        Self {
            channel: channel.id,
            name: channel.name.clone(),
            kind: err.kind(),
            error: err.to_string(),
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&UserId(42)).unwrap();
        assert_eq!(json, "42");
        let back: ChannelId = serde_json::from_str("7").unwrap();
        assert_eq!(back, ChannelId(7));
    }

    #[test]
    fn snowflakes_survive_sql_conversion() {
        let id = MessageId(1_234_567_890_123_456_789);
        assert_eq!(MessageId::from_sql(id.as_sql()), id);
    }

    #[test]
    fn thread_inherits_parent_flags() {
        let mut parent = ChannelInfo::text(1, "general");
        parent.nsfw = true;
        let thread = ChannelInfo::thread(2, "side-chat", &parent, true);
        assert_eq!(thread.parent_id, Some(ChannelId(1)));
        assert_eq!(thread.parent_name.as_deref(), Some("general"));
        assert!(thread.parent_nsfw);
        assert!(thread.archived);
        assert!(thread.kind.is_thread());
    }

    #[test]
    fn forum_and_category_have_no_direct_history() {
        assert!(!ChannelKind::Forum.has_history());
        assert!(!ChannelKind::Category.has_history());
        assert!(ChannelKind::Forum.can_have_threads());
        assert!(ChannelKind::Voice.has_history());
    }
}
