use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Opaque message identity, unique within a channel and stable across
    /// re-deliveries of the same event.
    MessageId
);

string_id!(
    /// Opaque channel identity.
    ChannelId
);

string_id!(
    /// Opaque user identity.
    UserId
);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Group,
    Direct,
}

/// Temporal direction of a history request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Older,
    Newer,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Older => f.write_str("older"),
            Direction::Newer => f.write_str("newer"),
        }
    }
}

/// Position in a channel's history: the `(timestamp, identity)` sort key of a
/// message. Callers treat it as opaque and only hand it back to the history
/// API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub id: MessageId,
}

impl Cursor {
    pub fn new(timestamp: DateTime<Utc>, id: MessageId) -> Self {
        Self { timestamp, id }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.timestamp.to_rfc3339())
    }
}

/// One row of the authoritative channel list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelUnread {
    pub channel_id: ChannelId,
    pub kind: ChannelKind,
    pub unread_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cursor_orders_by_timestamp_then_id() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let a = Cursor::new(t, MessageId::from("a"));
        let b = Cursor::new(t, MessageId::from("b"));
        let later = Cursor::new(t + chrono::Duration::seconds(1), MessageId::from("a"));

        assert!(a < b);
        assert!(b < later);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = ChannelId::from("general");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"general\"");
    }
}
