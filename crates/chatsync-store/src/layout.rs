//! Presentation-facing layout of a window: date buckets and continuation.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use chatsync_shared::constants::CONTINUATION_GAP_SECS;
use chatsync_shared::Message;

/// One row of the flat, ordered window view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowItem {
    /// Synthetic marker placed before the first message of each calendar day.
    DateBucket { date: NaiveDate },
    Message {
        message: Message,
        /// Rendered without repeating the author header.
        continuation: bool,
    },
}

impl WindowItem {
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message { message, .. } => Some(message),
            Self::DateBucket { .. } => None,
        }
    }
}

/// Whether `next` visually merges into `prev`.
pub fn continues(prev: &Message, next: &Message) -> bool {
    if prev.author != next.author || prev.payload.is_system() || next.payload.is_system() {
        return false;
    }
    if prev.day() != next.day() {
        return false;
    }
    let gap = next.created_at.signed_duration_since(prev.created_at);
    gap.num_seconds() <= CONTINUATION_GAP_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_shared::{ChannelId, MessageId, MessagePayload, UserId};
    use chrono::{Duration, TimeZone, Utc};

    fn msg(id: &str, author: &str, minute: i64) -> Message {
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 23, 50, 0).unwrap();
        Message::new(
            MessageId::from(id),
            ChannelId::from("c"),
            UserId::from(author),
            base + Duration::minutes(minute),
            MessagePayload::text(id),
        )
    }

    #[test]
    fn test_same_author_within_gap_continues() {
        assert!(continues(&msg("a", "alice", 0), &msg("b", "alice", 4)));
        assert!(!continues(&msg("a", "alice", 0), &msg("b", "bob", 1)));
        assert!(!continues(&msg("a", "alice", 0), &msg("b", "alice", 6)));
    }

    #[test]
    fn test_day_change_breaks_continuation() {
        // 23:58 -> 00:01 next day
        assert!(!continues(&msg("a", "alice", 8), &msg("b", "alice", 11)));
    }

    #[test]
    fn test_system_messages_never_continue() {
        let mut sys = msg("b", "alice", 1);
        sys.payload = MessagePayload::System {
            text: "alice pinned a message".into(),
        };
        assert!(!continues(&msg("a", "alice", 0), &sys));
    }
}
