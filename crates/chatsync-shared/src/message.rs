//! The message record as the sync engine sees it.
//!
//! Bodies are opaque to the engine: it only needs an identity, a timestamp, an
//! author and the handful of mutable fields that live events touch.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, Cursor, MessageId, UserId};

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollOption {
    pub label: String,
    pub votes: u32,
}

/// Kind-specific message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessagePayload {
    Text {
        body: String,
    },
    Image {
        url: String,
        width: u32,
        height: u32,
        caption: Option<String>,
    },
    File {
        name: String,
        size_bytes: u64,
        url: String,
    },
    Poll {
        question: String,
        options: Vec<PollOption>,
    },
    /// Join/leave notices and similar server-generated lines.
    System {
        text: String,
    },
}

impl MessagePayload {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }

    /// Short single-line rendering used for reply previews.
    pub fn preview(&self, max_chars: usize) -> String {
        let full = match self {
            Self::Text { body } => body.clone(),
            Self::Image { caption, .. } => caption.clone().unwrap_or_else(|| "[image]".to_string()),
            Self::File { name, .. } => format!("[file] {name}"),
            Self::Poll { question, .. } => format!("[poll] {question}"),
            Self::System { text } => text.clone(),
        };
        let line = full.lines().next().unwrap_or_default();
        if line.chars().count() <= max_chars {
            line.to_string()
        } else {
            let mut cut: String = line.chars().take(max_chars).collect();
            cut.push('…');
            cut
        }
    }
}

// ---------------------------------------------------------------------------
// Reactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionEntry {
    pub count: u32,
    pub users: BTreeSet<UserId>,
}

/// Reaction key (emoji or custom key) to its aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionSummary(pub BTreeMap<String, ReactionEntry>);

impl ReactionSummary {
    /// Apply one add/remove delta. Returns `true` if the summary changed.
    ///
    /// Re-applying the same delta is a no-op, so at-least-once delivery of
    /// reaction events cannot inflate counts.
    pub fn apply(&mut self, key: &str, user: &UserId, added: bool) -> bool {
        if added {
            let entry = self.0.entry(key.to_string()).or_default();
            if !entry.users.insert(user.clone()) {
                return false;
            }
            entry.count = entry.count.saturating_add(1);
            true
        } else {
            let Some(entry) = self.0.get_mut(key) else {
                return false;
            };
            if !entry.users.remove(user) {
                return false;
            }
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                self.0.remove(key);
            }
            true
        }
    }

    pub fn count(&self, key: &str) -> u32 {
        self.0.get(key).map(|e| e.count).unwrap_or(0)
    }

    pub fn reacted_by(&self, key: &str, user: &UserId) -> bool {
        self.0.get(key).is_some_and(|e| e.users.contains(user))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// Cached view of a reply target, filled from the store when it is loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplySnapshot {
    pub author: UserId,
    pub preview: String,
    pub deleted: bool,
}

/// Reference to the message being replied to. Only `target` is
/// authoritative; the snapshot is a lazily refreshed cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyRef {
    pub target: MessageId,
    pub snapshot: Option<ReplySnapshot>,
}

impl ReplyRef {
    pub fn to(target: MessageId) -> Self {
        Self {
            target,
            snapshot: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: UserId,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub payload: MessagePayload,
    pub edited: bool,
    /// Tombstone flag. Deleted messages stay in the sequence.
    pub deleted: bool,
    pub pinned: bool,
    pub reactions: ReactionSummary,
    pub reply_to: Option<ReplyRef>,
}

impl Message {
    pub fn new(
        id: MessageId,
        channel_id: ChannelId,
        author: UserId,
        created_at: DateTime<Utc>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id,
            channel_id,
            author,
            created_at,
            modified_at: created_at,
            payload,
            edited: false,
            deleted: false,
            pinned: false,
            reactions: ReactionSummary::default(),
            reply_to: None,
        }
    }

    pub fn with_reply_to(mut self, target: MessageId) -> Self {
        self.reply_to = Some(ReplyRef::to(target));
        self
    }

    /// Total order key within a channel.
    pub fn sort_key(&self) -> (DateTime<Utc>, &MessageId) {
        (self.created_at, &self.id)
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.created_at, self.id.clone())
    }

    pub fn day(&self) -> NaiveDate {
        self.created_at.date_naive()
    }

    /// Turn the record into a tombstone. Content is kept so reply previews
    /// can still say who wrote it, but presentation must render a placeholder.
    pub fn tombstone(&mut self, at: DateTime<Utc>) -> bool {
        if self.deleted {
            return false;
        }
        self.deleted = true;
        self.modified_at = self.modified_at.max(at);
        true
    }

    pub fn reply_snapshot(&self) -> ReplySnapshot {
        ReplySnapshot {
            author: self.author.clone(),
            preview: if self.deleted {
                String::new()
            } else {
                self.payload.preview(crate::constants::REPLY_PREVIEW_CHARS)
            },
            deleted: self.deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user(name: &str) -> UserId {
        UserId::from(name)
    }

    #[test]
    fn test_reaction_delta_is_idempotent() {
        let mut summary = ReactionSummary::default();
        assert!(summary.apply("👍", &user("alice"), true));
        assert!(!summary.apply("👍", &user("alice"), true));
        assert!(summary.apply("👍", &user("bob"), true));
        assert_eq!(summary.count("👍"), 2);
        assert!(summary.reacted_by("👍", &user("bob")));

        assert!(summary.apply("👍", &user("alice"), false));
        assert!(!summary.apply("👍", &user("alice"), false));
        assert_eq!(summary.count("👍"), 1);
    }

    #[test]
    fn test_reaction_entry_removed_at_zero() {
        let mut summary = ReactionSummary::default();
        summary.apply("🎉", &user("alice"), true);
        summary.apply("🎉", &user("alice"), false);
        assert!(summary.is_empty());
        assert!(!summary.apply("🎉", &user("carol"), false));
    }

    #[test]
    fn test_preview_truncates_first_line() {
        let payload = MessagePayload::text("hello there world\nsecond line");
        assert_eq!(payload.preview(5), "hello…");
        assert_eq!(payload.preview(100), "hello there world");

        let file = MessagePayload::File {
            name: "notes.pdf".into(),
            size_bytes: 10,
            url: "https://files.example/notes.pdf".into(),
        };
        assert_eq!(file.preview(100), "[file] notes.pdf");
    }

    #[test]
    fn test_tombstone_keeps_record() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut msg = Message::new(
            MessageId::from("m1"),
            ChannelId::from("c1"),
            user("alice"),
            t,
            MessagePayload::text("secret"),
        );
        assert!(msg.tombstone(t + chrono::Duration::minutes(1)));
        assert!(!msg.tombstone(t + chrono::Duration::minutes(2)));
        assert!(msg.deleted);
        assert_eq!(msg.modified_at, t + chrono::Duration::minutes(1));

        let snap = msg.reply_snapshot();
        assert!(snap.deleted);
        assert!(snap.preview.is_empty());
        assert_eq!(snap.author, user("alice"));
    }
}
