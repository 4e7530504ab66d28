use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::types::{ChannelId, MessageId, UserId};

/// Channel-scoped change pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A new message was posted.
    MessageCreated(Message),

    /// A message was edited. Carries the full post-edit record.
    MessageEdited(Message),

    /// A message was deleted upstream and should become a tombstone.
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
        /// Creation time of the target when the server includes it; lets the
        /// merge engine place events for messages it has not loaded.
        created_at: Option<DateTime<Utc>>,
    },

    /// A user added or removed a reaction.
    ReactionChanged {
        channel_id: ChannelId,
        message_id: MessageId,
        reaction_key: String,
        user_id: UserId,
        added: bool,
    },

    /// A message was pinned or unpinned.
    PinChanged {
        channel_id: ChannelId,
        message_id: MessageId,
        pinned: bool,
    },
}

impl ChangeEvent {
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            Self::MessageCreated(m) | Self::MessageEdited(m) => &m.channel_id,
            Self::MessageDeleted { channel_id, .. }
            | Self::ReactionChanged { channel_id, .. }
            | Self::PinChanged { channel_id, .. } => channel_id,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::MessageCreated(m) | Self::MessageEdited(m) => &m.id,
            Self::MessageDeleted { message_id, .. }
            | Self::ReactionChanged { message_id, .. }
            | Self::PinChanged { message_id, .. } => message_id,
        }
    }

    /// Creation time of the target message, when the event carries it.
    pub fn target_created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::MessageCreated(m) | Self::MessageEdited(m) => Some(m.created_at),
            Self::MessageDeleted { created_at, .. } => *created_at,
            Self::ReactionChanged { .. } | Self::PinChanged { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageCreated(_) => "created",
            Self::MessageEdited(_) => "edited",
            Self::MessageDeleted { .. } => "deleted",
            Self::ReactionChanged { .. } => "reaction",
            Self::PinChanged { .. } => "pin",
        }
    }

    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
