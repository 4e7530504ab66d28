use thiserror::Error;

use crate::types::{ChannelId, MessageId};

/// Failure reported by a backend collaborator (history API, read marker,
/// channel directory).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Network failure or timeout. Safe to retry.
    #[error("Transient backend failure: {0}")]
    Transient(String),

    /// The channel or message no longer exists (or is no longer visible).
    #[error("Not found")]
    NotFound,

    /// The backend refused the request.
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Errors surfaced to callers of the sync engine.
///
/// Values are `Clone` because one in-flight page fetch can answer several
/// joined callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A fetch failed and left the window untouched. Retry is allowed.
    #[error("Fetch failed: {0}")]
    TransientFetch(String),

    /// The jump target does not exist (anymore) in the channel's history.
    #[error("Message {message} not found in channel {channel}")]
    NotFound {
        channel: ChannelId,
        message: MessageId,
    },

    /// The channel is not part of this session's channel list.
    #[error("Unknown channel: {0}")]
    ChannelUnknown(ChannelId),

    /// The backend refused a request outright.
    #[error("Backend rejected request: {0}")]
    Rejected(String),

    /// A mark-as-read call failed. Local counters keep their optimistic zero.
    #[error("Mark as read failed: {0}")]
    MarkRead(String),

    /// The session (or the channel's task) has been torn down.
    #[error("Sync session is closed")]
    SessionClosed,

    /// Local store failure.
    #[error("Store error: {0}")]
    Store(String),
}

impl SyncError {
    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFetch(_))
    }

    /// Map a backend failure for a history request.
    pub fn from_backend(err: BackendError) -> Self {
        match err {
            BackendError::Transient(msg) => Self::TransientFetch(msg),
            BackendError::NotFound => Self::TransientFetch("history endpoint not found".into()),
            BackendError::Rejected(msg) => Self::Rejected(msg),
        }
    }
}
