use thiserror::Error;

use chatsync_shared::ChannelId;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Chrono parsing error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),

    /// A message (or a page containing it) belongs to another channel.
    /// The window is left untouched.
    #[error("Message for channel {found} offered to window of channel {expected}")]
    ForeignMessage {
        expected: ChannelId,
        found: ChannelId,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
