//! Value types describing a channel window from the outside.

use serde::{Deserialize, Serialize};

use chatsync_shared::Cursor;

/// Result of upserting a message into a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The identity was new to the window.
    Inserted,
    /// An existing record with the same identity was updated in place.
    Replaced,
    /// The incoming record was identical or older than what the window holds.
    Unchanged,
}

/// Where a message sort key falls relative to the materialized window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Nothing is materialized for this channel.
    Unloaded,
    /// Strictly older than `oldest_loaded`.
    BeforeWindow,
    /// Between the two bounds (or already present).
    Inside,
    /// Strictly newer than `newest_loaded`.
    AfterWindow,
}

/// Bounds of the contiguous slice currently held for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBounds {
    pub loaded: bool,
    pub oldest_loaded: Option<Cursor>,
    pub newest_loaded: Option<Cursor>,
    /// More history exists before `oldest_loaded`.
    pub has_older: bool,
    /// More history exists after `newest_loaded`; `false` means the window
    /// reaches the live edge.
    pub has_newer: bool,
}
