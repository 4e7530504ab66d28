//! # chatsync-store
//!
//! Client-side storage for the chatsync engine.
//!
//! [`ChannelWindow`] is the in-memory channel message store: an ordered,
//! contiguous slice of one channel's history with date buckets and
//! continuation flags maintained incrementally. [`Database`] is a small
//! SQLite file holding session metadata that must survive a restart.

pub mod database;
pub mod layout;
pub mod migrations;
pub mod models;
pub mod session_meta;
pub mod window;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use layout::WindowItem;
pub use models::*;
pub use window::ChannelWindow;
