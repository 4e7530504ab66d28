//! # chatsync-shared
//!
//! Types shared by every chatsync crate: identities, the message record and
//! its payload variants, the live change-event protocol and the error
//! taxonomy.

pub mod constants;
pub mod error;
pub mod message;
pub mod protocol;
pub mod types;

pub use error::{BackendError, SyncError};
pub use message::{
    Message, MessagePayload, PollOption, ReactionEntry, ReactionSummary, ReplyRef, ReplySnapshot,
};
pub use protocol::ChangeEvent;
pub use types::{ChannelId, ChannelKind, ChannelUnread, Cursor, Direction, MessageId, UserId};
