//! # chatsync-client
//!
//! Runtime half of the sync engine. A [`SyncSession`] runs one task per
//! channel; each task owns its [`chatsync_store::ChannelWindow`] and folds
//! history pages, jump anchors and live events into it. Unread counters are
//! shared through [`UnreadService`].

pub mod backend;
pub mod channel_task;
pub mod config;
pub mod events;
pub mod memory;
pub mod merge;
pub mod pagination;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod unread;

#[cfg(test)]
mod test_support;

use tracing_subscriber::{fmt, EnvFilter};

pub use backend::{decode_frames, EventStream, SyncBackend};
pub use channel_task::{ChannelHandle, WindowView};
pub use config::SyncConfig;
pub use events::{NoticeBus, SyncNotice};
pub use memory::MemoryBackend;
pub use merge::{LiveMergeEngine, MergeOutcome, MergeReport, UnreadSignal};
pub use pagination::{clamp_page_size, PageOutcome, PaginationController};
pub use resolver::{JumpOutcome, JumpResolver};
pub use retry::RetryPolicy;
pub use session::SyncSession;
pub use unread::{Reconciliation, UnreadService, UnreadSnapshot, UnreadTracker};

/// Install the global `fmt` subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chatsync_client=debug,chatsync_store=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
