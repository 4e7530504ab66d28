/// Default number of messages requested per history page
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Hard upper bound on a history page, whatever the caller asks for
pub const MAX_PAGE_SIZE: usize = 100;

/// How long a jump target stays highlighted (milliseconds)
pub const DEFAULT_HIGHLIGHT_MS: u64 = 2_000;

/// Number of recently viewed channels whose windows stay materialized
pub const DEFAULT_WINDOW_CACHE: usize = 8;

/// Maximum gap between two messages of the same author rendered as one group
pub const CONTINUATION_GAP_SECS: i64 = 300;

/// Events held for the unloaded gap ahead of a re-anchored window
pub const MAX_PENDING_EVENTS: usize = 256;

/// Message identities remembered per channel to make unread counting idempotent
pub const SEEN_CREATES_MEMORY: usize = 512;

/// Characters kept in a cached reply preview
pub const REPLY_PREVIEW_CHARS: usize = 80;

/// Buffer sizes for task queues and broadcast channels
pub const DEFAULT_COMMAND_BUFFER: usize = 64;
pub const NOTICE_BUFFER: usize = 128;
