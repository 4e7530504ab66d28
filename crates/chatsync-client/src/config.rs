//! Client configuration loaded from environment variables.
//!
//! All settings have sensible defaults so a session can start with zero
//! configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chatsync_shared::constants::{
    DEFAULT_COMMAND_BUFFER, DEFAULT_HIGHLIGHT_MS, DEFAULT_PAGE_SIZE, DEFAULT_WINDOW_CACHE,
};

use crate::pagination::clamp_page_size;
use crate::retry::RetryPolicy;

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Messages requested per history page.
    /// Env: `CHATSYNC_PAGE_SIZE`
    /// Default: `50` (clamped to `1..=100`)
    pub page_size: usize,

    /// How long a jump target stays highlighted.
    /// Env: `CHATSYNC_HIGHLIGHT_MS`
    /// Default: `2000`
    pub highlight_duration: Duration,

    /// Recently viewed channels whose windows stay materialized.
    /// Env: `CHATSYNC_WINDOW_CACHE`
    /// Default: `8`
    pub window_cache_capacity: usize,

    /// Attempts made for a mark-as-read call triggered by focusing a channel.
    /// Env: `CHATSYNC_MARK_READ_ATTEMPTS`
    /// Default: `3`
    pub mark_read_attempts: u32,

    /// Backoff between mark-as-read attempts.
    /// Env: `CHATSYNC_RETRY_BASE_MS` / `CHATSYNC_RETRY_MAX_MS`
    /// Default: `250` / `5000`
    pub retry: RetryPolicy,

    /// Session metadata database file.
    /// Env: `CHATSYNC_DB_PATH`
    /// Default: unset (in-memory database).
    pub db_path: Option<PathBuf>,

    /// Queue depth of each channel task.
    /// Env: `CHATSYNC_COMMAND_BUFFER`
    /// Default: `64`
    pub command_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            highlight_duration: Duration::from_millis(DEFAULT_HIGHLIGHT_MS),
            window_cache_capacity: DEFAULT_WINDOW_CACHE,
            mark_read_attempts: 3,
            retry: RetryPolicy::new(250, 5_000),
            db_path: None,
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = parse_var::<usize>("CHATSYNC_PAGE_SIZE") {
            config.page_size = clamp_page_size(size);
        }

        if let Some(ms) = parse_var::<u64>("CHATSYNC_HIGHLIGHT_MS") {
            config.highlight_duration = Duration::from_millis(ms);
        }

        if let Some(capacity) = parse_var::<usize>("CHATSYNC_WINDOW_CACHE") {
            config.window_cache_capacity = capacity.max(1);
        }

        if let Some(attempts) = parse_var::<u32>("CHATSYNC_MARK_READ_ATTEMPTS") {
            config.mark_read_attempts = attempts.max(1);
        }

        let base = parse_var::<u64>("CHATSYNC_RETRY_BASE_MS");
        let max = parse_var::<u64>("CHATSYNC_RETRY_MAX_MS");
        if base.is_some() || max.is_some() {
            config.retry = RetryPolicy::new(
                base.unwrap_or(config.retry.base_delay_ms()),
                max.unwrap_or(config.retry.max_delay_ms()),
            );
        }

        if let Ok(path) = std::env::var("CHATSYNC_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(buffer) = parse_var::<usize>("CHATSYNC_COMMAND_BUFFER") {
            config.command_buffer = buffer.max(1);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Read and parse one variable. Unparseable values are logged and ignored.
fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}
