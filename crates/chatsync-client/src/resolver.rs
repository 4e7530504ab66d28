//! Jump/anchor resolution and the transient highlight it leaves behind.

use serde::Serialize;
use tracing::debug;

use chatsync_shared::{BackendError, ChannelId, Direction, Message, MessageId, SyncError};

use crate::backend::SyncBackend;

/// Result of a jump request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JumpOutcome {
    /// Target is in the window and highlighted.
    Highlighted {
        message_id: MessageId,
        position: usize,
    },
    /// Target is in the window, but the channel lost focus before the jump
    /// finished so no highlight was set.
    Loaded { position: usize },
    /// A newer jump request in the same channel took over.
    Superseded,
}

/// A contiguous page of history centered on a jump target.
#[derive(Debug, Clone)]
pub struct AnchorPage {
    pub messages: Vec<Message>,
    pub has_older: bool,
    pub has_newer: bool,
}

/// Highlight state machine: `none -> highlighted -> none`.
///
/// Each request takes a generation number. Only the newest generation may
/// set the highlight, and a clear only applies to the highlight its own
/// generation set.
#[derive(Debug, Default)]
pub struct JumpResolver {
    generation: u64,
    highlighted: Option<(u64, MessageId)>,
}

impl JumpResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a request; every older request is superseded.
    pub fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Returns `false` when `generation` was superseded.
    pub fn highlight(&mut self, generation: u64, id: MessageId) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.highlighted = Some((generation, id));
        true
    }

    pub fn clear(&mut self, generation: u64) -> bool {
        match &self.highlighted {
            Some((owner, _)) if *owner == generation => {
                self.highlighted = None;
                true
            }
            _ => false,
        }
    }

    /// Drop any highlight regardless of owner, e.g. when the window is evicted.
    pub fn reset(&mut self) {
        self.highlighted = None;
    }

    pub fn highlighted(&self) -> Option<&MessageId> {
        self.highlighted.as_ref().map(|(_, id)| id)
    }
}

/// Fetch the target and one page on each side of it.
pub async fn fetch_anchor(
    backend: &dyn SyncBackend,
    channel: &ChannelId,
    target: &MessageId,
    page_size: usize,
) -> Result<AnchorPage, SyncError> {
    let anchor = backend
        .fetch_message(channel, target)
        .await
        .map_err(|e| match e {
            BackendError::NotFound => SyncError::NotFound {
                channel: channel.clone(),
                message: target.clone(),
            },
            other => SyncError::from_backend(other),
        })?;

    let cursor = anchor.cursor();
    let (older, newer) = futures::try_join!(
        backend.fetch_history(channel, Some(&cursor), Direction::Older, page_size),
        backend.fetch_history(channel, Some(&cursor), Direction::Newer, page_size),
    )
    .map_err(SyncError::from_backend)?;

    debug!(
        channel = %channel,
        message = %target,
        older = older.len(),
        newer = newer.len(),
        "anchor page fetched"
    );

    let has_older = older.len() >= page_size;
    let has_newer = newer.len() >= page_size;
    let mut messages = Vec::with_capacity(older.len() + newer.len() + 1);
    messages.extend(older);
    messages.push(anchor);
    messages.extend(newer);
    messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    Ok(AnchorPage {
        messages,
        has_older,
        has_newer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{backend_with, msg};

    #[test]
    fn last_request_wins() {
        let mut resolver = JumpResolver::new();
        let first = resolver.begin();
        let second = resolver.begin();

        assert!(!resolver.highlight(first, MessageId::from("a")));
        assert!(resolver.highlight(second, MessageId::from("b")));
        assert_eq!(resolver.highlighted().unwrap().as_str(), "b");
    }

    #[test]
    fn stale_clear_keeps_newer_highlight() {
        let mut resolver = JumpResolver::new();
        let first = resolver.begin();
        resolver.highlight(first, MessageId::from("a"));
        let second = resolver.begin();
        resolver.highlight(second, MessageId::from("b"));

        assert!(!resolver.clear(first));
        assert_eq!(resolver.highlighted().unwrap().as_str(), "b");
        assert!(resolver.clear(second));
        assert!(resolver.highlighted().is_none());
    }

    #[tokio::test]
    async fn anchor_is_centered_on_target() {
        let backend = backend_with(
            "general",
            (0..100).map(|i| msg("general", &format!("m{i:03}"), "bob", i)),
        );

        let page = fetch_anchor(&backend, &ChannelId::from("general"), &MessageId::from("m050"), 10)
            .await
            .unwrap();

        assert_eq!(page.messages.len(), 21);
        assert_eq!(page.messages[0].id.as_str(), "m040");
        assert_eq!(page.messages[10].id.as_str(), "m050");
        assert_eq!(page.messages[20].id.as_str(), "m060");
        assert!(page.has_older);
        assert!(page.has_newer);
    }

    #[tokio::test]
    async fn anchor_near_edges_reports_bounds() {
        let backend = backend_with(
            "general",
            (0..8).map(|i| msg("general", &format!("m{i:03}"), "bob", i)),
        );

        let page = fetch_anchor(&backend, &ChannelId::from("general"), &MessageId::from("m002"), 10)
            .await
            .unwrap();

        assert_eq!(page.messages.len(), 8);
        assert!(!page.has_older);
        assert!(!page.has_newer);
    }

    #[tokio::test]
    async fn missing_target_is_not_found() {
        let backend = backend_with("general", vec![msg("general", "m1", "bob", 0)]);

        let err = fetch_anchor(&backend, &ChannelId::from("general"), &MessageId::from("gone"), 10)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::NotFound { .. }));
    }
}
