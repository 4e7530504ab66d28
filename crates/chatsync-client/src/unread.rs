//! Unread tracking: per-channel counters and watermarks, derived aggregates,
//! and optimistic mark-as-read.
//!
//! [`UnreadTracker`] is the pure state. [`UnreadService`] wraps it with the
//! backend calls, persistence of watermarks and user-visible notices.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chatsync_shared::{BackendError, ChannelId, ChannelKind, ChannelUnread, SyncError, UserId};
use chatsync_store::Database;

use crate::backend::SyncBackend;
use crate::events::{NoticeBus, SyncNotice};
use crate::merge::UnreadSignal;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadCounter {
    pub kind: ChannelKind,
    pub unread_count: u32,
    /// Creates at or before this instant are considered seen.
    pub last_seen: Option<DateTime<Utc>>,
    /// Server timestamp of the newest create observed in this channel.
    /// Watermarks only ever move to server time, never the local clock.
    pub newest_create: Option<DateTime<Utc>>,
}

/// Point-in-time view of every counter plus the derived totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadSnapshot {
    /// Sorted by channel id.
    pub channels: Vec<ChannelUnread>,
    pub total_in_channels: u64,
    pub total_in_direct_messages: u64,
}

/// What an authoritative refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Channels the session did not know about yet.
    pub added: Vec<ChannelUnread>,
    /// Channels no longer in the membership list.
    pub removed: Vec<ChannelId>,
    /// Known channels whose local count disagreed and was overwritten.
    pub corrected: usize,
}

/// Counter state for every member channel.
#[derive(Debug)]
pub struct UnreadTracker {
    self_id: UserId,
    counters: HashMap<ChannelId, UnreadCounter>,
    focused: Option<ChannelId>,
}

impl UnreadTracker {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            counters: HashMap::new(),
            focused: None,
        }
    }

    /// Seed counters from the first authoritative snapshot and the locally
    /// persisted watermarks.
    pub fn initialize(
        &mut self,
        rows: &[ChannelUnread],
        watermarks: &HashMap<ChannelId, DateTime<Utc>>,
    ) {
        for row in rows {
            self.counters.insert(
                row.channel_id.clone(),
                UnreadCounter {
                    kind: row.kind,
                    unread_count: row.unread_count,
                    last_seen: watermarks.get(&row.channel_id).copied(),
                    newest_create: None,
                },
            );
        }
    }

    /// Authoritative counts always win over local ones.
    pub fn reconcile(&mut self, rows: &[ChannelUnread]) -> Reconciliation {
        let mut result = Reconciliation::default();

        for row in rows {
            match self.counters.get_mut(&row.channel_id) {
                Some(counter) => {
                    if counter.unread_count != row.unread_count {
                        debug!(
                            channel = %row.channel_id,
                            local = counter.unread_count,
                            authoritative = row.unread_count,
                            "reconciliation mismatch, taking authoritative count"
                        );
                        counter.unread_count = row.unread_count;
                        result.corrected += 1;
                    }
                    counter.kind = row.kind;
                }
                None => {
                    self.counters.insert(
                        row.channel_id.clone(),
                        UnreadCounter {
                            kind: row.kind,
                            unread_count: row.unread_count,
                            last_seen: None,
                            newest_create: None,
                        },
                    );
                    result.added.push(row.clone());
                }
            }
        }

        let known: Vec<ChannelId> = self.counters.keys().cloned().collect();
        for channel in known {
            if !rows.iter().any(|row| row.channel_id == channel) {
                self.counters.remove(&channel);
                if self.focused.as_ref() == Some(&channel) {
                    self.focused = None;
                }
                result.removed.push(channel);
            }
        }
        result.removed.sort();

        result
    }

    /// Apply an increment signal from the merge engine. Returns whether the
    /// counter moved.
    pub fn record_created(&mut self, signal: &UnreadSignal) -> bool {
        let focused = self.focused.as_ref() == Some(&signal.channel_id);
        let Some(counter) = self.counters.get_mut(&signal.channel_id) else {
            debug!(channel = %signal.channel_id, "create for unknown channel ignored");
            return false;
        };
        counter.newest_create = later(counter.newest_create, signal.created_at);
        if signal.author == self.self_id {
            return false;
        }
        if focused {
            counter.last_seen = later(counter.last_seen, signal.created_at);
            return false;
        }
        if counter.last_seen.is_some_and(|seen| signal.created_at <= seen) {
            return false;
        }
        counter.unread_count = counter.unread_count.saturating_add(1);
        true
    }

    /// Zero a counter and move its watermark up to the newest create seen
    /// in the channel. Returns the count that was cleared.
    pub fn mark_seen(&mut self, channel: &ChannelId) -> Option<u32> {
        let counter = self.counters.get_mut(channel)?;
        let cleared = counter.unread_count;
        counter.unread_count = 0;
        if let Some(newest) = counter.newest_create {
            counter.last_seen = later(counter.last_seen, newest);
        }
        Some(cleared)
    }

    pub fn last_seen(&self, channel: &ChannelId) -> Option<DateTime<Utc>> {
        self.counters.get(channel).and_then(|c| c.last_seen)
    }

    pub fn set_focused(&mut self, channel: Option<ChannelId>) {
        self.focused = channel;
    }

    pub fn focused(&self) -> Option<&ChannelId> {
        self.focused.as_ref()
    }

    pub fn contains(&self, channel: &ChannelId) -> bool {
        self.counters.contains_key(channel)
    }

    pub fn counter(&self, channel: &ChannelId) -> Option<&UnreadCounter> {
        self.counters.get(channel)
    }

    pub fn unread_count(&self, channel: &ChannelId) -> Option<u32> {
        self.counters.get(channel).map(|c| c.unread_count)
    }

    fn total_of(&self, kind: ChannelKind) -> u64 {
        self.counters
            .values()
            .filter(|c| c.kind == kind)
            .map(|c| u64::from(c.unread_count))
            .sum()
    }

    pub fn total_unread_in_channels(&self) -> u64 {
        self.total_of(ChannelKind::Group)
    }

    pub fn total_unread_in_direct_messages(&self) -> u64 {
        self.total_of(ChannelKind::Direct)
    }

    pub fn snapshot(&self) -> UnreadSnapshot {
        let mut channels: Vec<ChannelUnread> = self
            .counters
            .iter()
            .map(|(id, c)| ChannelUnread {
                channel_id: id.clone(),
                kind: c.kind,
                unread_count: c.unread_count,
            })
            .collect();
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        UnreadSnapshot {
            channels,
            total_in_channels: self.total_unread_in_channels(),
            total_in_direct_messages: self.total_unread_in_direct_messages(),
        }
    }
}

fn later(current: Option<DateTime<Utc>>, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(current.map_or(at, |seen| seen.max(at)))
}

/// Shared unread service. Every channel task and the session hold the same
/// instance.
pub struct UnreadService {
    tracker: Mutex<UnreadTracker>,
    backend: Arc<dyn SyncBackend>,
    notices: NoticeBus,
    retry: RetryPolicy,
    attempts: u32,
    db: Arc<Mutex<Database>>,
}

impl UnreadService {
    pub fn new(
        self_id: UserId,
        backend: Arc<dyn SyncBackend>,
        notices: NoticeBus,
        retry: RetryPolicy,
        attempts: u32,
        db: Arc<Mutex<Database>>,
    ) -> Self {
        Self {
            tracker: Mutex::new(UnreadTracker::new(self_id)),
            backend,
            notices,
            retry,
            attempts: attempts.max(1),
            db,
        }
    }

    fn tracker(&self) -> MutexGuard<'_, UnreadTracker> {
        self.tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn initialize(
        &self,
        rows: &[ChannelUnread],
        watermarks: &HashMap<ChannelId, DateTime<Utc>>,
    ) {
        self.tracker().initialize(rows, watermarks);
    }

    pub fn reconcile(&self, rows: &[ChannelUnread]) -> Reconciliation {
        self.tracker().reconcile(rows)
    }

    pub fn record_created(&self, signal: &UnreadSignal) -> bool {
        self.tracker().record_created(signal)
    }

    pub fn unread_count(&self, channel: &ChannelId) -> Option<u32> {
        self.tracker().unread_count(channel)
    }

    pub fn snapshot(&self) -> UnreadSnapshot {
        self.tracker().snapshot()
    }

    /// The user's view of `channel` became focused: zero its counter now and
    /// acknowledge it to the server in the background. The returned task is
    /// detached; dropping the handle does not cancel the call.
    pub fn focus(&self, channel: &ChannelId) -> JoinHandle<()> {
        let watermarks = {
            let mut tracker = self.tracker();
            tracker.set_focused(Some(channel.clone()));
            tracker.mark_seen(channel);
            watermarks_of(&tracker, std::slice::from_ref(channel))
        };
        self.persist_watermarks(&watermarks);

        let backend = Arc::clone(&self.backend);
        let notices = self.notices.clone();
        let retry = self.retry;
        let attempts = self.attempts;
        let channels = vec![channel.clone()];
        tokio::spawn(async move {
            mark_read_with_retry(backend, channels, retry, attempts, notices).await;
        })
    }

    pub fn blur(&self, channel: &ChannelId) {
        let mut tracker = self.tracker();
        if tracker.focused() == Some(channel) {
            tracker.set_focused(None);
        }
    }

    /// Zero every listed counter in one batch, then issue a single server
    /// call. A failure is surfaced as a notice and an error; counters are
    /// not rolled back.
    pub async fn mark_all_as_read(&self, channels: &[ChannelId]) -> Result<(), SyncError> {
        let watermarks = {
            let mut tracker = self.tracker();
            for channel in channels {
                tracker.mark_seen(channel);
            }
            watermarks_of(&tracker, channels)
        };
        self.persist_watermarks(&watermarks);

        let backend = Arc::clone(&self.backend);
        let batch = channels.to_vec();
        // Spawned so that dropping this future cannot cancel the call.
        let call = tokio::spawn(async move { backend.mark_channels_read(&batch).await });

        let result = match call.await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(format!("mark-read task failed: {e}")),
        };

        match result {
            Ok(()) => {
                info!(count = channels.len(), "marked channels read");
                Ok(())
            }
            Err(error) => {
                self.notices.emit(SyncNotice::MarkReadFailed {
                    channels: channels.to_vec(),
                    error: error.clone(),
                });
                Err(SyncError::MarkRead(error))
            }
        }
    }

    fn persist_watermarks(&self, watermarks: &[(ChannelId, DateTime<Utc>)]) {
        let db = self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (channel, at) in watermarks {
            if let Err(e) = db.save_watermark(channel, *at) {
                warn!(channel = %channel, error = %e, "failed to persist read watermark");
            }
        }
    }
}

fn watermarks_of(
    tracker: &UnreadTracker,
    channels: &[ChannelId],
) -> Vec<(ChannelId, DateTime<Utc>)> {
    channels
        .iter()
        .filter_map(|c| tracker.last_seen(c).map(|at| (c.clone(), at)))
        .collect()
}

async fn mark_read_with_retry(
    backend: Arc<dyn SyncBackend>,
    channels: Vec<ChannelId>,
    retry: RetryPolicy,
    attempts: u32,
    notices: NoticeBus,
) {
    let mut attempt = 0;
    loop {
        match backend.mark_channels_read(&channels).await {
            Ok(()) => {
                debug!(?channels, attempt, "mark-read acknowledged");
                return;
            }
            Err(e) => {
                attempt += 1;
                let retryable = matches!(e, BackendError::Transient(_));
                if !retryable || attempt >= attempts {
                    notices.emit(SyncNotice::MarkReadFailed {
                        channels,
                        error: e.to_string(),
                    });
                    return;
                }
                let delay = retry.delay_for_attempt(attempt - 1);
                warn!(?channels, attempt, delay_ms = delay.as_millis() as u64, error = %e, "mark-read failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
