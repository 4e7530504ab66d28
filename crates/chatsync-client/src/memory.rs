//! In-memory [`SyncBackend`] with failure injection.
//!
//! Holds the authoritative history of every channel and fans published
//! events out to subscribers. Used by the replay tool and by tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use chatsync_shared::{
    BackendError, ChangeEvent, ChannelId, ChannelKind, ChannelUnread, Cursor, Direction, Message,
    MessageId, UserId,
};

use crate::backend::{EventStream, SyncBackend};

type SortKey = (DateTime<Utc>, MessageId);

struct MemoryChannel {
    kind: ChannelKind,
    history: BTreeMap<SortKey, Message>,
    unread: u32,
    subscribers: Vec<mpsc::UnboundedSender<ChangeEvent>>,
}

#[derive(Default)]
struct Inner {
    channels: BTreeMap<ChannelId, MemoryChannel>,
    fail_fetches: u32,
    fail_mark_reads: u32,
    fetch_delay: Option<Duration>,
    fetch_calls: usize,
    pages_read: usize,
    mark_read_calls: Vec<Vec<ChannelId>>,
}

/// Authoritative in-process backend.
pub struct MemoryBackend {
    viewer: Option<UserId>,
    inner: Mutex<Inner>,
    /// `false` while history replies are held back.
    replies_open: watch::Sender<bool>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            viewer: None,
            inner: Mutex::new(Inner::default()),
            replies_open: watch::channel(true).0,
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unread counts are tracked from this user's point of view: their own
    /// messages never count.
    pub fn for_viewer(viewer: UserId) -> Self {
        Self {
            viewer: Some(viewer),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_channel(&self, channel: ChannelId, kind: ChannelKind) {
        self.lock().channels.entry(channel).or_insert_with(|| MemoryChannel {
            kind,
            history: BTreeMap::new(),
            unread: 0,
            subscribers: Vec::new(),
        });
    }

    /// Add history without notifying subscribers.
    pub fn seed(&self, messages: impl IntoIterator<Item = Message>) {
        let mut inner = self.lock();
        for message in messages {
            if let Some(channel) = inner.channels.get_mut(&message.channel_id) {
                channel
                    .history
                    .insert((message.created_at, message.id.clone()), message);
            }
        }
    }

    pub fn set_unread(&self, channel: &ChannelId, count: u32) {
        if let Some(ch) = self.lock().channels.get_mut(channel) {
            ch.unread = count;
        }
    }

    /// Physically remove a message, as if deleted at the storage layer.
    pub fn purge(&self, channel: &ChannelId, message: &MessageId) -> bool {
        let mut inner = self.lock();
        let Some(ch) = inner.channels.get_mut(channel) else {
            return false;
        };
        let key = ch.history.keys().find(|(_, id)| id == message).cloned();
        key.and_then(|k| ch.history.remove(&k)).is_some()
    }

    /// Apply an event to the authoritative history and push it to every
    /// subscriber of the channel.
    pub fn publish(&self, event: ChangeEvent) {
        let viewer = self.viewer.clone();
        let mut inner = self.lock();
        let Some(ch) = inner.channels.get_mut(event.channel_id()) else {
            debug!(channel = %event.channel_id(), "publish to unknown channel ignored");
            return;
        };

        match &event {
            ChangeEvent::MessageCreated(m) => {
                let key = (m.created_at, m.id.clone());
                if !ch.history.contains_key(&key) && viewer.as_ref() != Some(&m.author) {
                    ch.unread += 1;
                }
                ch.history.insert(key, m.clone());
            }
            ChangeEvent::MessageEdited(m) => {
                ch.history.insert((m.created_at, m.id.clone()), m.clone());
            }
            ChangeEvent::MessageDeleted { message_id, .. } => {
                if let Some(m) = ch.history.values_mut().find(|m| &m.id == message_id) {
                    m.tombstone(Utc::now());
                }
            }
            ChangeEvent::ReactionChanged {
                message_id,
                reaction_key,
                user_id,
                added,
                ..
            } => {
                if let Some(m) = ch.history.values_mut().find(|m| &m.id == message_id) {
                    m.reactions.apply(reaction_key, user_id, *added);
                }
            }
            ChangeEvent::PinChanged {
                message_id, pinned, ..
            } => {
                if let Some(m) = ch.history.values_mut().find(|m| &m.id == message_id) {
                    m.pinned = *pinned;
                }
            }
        }

        ch.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Deliver an event to subscribers only, leaving history untouched
    /// (duplicate or late deliveries).
    pub fn redeliver(&self, event: ChangeEvent) {
        let mut inner = self.lock();
        if let Some(ch) = inner.channels.get_mut(event.channel_id()) {
            ch.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn fail_next_fetches(&self, count: u32) {
        self.lock().fail_fetches = count;
    }

    pub fn fail_next_mark_reads(&self, count: u32) {
        self.lock().fail_mark_reads = count;
    }

    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.lock().fetch_delay = delay;
    }

    pub fn fetch_calls(&self) -> usize {
        self.lock().fetch_calls
    }

    /// History pages are still read when requested, but their replies wait
    /// until [`release_replies`](Self::release_replies). Events published in
    /// between are newer than the page the caller will receive.
    pub fn hold_replies(&self) {
        self.replies_open.send_replace(false);
    }

    pub fn release_replies(&self) {
        self.replies_open.send_replace(true);
    }

    /// History pages read so far, including ones whose reply is held.
    pub fn pages_read(&self) -> usize {
        self.lock().pages_read
    }

    async fn replies_released(&self) {
        let mut open = self.replies_open.subscribe();
        let _ = open.wait_for(|open| *open).await;
    }

    pub fn mark_read_calls(&self) -> Vec<Vec<ChannelId>> {
        self.lock().mark_read_calls.clone()
    }

    pub fn unread(&self, channel: &ChannelId) -> Option<u32> {
        self.lock().channels.get(channel).map(|ch| ch.unread)
    }

    /// Full authoritative history of a channel, oldest first.
    pub fn history(&self, channel: &ChannelId) -> Vec<Message> {
        self.lock()
            .channels
            .get(channel)
            .map(|ch| ch.history.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Count a fetch and decide whether it should fail.
    fn begin_fetch(&self) -> (Option<Duration>, bool) {
        let mut inner = self.lock();
        inner.fetch_calls += 1;
        let fail = inner.fail_fetches > 0;
        if fail {
            inner.fail_fetches -= 1;
        }
        (inner.fetch_delay, fail)
    }
}

#[async_trait]
impl SyncBackend for MemoryBackend {
    async fn fetch_history(
        &self,
        channel: &ChannelId,
        cursor: Option<&Cursor>,
        direction: Direction,
        page_size: usize,
    ) -> Result<Vec<Message>, BackendError> {
        let (delay, fail) = self.begin_fetch();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(BackendError::Transient("injected fetch failure".into()));
        }

        let page = {
            let mut inner = self.lock();
            let ch = inner.channels.get(channel).ok_or(BackendError::NotFound)?;
            let history = &ch.history;

            let mut page: Vec<Message> = match (cursor, direction) {
                (None, _) => history.values().rev().take(page_size).cloned().collect(),
                (Some(c), Direction::Older) => {
                    let bound = (c.timestamp, c.id.clone());
                    history
                        .range(..bound)
                        .rev()
                        .take(page_size)
                        .map(|(_, m)| m.clone())
                        .collect()
                }
                (Some(c), Direction::Newer) => {
                    let bound = (c.timestamp, c.id.clone());
                    history
                        .range(bound..)
                        .filter(|(k, _)| k.0 != c.timestamp || k.1 != c.id)
                        .take(page_size)
                        .map(|(_, m)| m.clone())
                        .collect()
                }
            };

            page.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
            inner.pages_read += 1;
            page
        };

        self.replies_released().await;
        Ok(page)
    }

    async fn fetch_message(
        &self,
        channel: &ChannelId,
        message: &MessageId,
    ) -> Result<Message, BackendError> {
        let (delay, fail) = self.begin_fetch();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(BackendError::Transient("injected fetch failure".into()));
        }

        let inner = self.lock();
        let ch = inner.channels.get(channel).ok_or(BackendError::NotFound)?;
        ch.history
            .values()
            .find(|m| &m.id == message)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn event_stream(&self, channel: &ChannelId) -> Result<EventStream, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.lock();
            let ch = inner.channels.get_mut(channel).ok_or(BackendError::NotFound)?;
            ch.subscribers.push(tx);
        }
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }

    async fn mark_channels_read(&self, channels: &[ChannelId]) -> Result<(), BackendError> {
        let mut inner = self.lock();
        inner.mark_read_calls.push(channels.to_vec());
        if inner.fail_mark_reads > 0 {
            inner.fail_mark_reads -= 1;
            return Err(BackendError::Transient("injected mark-read failure".into()));
        }
        for id in channels {
            if let Some(ch) = inner.channels.get_mut(id) {
                ch.unread = 0;
            }
        }
        Ok(())
    }

    async fn channels_with_unread_counts(&self) -> Result<Vec<ChannelUnread>, BackendError> {
        let inner = self.lock();
        Ok(inner
            .channels
            .iter()
            .map(|(id, ch)| ChannelUnread {
                channel_id: id.clone(),
                kind: ch.kind,
                unread_count: ch.unread,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{backend_with, msg};

    #[tokio::test]
    async fn held_reply_carries_the_state_read_at_request_time() {
        let backend = std::sync::Arc::new(backend_with("general", vec![msg("general", "a", "bob", 0)]));
        backend.hold_replies();

        let pending = {
            let backend = std::sync::Arc::clone(&backend);
            tokio::spawn(async move {
                backend
                    .fetch_history(&ChannelId::from("general"), None, Direction::Older, 10)
                    .await
            })
        };
        crate::test_support::eventually(|| backend.pages_read() == 1).await;
        backend.publish(ChangeEvent::MessageCreated(msg("general", "b", "bob", 1)));
        backend.release_replies();

        let page = pending.await.unwrap().unwrap();
        let ids: Vec<&str> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(backend.history(&ChannelId::from("general")).len(), 2);
    }

    #[tokio::test]
    async fn pages_are_oldest_first_in_both_directions() {
        let backend = backend_with("general", (0..10).map(|i| msg("general", &format!("m{i:02}"), "bob", i)));
        let channel = ChannelId::from("general");

        let newest = backend
            .fetch_history(&channel, None, Direction::Older, 3)
            .await
            .unwrap();
        let ids: Vec<&str> = newest.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m07", "m08", "m09"]);

        let older = backend
            .fetch_history(&channel, Some(&newest[0].cursor()), Direction::Older, 3)
            .await
            .unwrap();
        let ids: Vec<&str> = older.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m04", "m05", "m06"]);

        let newer = backend
            .fetch_history(&channel, Some(&older[0].cursor()), Direction::Newer, 2)
            .await
            .unwrap();
        let ids: Vec<&str> = newer.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m05", "m06"]);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = backend_with("general", vec![msg("general", "m1", "bob", 0)]);
        let channel = ChannelId::from("general");
        backend.fail_next_fetches(1);

        assert!(backend
            .fetch_history(&channel, None, Direction::Older, 5)
            .await
            .is_err());
        assert!(backend
            .fetch_history(&channel, None, Direction::Older, 5)
            .await
            .is_ok());
        assert_eq!(backend.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_and_counts_unread() {
        let backend = MemoryBackend::for_viewer(UserId::from("alice"));
        let channel = ChannelId::from("general");
        backend.add_channel(channel.clone(), ChannelKind::Group);
        let mut stream = backend.event_stream(&channel).await.unwrap();

        backend.publish(ChangeEvent::MessageCreated(msg("general", "m1", "bob", 0)));
        backend.publish(ChangeEvent::MessageCreated(msg("general", "m2", "alice", 1)));

        assert_eq!(stream.next().await.unwrap().message_id().as_str(), "m1");
        assert_eq!(stream.next().await.unwrap().message_id().as_str(), "m2");
        assert_eq!(backend.unread(&channel), Some(1));
    }

    #[tokio::test]
    async fn purged_message_is_not_found() {
        let backend = backend_with("general", vec![msg("general", "m1", "bob", 0)]);
        let channel = ChannelId::from("general");
        assert!(backend.purge(&channel, &MessageId::from("m1")));

        let err = backend
            .fetch_message(&channel, &MessageId::from("m1"))
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::NotFound);
    }
}
