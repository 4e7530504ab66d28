//! Session context: everything tied to one signed-in user, constructed at
//! login and torn down at logout.
//!
//! The session owns one [`ChannelHandle`] per member channel, the shared
//! unread service, the notice bus, the recently viewed LRU and the metadata
//! database. UI surfaces only talk to the session; there is no global state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use hashlink::LruCache;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chatsync_shared::constants::NOTICE_BUFFER;
use chatsync_shared::{ChannelId, Direction, Message, MessageId, SyncError, UserId};
use chatsync_store::Database;

use crate::backend::SyncBackend;
use crate::channel_task::{ChannelHandle, TaskContext, WindowView};
use crate::config::SyncConfig;
use crate::events::{NoticeBus, SyncNotice};
use crate::pagination::PageOutcome;
use crate::resolver::JumpOutcome;
use crate::unread::{Reconciliation, UnreadService, UnreadSnapshot};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn store_error(e: chatsync_store::StoreError) -> SyncError {
    SyncError::Store(e.to_string())
}

pub struct SyncSession {
    self_id: UserId,
    ctx: TaskContext,
    db: Arc<Mutex<Database>>,
    handles: Mutex<HashMap<ChannelId, ChannelHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    recent: Mutex<LruCache<ChannelId, ()>>,
    focused: Mutex<Option<ChannelId>>,
    last_visited: Option<ChannelId>,
}

impl SyncSession {
    /// Log in: open the metadata database, fetch the authoritative channel
    /// list and start one task per member channel.
    pub async fn start(
        config: SyncConfig,
        backend: Arc<dyn SyncBackend>,
        self_id: UserId,
    ) -> Result<Self, SyncError> {
        let db = match &config.db_path {
            Some(path) => Database::open_at(path),
            None => Database::open_in_memory(),
        }
        .map_err(store_error)?;
        debug!(path = ?db.path(), "session metadata opened");

        let last_visited = db.last_visited_channel().unwrap_or_else(|e| {
            warn!(error = %e, "could not read last visited channel");
            None
        });
        let watermarks = db.all_watermarks().unwrap_or_else(|e| {
            warn!(error = %e, "could not read read watermarks");
            HashMap::new()
        });
        let db = Arc::new(Mutex::new(db));

        let rows = backend
            .channels_with_unread_counts()
            .await
            .map_err(SyncError::from_backend)?;

        let notices = NoticeBus::new(NOTICE_BUFFER);
        let unread = Arc::new(UnreadService::new(
            self_id.clone(),
            Arc::clone(&backend),
            notices.clone(),
            config.retry,
            config.mark_read_attempts,
            Arc::clone(&db),
        ));
        unread.initialize(&rows, &watermarks);

        let ctx = TaskContext {
            backend,
            unread,
            notices,
            page_size: config.page_size,
            highlight_duration: config.highlight_duration,
            command_buffer: config.command_buffer,
        };

        let mut handles = HashMap::with_capacity(rows.len());
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let (handle, task) = ChannelHandle::spawn(row.channel_id.clone(), ctx.clone()).await;
            handles.insert(row.channel_id.clone(), handle);
            tasks.push(task);
        }

        let last_visited = last_visited.filter(|id| handles.contains_key(id));

        info!(
            user = %self_id,
            channels = rows.len(),
            last_visited = ?last_visited,
            "sync session started"
        );

        Ok(Self {
            self_id,
            ctx,
            db,
            handles: Mutex::new(handles),
            tasks: Mutex::new(tasks),
            recent: Mutex::new(LruCache::new(config.window_cache_capacity.max(1))),
            focused: Mutex::new(None),
            last_visited,
        })
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    /// Channel the user had open when the previous session ended, if it is
    /// still a member channel.
    pub fn last_visited_channel(&self) -> Option<&ChannelId> {
        self.last_visited.as_ref()
    }

    pub fn focused_channel(&self) -> Option<ChannelId> {
        lock(&self.focused).clone()
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = lock(&self.handles).keys().cloned().collect();
        ids.sort();
        ids
    }

    fn handle(&self, channel: &ChannelId) -> Result<ChannelHandle, SyncError> {
        lock(&self.handles)
            .get(channel)
            .cloned()
            .ok_or_else(|| SyncError::ChannelUnknown(channel.clone()))
    }

    // ------------------------------------------------------------------
    // Windows
    // ------------------------------------------------------------------

    pub fn window_view(&self, channel: &ChannelId) -> Result<WindowView, SyncError> {
        Ok(self.handle(channel)?.view())
    }

    pub fn subscribe_window(
        &self,
        channel: &ChannelId,
    ) -> Result<watch::Receiver<WindowView>, SyncError> {
        Ok(self.handle(channel)?.subscribe())
    }

    pub async fn request_older(&self, channel: &ChannelId) -> Result<PageOutcome, SyncError> {
        self.handle(channel)?.paginate(Direction::Older).await
    }

    pub async fn request_newer(&self, channel: &ChannelId) -> Result<PageOutcome, SyncError> {
        self.handle(channel)?.paginate(Direction::Newer).await
    }

    pub async fn jump_to(
        &self,
        channel: &ChannelId,
        message: &MessageId,
    ) -> Result<JumpOutcome, SyncError> {
        self.handle(channel)?.jump(message.clone()).await
    }

    /// Show the user's own message before the server echoes it.
    pub async fn record_sent(&self, message: Message) -> Result<(), SyncError> {
        self.handle(&message.channel_id)?.record_sent(message).await
    }

    // ------------------------------------------------------------------
    // Focus and unread
    // ------------------------------------------------------------------

    pub async fn on_channel_focused(&self, channel: &ChannelId) -> Result<(), SyncError> {
        let handle = self.handle(channel)?;

        let previous = lock(&self.focused).replace(channel.clone());
        if let Some(previous) = previous.filter(|p| p != channel) {
            self.ctx.unread.blur(&previous);
            if let Ok(prev) = self.handle(&previous) {
                let _ = prev.set_focus(false).await;
            }
        }

        if let Some(evicted) = self.touch_recent(channel) {
            debug!(channel = %evicted, "window cache full, evicting least recently viewed");
            if let Ok(stale) = self.handle(&evicted) {
                let _ = stale.evict().await;
            }
        }

        if let Err(e) = lock(&self.db).set_last_visited_channel(channel) {
            warn!(channel = %channel, error = %e, "failed to persist last visited channel");
        }

        // Detached: the acknowledgement outlives this call.
        let _ = self.ctx.unread.focus(channel);

        handle.set_focus(true).await
    }

    pub async fn on_channel_blurred(&self, channel: &ChannelId) -> Result<(), SyncError> {
        let handle = self.handle(channel)?;
        {
            let mut focused = lock(&self.focused);
            if focused.as_ref() == Some(channel) {
                *focused = None;
            }
        }
        self.ctx.unread.blur(channel);
        handle.set_focus(false).await
    }

    pub async fn mark_all_as_read(&self, channels: &[ChannelId]) -> Result<(), SyncError> {
        self.ctx.unread.mark_all_as_read(channels).await
    }

    pub fn unread_snapshot(&self) -> UnreadSnapshot {
        self.ctx.unread.snapshot()
    }

    /// Re-fetch the authoritative channel list. Counts are overwritten,
    /// channels joined since start get a task, departed ones are stopped.
    pub async fn refresh_channel_list(&self) -> Result<Reconciliation, SyncError> {
        let rows = self
            .ctx
            .backend
            .channels_with_unread_counts()
            .await
            .map_err(SyncError::from_backend)?;
        let result = self.ctx.unread.reconcile(&rows);

        for row in &result.added {
            let (handle, task) =
                ChannelHandle::spawn(row.channel_id.clone(), self.ctx.clone()).await;
            lock(&self.handles).insert(row.channel_id.clone(), handle);
            lock(&self.tasks).push(task);
        }

        for channel in &result.removed {
            let removed = lock(&self.handles).remove(channel);
            lock(&self.recent).remove(channel);
            {
                let mut focused = lock(&self.focused);
                if focused.as_ref() == Some(channel) {
                    *focused = None;
                }
            }
            if let Some(handle) = removed {
                handle.shutdown().await;
            }
        }

        info!(
            added = result.added.len(),
            removed = result.removed.len(),
            corrected = result.corrected,
            "channel list refreshed"
        );
        Ok(result)
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.ctx.notices.subscribe()
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Stop every channel task and wait for them. Detached mark-as-read
    /// calls are left to finish on their own.
    pub async fn shutdown(&self) {
        let handles: Vec<ChannelHandle> = lock(&self.handles).drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.shutdown().await;
        }
        drop(handles);

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "channel task ended abnormally");
            }
        }
        info!(user = %self.self_id, "sync session stopped");
    }

    /// Shut down and forget everything persisted for this user.
    pub async fn logout(&self) -> Result<(), SyncError> {
        self.shutdown().await;
        lock(&self.db).clear_session().map_err(store_error)
    }

    fn touch_recent(&self, channel: &ChannelId) -> Option<ChannelId> {
        let mut recent = lock(&self.recent);
        if recent.get(channel).is_some() {
            return None;
        }
        let evicted = if recent.len() >= recent.capacity() {
            recent.remove_lru().map(|(id, _)| id)
        } else {
            None
        };
        recent.insert(channel.clone(), ());
        evicted
    }
}
