//! One task per channel: the single writer of that channel's window.
//!
//! Page results, anchor results and live events all arrive on the task and
//! are applied synchronously between two suspension points, so no reader
//! ever observes a half-updated window. Readers get [`WindowView`]
//! snapshots through a `watch` channel.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chatsync_shared::{ChangeEvent, ChannelId, Direction, Message, MessageId, SyncError};
use chatsync_store::{ChannelWindow, WindowBounds, WindowItem};

use crate::backend::{EventStream, SyncBackend};
use crate::events::{NoticeBus, SyncNotice};
use crate::merge::{LiveMergeEngine, MergeOutcome};
use crate::pagination::{fetch_page, FetchPlan, PageOutcome, PageWaiter, PaginationController};
use crate::resolver::{fetch_anchor, AnchorPage, JumpOutcome, JumpResolver};
use crate::unread::UnreadService;

type JumpReply = oneshot::Sender<Result<JumpOutcome, SyncError>>;

/// Snapshot of a channel window as presented to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowView {
    pub channel_id: ChannelId,
    pub items: Vec<WindowItem>,
    pub bounds: WindowBounds,
    pub highlighted: Option<MessageId>,
    /// Live events waiting for forward pagination to reach them.
    pub pending_events: usize,
}

impl WindowView {
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.items.iter().filter_map(WindowItem::as_message)
    }

    pub fn message_ids(&self) -> Vec<&str> {
        self.messages().map(|m| m.id.as_str()).collect()
    }
}

pub(crate) enum ChannelCommand {
    Paginate {
        direction: Direction,
        reply: Option<PageWaiter>,
    },
    Jump {
        target: MessageId,
        reply: JumpReply,
    },
    SetFocus(bool),
    Evict,
    LocalSend(Message),
    PageLoaded {
        plan: FetchPlan,
        result: Result<Vec<Message>, SyncError>,
    },
    AnchorLoaded {
        generation: u64,
        target: MessageId,
        result: Result<AnchorPage, SyncError>,
        reply: JumpReply,
    },
    ClearHighlight {
        generation: u64,
    },
    Shutdown,
}

/// Collaborators every channel task shares.
#[derive(Clone)]
pub struct TaskContext {
    pub backend: Arc<dyn SyncBackend>,
    pub unread: Arc<UnreadService>,
    pub notices: NoticeBus,
    pub page_size: usize,
    pub highlight_duration: Duration,
    pub command_buffer: usize,
}

/// Cloneable handle to a running channel task.
#[derive(Clone)]
pub struct ChannelHandle {
    channel_id: ChannelId,
    commands: mpsc::Sender<ChannelCommand>,
    view: watch::Receiver<WindowView>,
}

impl ChannelHandle {
    /// Subscribe to the channel's events and start its task. The
    /// subscription happens before this returns, so no event published
    /// afterwards is missed.
    pub async fn spawn(channel_id: ChannelId, ctx: TaskContext) -> (Self, JoinHandle<()>) {
        let events = match ctx.backend.event_stream(&channel_id).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(channel = %channel_id, error = %e, "event stream unavailable, running without live updates");
                None
            }
        };

        let window = ChannelWindow::new(channel_id.clone());
        let (view_tx, view_rx) = watch::channel(snapshot(&window, None));
        let (tx, rx) = mpsc::channel(ctx.command_buffer.max(1));

        let task = ChannelTask {
            pagination: PaginationController::new(ctx.page_size),
            merge: LiveMergeEngine::new(),
            resolver: JumpResolver::new(),
            anchor_in_flight: None,
            focused: false,
            me: tx.downgrade(),
            commands: rx,
            events,
            view_tx,
            window,
            ctx,
        };
        let join = tokio::spawn(task.run());

        let handle = Self {
            channel_id,
            commands: tx,
            view: view_rx,
        };
        (handle, join)
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn view(&self) -> WindowView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WindowView> {
        self.view.clone()
    }

    async fn send(&self, command: ChannelCommand) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::SessionClosed)
    }

    pub async fn paginate(&self, direction: Direction) -> Result<PageOutcome, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(ChannelCommand::Paginate {
            direction,
            reply: Some(tx),
        })
        .await?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    pub async fn jump(&self, target: MessageId) -> Result<JumpOutcome, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(ChannelCommand::Jump { target, reply: tx }).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    pub async fn set_focus(&self, focused: bool) -> Result<(), SyncError> {
        self.send(ChannelCommand::SetFocus(focused)).await
    }

    pub async fn evict(&self) -> Result<(), SyncError> {
        self.send(ChannelCommand::Evict).await
    }

    pub async fn record_sent(&self, message: Message) -> Result<(), SyncError> {
        self.send(ChannelCommand::LocalSend(message)).await
    }

    pub async fn shutdown(&self) {
        let _ = self.send(ChannelCommand::Shutdown).await;
    }
}

fn snapshot(window: &ChannelWindow, highlighted: Option<&MessageId>) -> WindowView {
    WindowView {
        channel_id: window.channel_id().clone(),
        items: window.view(),
        bounds: window.bounds(),
        highlighted: highlighted.cloned(),
        pending_events: window.pending_len(),
    }
}

enum Step {
    Command(ChannelCommand),
    Event(ChangeEvent),
    StreamEnded,
    Closed,
}

struct ChannelTask {
    window: ChannelWindow,
    pagination: PaginationController,
    merge: LiveMergeEngine,
    resolver: JumpResolver,
    /// Generation of the jump whose anchor page is being fetched.
    anchor_in_flight: Option<u64>,
    focused: bool,
    ctx: TaskContext,
    commands: mpsc::Receiver<ChannelCommand>,
    /// Weak so that the task ends once every handle is dropped.
    me: mpsc::WeakSender<ChannelCommand>,
    events: Option<EventStream>,
    view_tx: watch::Sender<WindowView>,
}

async fn next_event(events: &mut Option<EventStream>) -> Option<ChangeEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl ChannelTask {
    async fn run(mut self) {
        debug!(channel = %self.window.channel_id(), "channel task started");

        loop {
            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Closed,
                },
                event = next_event(&mut self.events) => match event {
                    Some(event) => Step::Event(event),
                    None => Step::StreamEnded,
                },
            };

            match step {
                Step::Command(ChannelCommand::Shutdown) | Step::Closed => break,
                Step::Command(command) => self.on_command(command),
                Step::Event(event) => self.on_event(event),
                Step::StreamEnded => {
                    warn!(channel = %self.window.channel_id(), "event stream ended");
                    self.events = None;
                }
            }
        }

        // Joined callers learn the window is gone rather than hanging.
        self.pagination.reset(&self.window);
        info!(channel = %self.window.channel_id(), "channel task stopped");
    }

    fn on_command(&mut self, command: ChannelCommand) {
        match command {
            ChannelCommand::Paginate { direction, reply } => {
                if let Some(plan) = self.pagination.admit(&self.window, direction, reply) {
                    self.start_fetch(plan);
                }
            }
            ChannelCommand::Jump { target, reply } => self.on_jump(target, reply),
            ChannelCommand::SetFocus(focused) => self.on_focus(focused),
            ChannelCommand::Evict => self.on_evict(),
            ChannelCommand::LocalSend(message) => {
                if message.channel_id != *self.window.channel_id() {
                    warn!(channel = %self.window.channel_id(), message = %message.id, "local send for another channel ignored");
                    return;
                }
                let outcome = self.merge.apply_local(&mut self.window, message);
                if matches!(outcome, MergeOutcome::Applied | MergeOutcome::Queued) {
                    self.publish();
                }
            }
            ChannelCommand::PageLoaded { plan, result } => self.on_page(plan, result),
            ChannelCommand::AnchorLoaded {
                generation,
                target,
                result,
                reply,
            } => self.on_anchor(generation, target, result, reply),
            ChannelCommand::ClearHighlight { generation } => {
                if self.resolver.clear(generation) {
                    self.publish();
                }
            }
            ChannelCommand::Shutdown => {}
        }
    }

    fn on_event(&mut self, event: ChangeEvent) {
        if event.channel_id() != self.window.channel_id() {
            warn!(
                channel = %self.window.channel_id(),
                other = %event.channel_id(),
                "event for another channel ignored"
            );
            return;
        }
        let report = self.merge.apply(&mut self.window, event);
        if let Some(signal) = &report.unread {
            self.ctx.unread.record_created(signal);
        }
        if matches!(report.outcome, MergeOutcome::Applied | MergeOutcome::Queued) {
            self.publish();
        }
    }

    fn on_focus(&mut self, focused: bool) {
        self.focused = focused;
        if !focused {
            if self.resolver.highlighted().is_some() {
                self.resolver.reset();
                self.publish();
            }
            return;
        }
        if !self.window.is_loaded() {
            if let Some(plan) = self.pagination.admit(&self.window, Direction::Older, None) {
                self.start_fetch(plan);
            }
        }
    }

    fn on_evict(&mut self) {
        let was_loaded = self.window.is_loaded();
        self.anchor_in_flight = None;
        self.window.evict();
        // Late pages and jumps still in flight would re-materialize the window.
        self.pagination.reset(&self.window);
        self.resolver.begin();
        self.resolver.reset();
        if was_loaded {
            debug!(channel = %self.window.channel_id(), "window evicted");
            self.publish();
        }
    }

    fn on_page(&mut self, plan: FetchPlan, result: Result<Vec<Message>, SyncError>) {
        let Some(done) = self.pagination.complete(&mut self.window, &plan, result) else {
            return;
        };
        let replayed = self.settle_hold();
        match &done.result {
            Ok(outcome) => {
                debug!(
                    channel = %self.window.channel_id(),
                    direction = %done.direction,
                    added = outcome.added,
                    has_older = outcome.has_older,
                    has_newer = outcome.has_newer,
                    "page applied"
                );
                if !replayed {
                    self.merge.replay_pending(&mut self.window);
                }
            }
            Err(e) => self.ctx.notices.emit(SyncNotice::FetchFailed {
                channel: self.window.channel_id().clone(),
                direction: done.direction,
                error: e.to_string(),
            }),
        }
        self.publish();
        done.notify();
    }

    fn on_jump(&mut self, target: MessageId, reply: JumpReply) {
        let generation = self.resolver.begin();
        if self.window.contains(&target) {
            // Any anchor still in flight is superseded now.
            self.anchor_in_flight = None;
            if self.settle_hold() {
                self.publish();
            }
            let outcome = self.settle_jump(generation, target);
            let _ = reply.send(outcome);
            return;
        }

        let Some(me) = self.me.upgrade() else {
            let _ = reply.send(Err(SyncError::SessionClosed));
            return;
        };
        debug!(channel = %self.window.channel_id(), message = %target, generation, "re-anchoring for jump");
        self.anchor_in_flight = Some(generation);
        self.settle_hold();
        let backend = Arc::clone(&self.ctx.backend);
        let channel = self.window.channel_id().clone();
        let page_size = self.pagination.page_size();
        tokio::spawn(async move {
            let result = fetch_anchor(backend.as_ref(), &channel, &target, page_size).await;
            let _ = me
                .send(ChannelCommand::AnchorLoaded {
                    generation,
                    target,
                    result,
                    reply,
                })
                .await;
        });
    }

    fn on_anchor(
        &mut self,
        generation: u64,
        target: MessageId,
        result: Result<AnchorPage, SyncError>,
        reply: JumpReply,
    ) {
        if !self.resolver.is_current(generation) {
            debug!(channel = %self.window.channel_id(), generation, "jump superseded");
            let _ = reply.send(Ok(JumpOutcome::Superseded));
            return;
        }
        self.anchor_in_flight = None;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                self.settle_hold();
                self.publish();
                if let SyncError::NotFound { channel, message } = &e {
                    self.ctx.notices.emit(SyncNotice::JumpNotFound {
                        channel: channel.clone(),
                        message: message.clone(),
                    });
                } else {
                    warn!(channel = %self.window.channel_id(), message = %target, error = %e, "jump failed");
                }
                let _ = reply.send(Err(e));
                return;
            }
        };

        if let Err(e) = self
            .window
            .reanchor(page.messages, page.has_older, page.has_newer)
        {
            self.settle_hold();
            self.publish();
            let _ = reply.send(Err(SyncError::Store(e.to_string())));
            return;
        }
        self.pagination.reset(&self.window);
        self.settle_hold();

        let outcome = self.settle_jump(generation, target);
        self.publish();
        let _ = reply.send(outcome);
    }

    /// Resolve a jump whose target is in the window. The highlight is only
    /// set while the channel is focused.
    fn settle_jump(&mut self, generation: u64, target: MessageId) -> Result<JumpOutcome, SyncError> {
        let Some(position) = self.window.position_of(&target) else {
            return Err(SyncError::NotFound {
                channel: self.window.channel_id().clone(),
                message: target,
            });
        };
        if !self.focused {
            return Ok(JumpOutcome::Loaded { position });
        }
        self.resolver.highlight(generation, target.clone());
        self.schedule_clear(generation);
        self.publish();
        Ok(JumpOutcome::Highlighted {
            message_id: target,
            position,
        })
    }

    fn schedule_clear(&self, generation: u64) {
        let me = self.me.clone();
        let delay = self.ctx.highlight_duration;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = me.upgrade() {
                let _ = tx.send(ChannelCommand::ClearHighlight { generation }).await;
            }
        });
    }

    fn start_fetch(&mut self, plan: FetchPlan) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        if plan.from_latest() {
            self.settle_hold();
        }
        let backend = Arc::clone(&self.ctx.backend);
        let channel = self.window.channel_id().clone();
        tokio::spawn(async move {
            let result = fetch_page(backend.as_ref(), &channel, &plan).await;
            let _ = me.send(ChannelCommand::PageLoaded { plan, result }).await;
        });
    }

    /// Events are held while a page that replaces the entries is in flight,
    /// that is the first page of an unloaded window or a jump anchor. Once
    /// neither is left they are replayed against the new entries. Returns
    /// `true` when that replay ran.
    fn settle_hold(&mut self) -> bool {
        let hold = self.pagination.loading_latest() || self.anchor_in_flight.is_some();
        if self.window.is_holding() && !hold {
            self.window.hold_events(false);
            self.merge.replay_pending(&mut self.window);
            return true;
        }
        self.window.hold_events(hold);
        false
    }

    fn publish(&self) {
        self.view_tx
            .send_replace(snapshot(&self.window, self.resolver.highlighted()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chatsync_shared::{ChannelKind, ChannelUnread, MessagePayload, UserId};
    use chatsync_store::Database;
    use chrono::Utc;

    use super::*;
    use crate::memory::MemoryBackend;
    use crate::retry::RetryPolicy;
    use crate::test_support::{backend_with, eventually, history, live, msg, wait_for_view};

    fn context(backend: Arc<MemoryBackend>) -> TaskContext {
        let notices = NoticeBus::new(16);
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let backend: Arc<dyn SyncBackend> = backend;
        let unread = Arc::new(UnreadService::new(
            UserId::from("alice"),
            Arc::clone(&backend),
            notices.clone(),
            RetryPolicy::default(),
            1,
            db,
        ));
        unread.initialize(
            &[ChannelUnread {
                channel_id: ChannelId::from("general"),
                kind: ChannelKind::Group,
                unread_count: 0,
            }],
            &Default::default(),
        );
        TaskContext {
            backend,
            unread,
            notices,
            page_size: 20,
            highlight_duration: Duration::from_millis(2_000),
            command_buffer: 16,
        }
    }

    async fn spawn(backend: &Arc<MemoryBackend>) -> ChannelHandle {
        let (handle, _task) =
            ChannelHandle::spawn(ChannelId::from("general"), context(Arc::clone(backend))).await;
        handle
    }

    #[tokio::test]
    async fn newer_jump_supersedes_older_one() {
        let backend = Arc::new(backend_with("general", history("general", 200)));
        let handle = spawn(&backend).await;
        let mut rx = handle.subscribe();
        handle.set_focus(true).await.unwrap();
        wait_for_view(&mut rx, |v| v.bounds.loaded).await;
        backend.set_fetch_delay(Some(Duration::from_millis(20)));

        let (first, second) = tokio::join!(
            handle.jump(MessageId::from("m010")),
            handle.jump(MessageId::from("m100"))
        );

        assert_eq!(first.unwrap(), JumpOutcome::Superseded);
        assert!(matches!(second.unwrap(), JumpOutcome::Highlighted { .. }));
        let view = handle.view();
        assert_eq!(view.highlighted, Some(MessageId::from("m100")));
        assert!(!view.message_ids().contains(&"m010"));
    }

    #[tokio::test]
    async fn eviction_discards_in_flight_page() {
        let backend = Arc::new(backend_with("general", history("general", 50)));
        backend.set_fetch_delay(Some(Duration::from_millis(30)));
        let handle = spawn(&backend).await;

        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.paginate(Direction::Older).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.evict().await.unwrap();

        let outcome = pending.await.unwrap().unwrap();
        assert_eq!(outcome.added, 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.view().bounds.loaded);
        assert_eq!(backend.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn events_are_applied_in_receipt_order() {
        let backend = Arc::new(backend_with("general", vec![msg("general", "a", "bob", 0)]));
        let handle = spawn(&backend).await;
        let mut rx = handle.subscribe();
        handle.set_focus(true).await.unwrap();
        wait_for_view(&mut rx, |v| v.bounds.loaded).await;

        let first = live("general", "x", "bob");
        backend.publish(ChangeEvent::MessageCreated(first.clone()));
        backend.publish(ChangeEvent::MessageDeleted {
            channel_id: ChannelId::from("general"),
            message_id: first.id.clone(),
            created_at: Some(first.created_at),
        });
        backend.redeliver(ChangeEvent::MessageCreated(first));

        let view = wait_for_view(&mut rx, |v| v.messages().any(|m| m.deleted)).await;
        assert_eq!(view.message_ids(), vec!["a", "x"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let view = handle.view();
        assert!(view.messages().any(|m| m.id.as_str() == "x" && m.deleted));
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_task() {
        let backend = Arc::new(backend_with("general", history("general", 5)));
        let (handle, task) =
            ChannelHandle::spawn(ChannelId::from("general"), context(Arc::clone(&backend))).await;

        drop(handle);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    fn assert_contiguous(view: &WindowView, backend: &MemoryBackend) {
        let full: Vec<String> = backend
            .history(&view.channel_id)
            .into_iter()
            .map(|m| m.id.to_string())
            .collect();
        let ids = view.message_ids();
        let start = full.iter().position(|id| id == ids[0]).unwrap();
        assert_eq!(ids, full[start..start + ids.len()].to_vec());
    }

    #[tokio::test]
    async fn live_message_during_first_load_lands_after_the_page() {
        let backend = Arc::new(backend_with("general", history("general", 5)));
        backend.hold_replies();
        let handle = spawn(&backend).await;
        let mut rx = handle.subscribe();

        handle.set_focus(true).await.unwrap();
        eventually(|| backend.pages_read() == 1).await;
        backend.publish(ChangeEvent::MessageCreated(live("general", "fresh", "bob")));
        wait_for_view(&mut rx, |v| v.pending_events == 1).await;
        backend.release_replies();

        let view = wait_for_view(&mut rx, |v| v.bounds.loaded).await;
        assert_eq!(
            view.message_ids(),
            vec!["m000", "m001", "m002", "m003", "m004", "fresh"]
        );
        assert!(!view.bounds.has_newer);
        assert_eq!(view.pending_events, 0);
        assert_contiguous(&view, &backend);
    }

    #[tokio::test]
    async fn live_message_during_anchor_fetch_survives_reanchor() {
        let backend = Arc::new(backend_with("general", history("general", 10)));
        let handle = spawn(&backend).await;
        let mut rx = handle.subscribe();
        backend.hold_replies();

        let jump = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.jump(MessageId::from("m004")).await })
        };
        eventually(|| backend.pages_read() == 2).await;
        backend.publish(ChangeEvent::MessageCreated(live("general", "fresh", "bob")));
        wait_for_view(&mut rx, |v| v.pending_events == 1).await;
        backend.release_replies();

        let outcome = jump.await.unwrap().unwrap();
        assert!(matches!(outcome, JumpOutcome::Loaded { .. }));
        let view = handle.view();
        assert_eq!(view.messages().count(), 11);
        assert_eq!(view.message_ids().last().copied(), Some("fresh"));
        assert!(!view.bounds.has_newer);
        assert_eq!(view.pending_events, 0);
        assert_contiguous(&view, &backend);
    }

    #[tokio::test]
    async fn events_during_anchor_fetch_apply_to_the_new_slice() {
        let backend = Arc::new(backend_with("general", history("general", 100)));
        let handle = spawn(&backend).await;
        let mut rx = handle.subscribe();
        handle.set_focus(true).await.unwrap();
        wait_for_view(&mut rx, |v| v.bounds.loaded).await;
        let before = backend.pages_read();
        backend.hold_replies();

        let jump = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.jump(MessageId::from("m010")).await })
        };
        eventually(|| backend.pages_read() == before + 2).await;
        let mut edited = msg("general", "m012", "bob", 12);
        edited.payload = MessagePayload::text("changed");
        edited.edited = true;
        edited.modified_at = Utc::now();
        backend.publish(ChangeEvent::MessageEdited(edited));
        backend.publish(ChangeEvent::MessageCreated(live("general", "fresh", "bob")));
        wait_for_view(&mut rx, |v| v.pending_events == 2).await;
        backend.release_replies();

        let outcome = jump.await.unwrap().unwrap();
        assert!(matches!(outcome, JumpOutcome::Highlighted { .. }));
        let view = handle.view();
        let m12 = view.messages().find(|m| m.id.as_str() == "m012").unwrap();
        assert_eq!(m12.payload, MessagePayload::text("changed"));
        assert!(view.bounds.has_newer);
        assert_eq!(view.pending_events, 1);
        assert_contiguous(&view, &backend);

        let mut outcome = handle.paginate(Direction::Newer).await.unwrap();
        while outcome.has_newer {
            assert_contiguous(&handle.view(), &backend);
            outcome = handle.paginate(Direction::Newer).await.unwrap();
        }
        let view = handle.view();
        assert_eq!(view.message_ids().last().copied(), Some("fresh"));
        assert_eq!(view.pending_events, 0);
        assert_contiguous(&view, &backend);
    }
}
