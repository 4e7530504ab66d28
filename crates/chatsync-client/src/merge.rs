//! Live merge engine: folds a channel's change events into its window in
//! receipt order.
//!
//! The window stays contiguous. Events aimed at the unloaded gap ahead of the
//! window are queued on it and replayed once forward pagination catches up;
//! events older than the window are dropped because a later backfill brings
//! the authoritative copy anyway.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use chatsync_shared::constants::SEEN_CREATES_MEMORY;
use chatsync_shared::{ChangeEvent, ChannelId, Message, MessageId, UserId};
use chatsync_store::{ChannelWindow, InsertOutcome, Placement};

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The window changed.
    Applied,
    /// The window already reflected the event.
    Duplicate,
    /// Held until pagination reaches the target.
    Queued,
    /// Target lies outside the window and nothing will bring it in.
    OutOfWindow,
}

/// Increment signal for the unread service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadSignal {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub author: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub outcome: MergeOutcome,
    pub unread: Option<UnreadSignal>,
}

/// Per-channel merge state. Remembers recently seen creates so a redelivered
/// event never counts as unread twice, even when it was not materialized.
pub struct LiveMergeEngine {
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl Default for LiveMergeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveMergeEngine {
    pub fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record a create. Returns `false` if it was already known.
    fn remember(&mut self, id: &MessageId) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= SEEN_CREATES_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.clone());
        self.order.push_back(id.clone());
        true
    }

    pub fn apply(&mut self, window: &mut ChannelWindow, event: ChangeEvent) -> MergeReport {
        let unread = match &event {
            ChangeEvent::MessageCreated(message) => self.first_sighting(window, message),
            _ => None,
        };
        if window.is_holding() {
            trace!(
                channel = %window.channel_id(),
                message = %event.message_id(),
                kind = event.kind(),
                "window replacement in flight, holding event"
            );
            window.queue_pending(event);
            return MergeReport {
                outcome: MergeOutcome::Queued,
                unread,
            };
        }
        let outcome = match event {
            ChangeEvent::MessageCreated(message) => self.upsert(window, message, true),
            ChangeEvent::MessageEdited(message) => self.upsert(window, message, false),
            event @ ChangeEvent::MessageDeleted { .. } => self.tombstone(window, event),
            event @ (ChangeEvent::ReactionChanged { .. } | ChangeEvent::PinChanged { .. }) => {
                self.annotate(window, event)
            }
        };
        MergeReport { outcome, unread }
    }

    fn first_sighting(&mut self, window: &ChannelWindow, message: &Message) -> Option<UnreadSignal> {
        let first = self.remember(&message.id) && !window.contains(&message.id);
        first.then(|| UnreadSignal {
            channel_id: message.channel_id.clone(),
            message_id: message.id.clone(),
            author: message.author.clone(),
            created_at: message.created_at,
        })
    }

    /// Insert the user's own message before the server echoes it back. The
    /// echo then upserts in place.
    pub fn apply_local(&mut self, window: &mut ChannelWindow, message: Message) -> MergeOutcome {
        self.remember(&message.id);
        if window.is_holding() {
            window.queue_pending(ChangeEvent::MessageCreated(message));
            return MergeOutcome::Queued;
        }
        self.upsert(window, message, true)
    }

    /// Re-apply every queued event, typically after the window grew forward.
    /// Events still ahead of the window are queued again.
    pub fn replay_pending(&mut self, window: &mut ChannelWindow) -> usize {
        let pending = window.take_pending();
        if pending.is_empty() {
            return 0;
        }
        let total = pending.len();
        let mut applied = 0;
        for event in pending {
            if self.apply(window, event).outcome == MergeOutcome::Applied {
                applied += 1;
            }
        }
        debug!(
            channel = %window.channel_id(),
            total,
            applied,
            requeued = window.pending_len(),
            "replayed pending events"
        );
        applied
    }

    fn upsert(&mut self, window: &mut ChannelWindow, message: Message, created: bool) -> MergeOutcome {
        let placement = window.placement(message.created_at, &message.id);
        match placement {
            Placement::Unloaded | Placement::BeforeWindow => {
                debug!(
                    channel = %message.channel_id,
                    message = %message.id,
                    ?placement,
                    created,
                    "event outside window, dropped"
                );
                MergeOutcome::OutOfWindow
            }
            Placement::AfterWindow if window.has_newer() => {
                trace!(channel = %message.channel_id, message = %message.id, "queued ahead of window");
                let event = if created {
                    ChangeEvent::MessageCreated(message)
                } else {
                    ChangeEvent::MessageEdited(message)
                };
                window.queue_pending(event);
                MergeOutcome::Queued
            }
            Placement::Inside | Placement::AfterWindow => match window.insert(message) {
                Ok(InsertOutcome::Inserted | InsertOutcome::Replaced) => MergeOutcome::Applied,
                Ok(InsertOutcome::Unchanged) => MergeOutcome::Duplicate,
                Err(e) => {
                    debug!(channel = %window.channel_id(), error = %e, "event rejected by window");
                    MergeOutcome::OutOfWindow
                }
            },
        }
    }

    fn tombstone(&mut self, window: &mut ChannelWindow, event: ChangeEvent) -> MergeOutcome {
        let target = event.message_id().clone();
        if window.contains(&target) {
            return if window.apply_tombstone(&target, Utc::now()) {
                MergeOutcome::Applied
            } else {
                MergeOutcome::Duplicate
            };
        }
        let ahead = event
            .target_created_at()
            .map(|at| window.placement(at, &target) == Placement::AfterWindow)
            .unwrap_or(false);
        if ahead && window.has_newer() {
            window.queue_pending(event);
            return MergeOutcome::Queued;
        }
        debug!(channel = %window.channel_id(), message = %target, "delete outside window, dropped");
        MergeOutcome::OutOfWindow
    }

    fn annotate(&mut self, window: &mut ChannelWindow, event: ChangeEvent) -> MergeOutcome {
        let changed = match &event {
            ChangeEvent::ReactionChanged {
                message_id,
                reaction_key,
                user_id,
                added,
                ..
            } if window.contains(message_id) => {
                Some(window.apply_reaction_delta(message_id, reaction_key, user_id, *added))
            }
            ChangeEvent::PinChanged {
                message_id, pinned, ..
            } if window.contains(message_id) => Some(window.set_pinned(message_id, *pinned)),
            _ => None,
        };
        match changed {
            Some(true) => MergeOutcome::Applied,
            Some(false) => MergeOutcome::Duplicate,
            None if window.is_loaded() && window.has_newer() => {
                window.queue_pending(event);
                MergeOutcome::Queued
            }
            None => {
                debug!(
                    channel = %window.channel_id(),
                    message = %event.message_id(),
                    kind = event.kind(),
                    "annotation target not in window"
                );
                MergeOutcome::OutOfWindow
            }
        }
    }
}
