//! The channel message store: one contiguous, ordered window of history.
//!
//! Entries are ordered by `(created_at, id)`. Each insertion only re-lays out
//! the inserted entry and its successor, so continuation flags and date
//! buckets never need a full rescan.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use chatsync_shared::constants::MAX_PENDING_EVENTS;
use chatsync_shared::{ChangeEvent, ChannelId, Cursor, Message, MessageId, ReplySnapshot, UserId};

use crate::error::{Result, StoreError};
use crate::layout::{continues, WindowItem};
use crate::models::{InsertOutcome, Placement, WindowBounds};

#[derive(Debug, Clone)]
struct WindowEntry {
    message: Message,
    continuation: bool,
    starts_day: bool,
}

/// Materialized slice of one channel's history.
#[derive(Debug, Clone)]
pub struct ChannelWindow {
    channel_id: ChannelId,
    entries: Vec<WindowEntry>,
    /// Identity -> creation time, enough to rebuild the sort key.
    index: HashMap<MessageId, DateTime<Utc>>,
    loaded: bool,
    has_older: bool,
    has_newer: bool,
    /// Live events aimed at the unloaded gap ahead of the window.
    pending: VecDeque<ChangeEvent>,
    /// A page that will replace the entries is in flight; every event is
    /// queued until it lands.
    holding: bool,
}

impl ChannelWindow {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            entries: Vec::new(),
            index: HashMap::new(),
            loaded: false,
            has_older: true,
            has_newer: false,
            pending: VecDeque::new(),
            holding: false,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_older(&self) -> bool {
        self.has_older
    }

    pub fn has_newer(&self) -> bool {
        self.has_newer
    }

    pub fn oldest_cursor(&self) -> Option<Cursor> {
        self.entries.first().map(|e| e.message.cursor())
    }

    pub fn newest_cursor(&self) -> Option<Cursor> {
        self.entries.last().map(|e| e.message.cursor())
    }

    pub fn bounds(&self) -> WindowBounds {
        WindowBounds {
            loaded: self.loaded,
            oldest_loaded: self.oldest_cursor(),
            newest_loaded: self.newest_cursor(),
            has_older: self.has_older,
            has_newer: self.has_newer,
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.locate(id).map(|idx| &self.entries[idx].message)
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    // ------------------------------------------------------------------
    // Single-record mutation
    // ------------------------------------------------------------------

    /// Upsert a message at its sort position.
    ///
    /// An existing record with the same identity is replaced in place, unless
    /// the incoming copy is older (`modified_at`) than the one held. The
    /// tombstone flag is sticky: a stale copy cannot resurrect a deleted
    /// message.
    pub fn insert(&mut self, message: Message) -> Result<InsertOutcome> {
        self.check_channel(&message.channel_id)?;

        let Some(idx) = self.locate(&message.id) else {
            self.place(message);
            return Ok(InsertOutcome::Inserted);
        };

        let existing = &self.entries[idx].message;
        if message.modified_at < existing.modified_at {
            trace!(
                channel = %self.channel_id,
                message = %message.id,
                "ignoring stale copy of message"
            );
            return Ok(InsertOutcome::Unchanged);
        }

        let mut message = message;
        message.deleted |= existing.deleted;
        if *existing == message {
            return Ok(InsertOutcome::Unchanged);
        }

        if existing.created_at == message.created_at {
            self.entries[idx].message = message;
            self.relayout(idx);
            self.relayout(idx + 1);
        } else {
            self.remove_at(idx);
            self.place(message);
        }
        Ok(InsertOutcome::Replaced)
    }

    /// Mark a message deleted in place. Returns `false` when the identity is
    /// not in the window or already a tombstone.
    pub fn apply_tombstone(&mut self, id: &MessageId, at: DateTime<Utc>) -> bool {
        match self.locate(id) {
            Some(idx) => self.entries[idx].message.tombstone(at),
            None => {
                debug!(channel = %self.channel_id, message = %id, "tombstone target not in window");
                false
            }
        }
    }

    /// Add or remove one user's reaction. Outside the window this is simply
    /// inapplicable and only logged.
    pub fn apply_reaction_delta(
        &mut self,
        id: &MessageId,
        reaction_key: &str,
        user: &UserId,
        added: bool,
    ) -> bool {
        let Some(idx) = self.locate(id) else {
            debug!(
                channel = %self.channel_id,
                message = %id,
                reaction = reaction_key,
                "reaction target outside window, ignoring"
            );
            return false;
        };
        self.entries[idx]
            .message
            .reactions
            .apply(reaction_key, user, added)
    }

    pub fn set_pinned(&mut self, id: &MessageId, pinned: bool) -> bool {
        let Some(idx) = self.locate(id) else {
            debug!(channel = %self.channel_id, message = %id, "pin target not in window");
            return false;
        };
        let message = &mut self.entries[idx].message;
        if message.pinned == pinned {
            return false;
        }
        message.pinned = pinned;
        true
    }

    // ------------------------------------------------------------------
    // Page-level mutation
    // ------------------------------------------------------------------

    /// Materialize the newest page of history into an unloaded window.
    pub fn load_latest(&mut self, page: Vec<Message>, requested: usize) -> Result<usize> {
        self.check_page(&page)?;
        self.clear_entries();
        self.loaded = true;
        self.has_older = page.len() >= requested;
        self.has_newer = false;
        Ok(self.absorb(page))
    }

    /// Prepend a page of strictly older history. A short page means the
    /// window now starts at the channel's first message.
    pub fn extend_older(&mut self, page: Vec<Message>, requested: usize) -> Result<usize> {
        if !self.loaded {
            return self.load_latest(page, requested);
        }
        self.check_page(&page)?;
        self.has_older = page.len() >= requested;
        Ok(self.absorb(page))
    }

    /// Append a page of strictly newer history. A short page means the window
    /// reached the live edge.
    pub fn extend_newer(&mut self, page: Vec<Message>, requested: usize) -> Result<usize> {
        if !self.loaded {
            return self.load_latest(page, requested);
        }
        self.check_page(&page)?;
        self.has_newer = page.len() >= requested;
        Ok(self.absorb(page))
    }

    /// Discard the current slice and materialize a new one around a jump
    /// target. Queued out-of-window events are kept for replay.
    pub fn reanchor(&mut self, page: Vec<Message>, has_older: bool, has_newer: bool) -> Result<usize> {
        self.check_page(&page)?;
        self.clear_entries();
        self.loaded = true;
        self.has_older = has_older;
        self.has_newer = has_newer;
        Ok(self.absorb(page))
    }

    /// Drop everything materialized; the next open starts from the newest page.
    pub fn evict(&mut self) {
        self.clear_entries();
        self.pending.clear();
        self.holding = false;
        self.loaded = false;
        self.has_older = true;
        self.has_newer = false;
    }

    // ------------------------------------------------------------------
    // Out-of-window queue
    // ------------------------------------------------------------------

    pub fn placement(&self, created_at: DateTime<Utc>, id: &MessageId) -> Placement {
        if !self.loaded {
            return Placement::Unloaded;
        }
        if self.contains(id) {
            return Placement::Inside;
        }
        let (Some(first), Some(last)) = (self.entries.first(), self.entries.last()) else {
            return Placement::AfterWindow;
        };
        let key = (created_at, id);
        if key < first.message.sort_key() {
            Placement::BeforeWindow
        } else if key > last.message.sort_key() {
            Placement::AfterWindow
        } else {
            Placement::Inside
        }
    }

    /// While held, events are queued whatever their placement and replayed
    /// against the page that arrives.
    pub fn hold_events(&mut self, holding: bool) {
        self.holding = holding;
    }

    pub fn is_holding(&self) -> bool {
        self.holding
    }

    /// Hold an event until pagination reaches its target.
    pub fn queue_pending(&mut self, event: ChangeEvent) {
        if self.pending.len() >= MAX_PENDING_EVENTS {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(
                    channel = %self.channel_id,
                    message = %dropped.message_id(),
                    kind = dropped.kind(),
                    "pending event queue full, dropping oldest"
                );
            }
        }
        self.pending.push_back(event);
    }

    pub fn take_pending(&mut self) -> Vec<ChangeEvent> {
        self.pending.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // ------------------------------------------------------------------
    // Read access
    // ------------------------------------------------------------------

    /// Flat ordered sequence of date buckets and messages. Reply snapshots
    /// are refreshed from the window here, at read time.
    pub fn view(&self) -> Vec<WindowItem> {
        let mut items = Vec::with_capacity(self.entries.len() + 4);
        for entry in &self.entries {
            if entry.starts_day {
                items.push(WindowItem::DateBucket {
                    date: entry.message.day(),
                });
            }
            let mut message = entry.message.clone();
            if let Some(reply) = message.reply_to.as_mut() {
                if let Some(snapshot) = self.reply_snapshot(&reply.target) {
                    reply.snapshot = Some(snapshot);
                }
            }
            items.push(WindowItem::Message {
                message,
                continuation: entry.continuation,
            });
        }
        items
    }

    pub fn reply_snapshot(&self, id: &MessageId) -> Option<ReplySnapshot> {
        self.get(id).map(Message::reply_snapshot)
    }

    /// Index of a message inside [`ChannelWindow::view`].
    pub fn position_of(&self, id: &MessageId) -> Option<usize> {
        let idx = self.locate(id)?;
        let buckets = self.entries[..=idx].iter().filter(|e| e.starts_day).count();
        Some(idx + buckets)
    }

    /// `true` when entries are strictly increasing by sort key and the
    /// identity index matches them one to one.
    pub fn is_consistent(&self) -> bool {
        let ordered = self
            .entries
            .windows(2)
            .all(|w| w[0].message.sort_key() < w[1].message.sort_key());
        ordered
            && self.index.len() == self.entries.len()
            && self.entries.iter().all(|e| {
                self.index.get(&e.message.id) == Some(&e.message.created_at)
            })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn locate(&self, id: &MessageId) -> Option<usize> {
        let created_at = *self.index.get(id)?;
        self.entries
            .binary_search_by(|e| e.message.sort_key().cmp(&(created_at, id)))
            .ok()
    }

    fn place(&mut self, message: Message) -> usize {
        let pos = match self
            .entries
            .binary_search_by(|e| e.message.sort_key().cmp(&message.sort_key()))
        {
            Ok(pos) | Err(pos) => pos,
        };
        self.index.insert(message.id.clone(), message.created_at);
        self.entries.insert(
            pos,
            WindowEntry {
                message,
                continuation: false,
                starts_day: false,
            },
        );
        self.relayout(pos);
        self.relayout(pos + 1);
        pos
    }

    fn remove_at(&mut self, idx: usize) {
        let entry = self.entries.remove(idx);
        self.index.remove(&entry.message.id);
        self.relayout(idx);
    }

    fn relayout(&mut self, idx: usize) {
        if idx >= self.entries.len() {
            return;
        }
        let (starts_day, continuation) = match idx.checked_sub(1) {
            None => (true, false),
            Some(prev_idx) => {
                let prev = &self.entries[prev_idx].message;
                let cur = &self.entries[idx].message;
                (prev.day() != cur.day(), continues(prev, cur))
            }
        };
        let entry = &mut self.entries[idx];
        entry.starts_day = starts_day;
        entry.continuation = continuation;
    }

    fn absorb(&mut self, page: Vec<Message>) -> usize {
        let mut added = 0;
        for message in page {
            if let Ok(InsertOutcome::Inserted) = self.insert(message) {
                added += 1;
            }
        }
        added
    }

    fn clear_entries(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    fn check_channel(&self, channel_id: &ChannelId) -> Result<()> {
        if *channel_id != self.channel_id {
            return Err(StoreError::ForeignMessage {
                expected: self.channel_id.clone(),
                found: channel_id.clone(),
            });
        }
        Ok(())
    }

    fn check_page(&self, page: &[Message]) -> Result<()> {
        page.iter().try_for_each(|m| self.check_channel(&m.channel_id))
    }
}
