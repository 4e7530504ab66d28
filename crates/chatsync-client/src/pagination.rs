//! History pagination: bounded page fetches in either direction with a
//! single-flight rule per direction.
//!
//! The controller never touches the network itself. It decides whether a
//! request starts a fetch, joins the one in flight, or can be answered from
//! the window bounds. The owning channel task runs the fetch and hands the
//! page back through [`PaginationController::complete`].

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use chatsync_shared::constants::MAX_PAGE_SIZE;
use chatsync_shared::{ChannelId, Cursor, Direction, Message, SyncError};
use chatsync_store::ChannelWindow;

use crate::backend::SyncBackend;

pub fn clamp_page_size(size: usize) -> usize {
    size.clamp(1, MAX_PAGE_SIZE)
}

/// Answer to a pagination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageOutcome {
    /// Messages new to the window.
    pub added: usize,
    pub has_older: bool,
    pub has_newer: bool,
}

impl PageOutcome {
    fn unchanged(window: &ChannelWindow) -> Self {
        Self {
            added: 0,
            has_older: window.has_older(),
            has_newer: window.has_newer(),
        }
    }
}

pub type PageWaiter = oneshot::Sender<Result<PageOutcome, SyncError>>;

/// A fetch the channel task must run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    /// In-flight slot the result belongs to.
    pub slot: Direction,
    /// `None` requests the newest page of the channel.
    pub cursor: Option<Cursor>,
    pub epoch: u64,
    pub page_size: usize,
}

impl FetchPlan {
    pub fn from_latest(&self) -> bool {
        self.cursor.is_none()
    }
}

struct InFlight {
    epoch: u64,
    /// Loads the newest page into an unloaded window.
    from_latest: bool,
    waiters: Vec<PageWaiter>,
}

/// A finished fetch whose waiters have not been answered yet. The task
/// replays queued live events before calling [`Completion::notify`], so
/// callers observe the window after the replay.
#[must_use]
pub struct Completion {
    pub direction: Direction,
    pub result: Result<PageOutcome, SyncError>,
    waiters: Vec<PageWaiter>,
}

impl Completion {
    pub fn notify(self) {
        for waiter in self.waiters {
            let _ = waiter.send(self.result.clone());
        }
    }
}

/// Per-channel pagination state.
pub struct PaginationController {
    page_size: usize,
    /// Bumped whenever the window is replaced, so results fetched for the
    /// previous window are discarded.
    epoch: u64,
    older: Option<InFlight>,
    newer: Option<InFlight>,
}

impl PaginationController {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: clamp_page_size(page_size),
            epoch: 0,
            older: None,
            newer: None,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn in_flight(&self, direction: Direction) -> bool {
        self.slot(direction).is_some()
    }

    /// `true` while the newest page is being fetched for an unloaded window.
    pub fn loading_latest(&self) -> bool {
        [&self.older, &self.newer]
            .into_iter()
            .flatten()
            .any(|in_flight| in_flight.from_latest)
    }

    fn slot(&self, direction: Direction) -> &Option<InFlight> {
        match direction {
            Direction::Older => &self.older,
            Direction::Newer => &self.newer,
        }
    }

    fn slot_mut(&mut self, direction: Direction) -> &mut Option<InFlight> {
        match direction {
            Direction::Older => &mut self.older,
            Direction::Newer => &mut self.newer,
        }
    }

    /// Admit a request for `direction`.
    ///
    /// Returns the fetch to start, or `None` when the request joined the
    /// in-flight fetch or was answered immediately. An unloaded window is
    /// opened with the newest page whatever the direction asked for.
    pub fn admit(
        &mut self,
        window: &ChannelWindow,
        direction: Direction,
        waiter: Option<PageWaiter>,
    ) -> Option<FetchPlan> {
        let (slot, cursor) = if !window.is_loaded() {
            (Direction::Older, None)
        } else {
            match direction {
                Direction::Older if !window.has_older() => {
                    answer(waiter, PageOutcome::unchanged(window));
                    return None;
                }
                Direction::Newer if !window.has_newer() => {
                    answer(waiter, PageOutcome::unchanged(window));
                    return None;
                }
                Direction::Older => (Direction::Older, window.oldest_cursor()),
                Direction::Newer => (Direction::Newer, window.newest_cursor()),
            }
        };

        let epoch = self.epoch;
        let in_flight = self.slot_mut(slot);
        if let Some(in_flight) = in_flight.as_mut() {
            debug!(channel = %window.channel_id(), %direction, "joining in-flight page request");
            in_flight.waiters.extend(waiter);
            return None;
        }

        *in_flight = Some(InFlight {
            epoch,
            from_latest: cursor.is_none(),
            waiters: waiter.into_iter().collect(),
        });

        Some(FetchPlan {
            slot,
            cursor,
            epoch,
            page_size: self.page_size,
        })
    }

    /// Fold a fetched page into the window. A failed fetch leaves the window
    /// untouched. Returns `None` for results of a superseded window.
    pub fn complete(
        &mut self,
        window: &mut ChannelWindow,
        plan: &FetchPlan,
        result: Result<Vec<Message>, SyncError>,
    ) -> Option<Completion> {
        if plan.epoch != self.epoch {
            debug!(
                channel = %window.channel_id(),
                epoch = plan.epoch,
                current = self.epoch,
                "discarding page for superseded window"
            );
            return None;
        }
        let in_flight = self.slot_mut(plan.slot).take()?;
        if in_flight.epoch != plan.epoch {
            return None;
        }

        let requested = plan.page_size;
        let result = result.and_then(|page| {
            let applied = match (plan.from_latest(), plan.slot) {
                (true, _) => window.load_latest(page, requested),
                (false, Direction::Older) => window.extend_older(page, requested),
                (false, Direction::Newer) => window.extend_newer(page, requested),
            };
            applied
                .map(|added| PageOutcome {
                    added,
                    has_older: window.has_older(),
                    has_newer: window.has_newer(),
                })
                .map_err(|e| SyncError::Store(e.to_string()))
        });

        if let Err(e) = &result {
            warn!(channel = %window.channel_id(), direction = %plan.slot, error = %e, "page fetch failed");
        }

        Some(Completion {
            direction: plan.slot,
            result,
            waiters: in_flight.waiters,
        })
    }

    /// Forget both in-flight fetches because the window was replaced or
    /// evicted. Joined callers are answered with the new bounds.
    pub fn reset(&mut self, window: &ChannelWindow) {
        self.epoch += 1;
        let outcome = PageOutcome::unchanged(window);
        for in_flight in [self.older.take(), self.newer.take()].into_iter().flatten() {
            for waiter in in_flight.waiters {
                let _ = waiter.send(Ok(outcome));
            }
        }
    }
}

fn answer(waiter: Option<PageWaiter>, outcome: PageOutcome) {
    if let Some(waiter) = waiter {
        let _ = waiter.send(Ok(outcome));
    }
}

/// Run one planned fetch against the backend. Pages come back sorted by
/// sort key whatever order the backend used.
pub async fn fetch_page(
    backend: &dyn SyncBackend,
    channel: &ChannelId,
    plan: &FetchPlan,
) -> Result<Vec<Message>, SyncError> {
    let direction = if plan.from_latest() {
        Direction::Older
    } else {
        plan.slot
    };
    let mut page = backend
        .fetch_history(channel, plan.cursor.as_ref(), direction, plan.page_size)
        .await
        .map_err(SyncError::from_backend)?;
    page.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{backend_with, msg};

    fn channel() -> ChannelId {
        ChannelId::from("general")
    }

    fn page(from: i64, to: i64) -> Vec<Message> {
        (from..to)
            .map(|i| msg("general", &format!("m{i:03}"), "bob", i))
            .collect()
    }

    #[test]
    fn clamps_page_size() {
        assert_eq!(clamp_page_size(0), 1);
        assert_eq!(clamp_page_size(20), 20);
        assert_eq!(clamp_page_size(5_000), MAX_PAGE_SIZE);
    }

    #[test]
    fn unloaded_window_opens_from_latest() {
        let window = ChannelWindow::new(channel());
        let mut pager = PaginationController::new(20);

        let plan = pager.admit(&window, Direction::Newer, None).unwrap();
        assert_eq!(plan.slot, Direction::Older);
        assert!(plan.from_latest());
        assert!(pager.loading_latest());

        let mut window = window;
        let done = pager.complete(&mut window, &plan, Ok(page(0, 5))).unwrap();
        done.notify();
        assert!(!pager.loading_latest());
    }

    #[test]
    fn history_start_is_detected_by_short_page() {
        let mut window = ChannelWindow::new(channel());
        let mut pager = PaginationController::new(20);

        let plan = pager.admit(&window, Direction::Older, None).unwrap();
        let done = pager.complete(&mut window, &plan, Ok(page(100, 120))).unwrap();
        let outcome = done.result.clone().unwrap();
        done.notify();
        assert_eq!(outcome.added, 20);
        assert!(outcome.has_older);

        let plan = pager.admit(&window, Direction::Older, None).unwrap();
        assert_eq!(plan.cursor, window.oldest_cursor());
        let done = pager.complete(&mut window, &plan, Ok(page(93, 100))).unwrap();
        let outcome = done.result.clone().unwrap();
        done.notify();
        assert_eq!(outcome.added, 7);
        assert!(!outcome.has_older);
        assert_eq!(window.len(), 27);

        assert!(pager.admit(&window, Direction::Older, None).is_none());
    }

    #[tokio::test]
    async fn second_request_joins_in_flight_fetch() {
        let mut window = ChannelWindow::new(channel());
        let mut pager = PaginationController::new(20);
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();

        let plan = pager.admit(&window, Direction::Older, Some(tx1)).unwrap();
        assert!(pager.admit(&window, Direction::Older, Some(tx2)).is_none());
        assert!(pager.in_flight(Direction::Older));

        pager
            .complete(&mut window, &plan, Ok(page(0, 20)))
            .unwrap()
            .notify();

        assert_eq!(rx1.await.unwrap(), rx2.await.unwrap());
        assert_eq!(window.len(), 20);
        assert!(!pager.in_flight(Direction::Older));
    }

    #[tokio::test]
    async fn failed_fetch_leaves_window_untouched() {
        let mut window = ChannelWindow::new(channel());
        let mut pager = PaginationController::new(20);
        let plan = pager.admit(&window, Direction::Older, None).unwrap();
        pager
            .complete(&mut window, &plan, Ok(page(100, 120)))
            .unwrap()
            .notify();

        let (tx, rx) = oneshot::channel();
        let plan = pager.admit(&window, Direction::Older, Some(tx)).unwrap();
        pager
            .complete(
                &mut window,
                &plan,
                Err(SyncError::TransientFetch("timeout".into())),
            )
            .unwrap()
            .notify();

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(window.len(), 20);
        assert!(window.has_older());
        assert!(pager.admit(&window, Direction::Older, None).is_some());
    }

    #[tokio::test]
    async fn reset_discards_late_results() {
        let mut window = ChannelWindow::new(channel());
        let mut pager = PaginationController::new(20);
        let (tx, rx) = oneshot::channel();
        let plan = pager.admit(&window, Direction::Older, Some(tx)).unwrap();

        pager.reset(&window);
        assert_eq!(rx.await.unwrap().unwrap().added, 0);

        assert!(pager.complete(&mut window, &plan, Ok(page(0, 20))).is_none());
        assert!(!window.is_loaded());
    }

    #[tokio::test]
    async fn fetch_page_sorts_and_maps_errors() {
        let backend = backend_with("general", page(0, 30));
        let window = ChannelWindow::new(channel());
        let mut pager = PaginationController::new(10);
        let plan = pager.admit(&window, Direction::Older, None).unwrap();

        let fetched = fetch_page(&backend, &channel(), &plan).await.unwrap();
        assert_eq!(fetched.len(), 10);
        assert_eq!(fetched[0].id.as_str(), "m020");
        assert!(fetched.windows(2).all(|w| w[0].sort_key() < w[1].sort_key()));

        backend.fail_next_fetches(1);
        let err = fetch_page(&backend, &channel(), &plan).await.unwrap_err();
        assert!(matches!(err, SyncError::TransientFetch(_)));
    }
}
