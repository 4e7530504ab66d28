use serde::Serialize;
use tokio::sync::broadcast;

use chatsync_shared::{ChannelId, Direction, MessageId};

/// User-visible, non-fatal outcomes (toasts). Nothing here means the engine
/// state is broken; the window and counters stay consistent regardless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncNotice {
    /// A mark-as-read call failed after its retries. Local counters stay at 0.
    MarkReadFailed {
        channels: Vec<ChannelId>,
        error: String,
    },
    /// A jump target no longer exists in history.
    JumpNotFound {
        channel: ChannelId,
        message: MessageId,
    },
    /// A history page could not be fetched; the caller may retry.
    FetchFailed {
        channel: ChannelId,
        direction: Direction,
        error: String,
    },
}

/// Fan-out of [`SyncNotice`]s to any number of UI subscribers.
#[derive(Clone, Debug)]
pub struct NoticeBus {
    tx: broadcast::Sender<SyncNotice>,
}

impl NoticeBus {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotice> {
        self.tx.subscribe()
    }

    /// Emission is best-effort; with no subscriber the notice is only logged.
    pub fn emit(&self, notice: SyncNotice) {
        tracing::warn!(?notice, "sync notice");
        let _ = self.tx.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_notices_to_subscribers() {
        let bus = NoticeBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(SyncNotice::JumpNotFound {
            channel: ChannelId::from("general"),
            message: MessageId::from("m1"),
        });

        let notice_a = a.recv().await.expect("subscriber a should receive notice");
        let notice_b = b.recv().await.expect("subscriber b should receive notice");
        assert_eq!(notice_a, notice_b);
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let bus = NoticeBus::new(1);
        bus.emit(SyncNotice::MarkReadFailed {
            channels: vec![ChannelId::from("general")],
            error: "timeout".into(),
        });
    }

    #[test]
    fn notices_serialize_with_type_tag() {
        let json = serde_json::to_value(SyncNotice::FetchFailed {
            channel: ChannelId::from("general"),
            direction: Direction::Older,
            error: "reset".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "fetch_failed");
        assert_eq!(json["direction"], "older");
    }
}
