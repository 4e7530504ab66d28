//! Contracts of the collaborators the engine consumes.
//!
//! Transport, authentication and server-side ordering live behind
//! [`SyncBackend`]; the engine only relies on the guarantees documented here.

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use tracing::warn;

use chatsync_shared::{
    BackendError, ChangeEvent, ChannelId, ChannelUnread, Cursor, Direction, Message, MessageId,
};

/// Ordered, at-least-once stream of one channel's change events.
pub type EventStream = BoxStream<'static, ChangeEvent>;

#[async_trait]
pub trait SyncBackend: Send + Sync + 'static {
    /// Up to `page_size` messages strictly beyond `cursor` in `direction`,
    /// ordered oldest to newest whatever the direction. Without a cursor the
    /// newest page of the channel is returned.
    async fn fetch_history(
        &self,
        channel: &ChannelId,
        cursor: Option<&Cursor>,
        direction: Direction,
        page_size: usize,
    ) -> Result<Vec<Message>, BackendError>;

    /// Look up a single message, used to anchor a jump.
    async fn fetch_message(
        &self,
        channel: &ChannelId,
        message: &MessageId,
    ) -> Result<Message, BackendError>;

    /// Subscribe to a channel's live events.
    async fn event_stream(&self, channel: &ChannelId) -> Result<EventStream, BackendError>;

    /// Idempotent read acknowledgement for one or more channels.
    async fn mark_channels_read(&self, channels: &[ChannelId]) -> Result<(), BackendError>;

    /// Authoritative membership list with unread counts.
    async fn channels_with_unread_counts(&self) -> Result<Vec<ChannelUnread>, BackendError>;
}

/// Adapt a transport that delivers raw bincode frames into an [`EventStream`].
/// Frames that fail to decode are logged and skipped.
pub fn decode_frames<S>(frames: S) -> EventStream
where
    S: Stream<Item = Vec<u8>> + Send + 'static,
{
    frames
        .filter_map(|frame| async move {
            match ChangeEvent::from_bytes(&frame) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(len = frame.len(), error = %e, "Dropping undecodable event frame");
                    None
                }
            }
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::msg;

    #[tokio::test]
    async fn decode_frames_skips_garbage() {
        let good = ChangeEvent::MessageCreated(msg("general", "m1", "alice", 0));
        let frames = vec![
            vec![0xff, 0x00, 0x13],
            good.to_bytes().unwrap(),
            Vec::new(),
        ];

        let decoded: Vec<ChangeEvent> = decode_frames(futures::stream::iter(frames))
            .collect()
            .await;

        assert_eq!(decoded, vec![good]);
    }
}
