//! Builders shared by the client tests.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;

use chatsync_shared::{ChannelId, ChannelKind, Message, MessageId, MessagePayload, UserId};

use crate::channel_task::WindowView;
use crate::memory::MemoryBackend;
use crate::merge::UnreadSignal;

pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
}

/// History message `minutes` after a fixed origin.
pub fn msg(channel: &str, id: &str, author: &str, minutes: i64) -> Message {
    Message::new(
        MessageId::from(id),
        ChannelId::from(channel),
        UserId::from(author),
        at(minutes),
        MessagePayload::text(format!("{author}: {id}")),
    )
}

/// Message stamped with the current wall clock, newer than any history.
pub fn live(channel: &str, id: &str, author: &str) -> Message {
    Message::new(
        MessageId::from(id),
        ChannelId::from(channel),
        UserId::from(author),
        Utc::now(),
        MessagePayload::text(format!("{author}: {id}")),
    )
}

pub fn signal(channel: &str, id: &str, author: &str, created_at: DateTime<Utc>) -> UnreadSignal {
    UnreadSignal {
        channel_id: ChannelId::from(channel),
        message_id: MessageId::from(id),
        author: UserId::from(author),
        created_at,
    }
}

/// Backend viewed by "alice" holding one group channel.
pub fn backend_with(channel: &str, messages: impl IntoIterator<Item = Message>) -> MemoryBackend {
    let backend = MemoryBackend::for_viewer(UserId::from("alice"));
    backend.add_channel(ChannelId::from(channel), ChannelKind::Group);
    backend.seed(messages);
    backend
}

/// `count` messages named `m000`, `m001`, ... one minute apart.
pub fn history(channel: &str, count: i64) -> Vec<Message> {
    (0..count)
        .map(|i| msg(channel, &format!("m{i:03}"), "bob", i))
        .collect()
}

pub async fn wait_for_view(
    rx: &mut watch::Receiver<WindowView>,
    mut predicate: impl FnMut(&WindowView) -> bool,
) -> WindowView {
    let view = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|v| predicate(v)))
        .await
        .expect("timed out waiting for window view")
        .expect("channel task stopped");
    view.clone()
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
