//! # chatsync-replay
//!
//! Replays a JSON scenario against an in-memory backend and prints every
//! window view, unread snapshot and notice as one JSON document per line.
//!
//! ```text
//! chatsync-replay crates/chatsync-replay/scenarios/basic.json
//! ```

mod scenario;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing::info;

use chatsync_client::{clamp_page_size, MemoryBackend, SyncBackend, SyncConfig, SyncSession};
use chatsync_shared::{ChangeEvent, ChannelId, MessageId, SyncError, UserId};

use crate::scenario::{delete_event, edit_event, Scenario, Step};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chatsync_client::init_logging();

    let path = std::env::args()
        .nth(1)
        .context("usage: chatsync-replay <scenario.json>")?;
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let scenario: Scenario =
        serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;

    let mut config = SyncConfig::from_env();
    if let Some(page_size) = scenario.page_size {
        config.page_size = clamp_page_size(page_size);
    }
    info!(?config, steps = scenario.steps.len(), "replaying scenario");

    let backend = Arc::new(scenario.build_backend());
    let dyn_backend: Arc<dyn SyncBackend> = backend.clone();
    let session = SyncSession::start(config, dyn_backend, UserId::from(scenario.viewer.as_str()))
        .await
        .context("starting session")?;

    let mut notices = session.subscribe_notices();
    let printer = tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            println!("{}", json!({ "notice": notice }));
        }
    });

    let settle = Duration::from_millis(scenario.settle_ms);
    for (index, step) in scenario.steps.iter().enumerate() {
        match run_step(&session, &backend, step).await {
            Ok(Some(output)) => println!("{}", json!({ "step": index, "output": output })),
            Ok(None) => {}
            Err(e) => println!("{}", json!({ "step": index, "error": e.to_string() })),
        }
        tokio::time::sleep(settle).await;
    }

    session.shutdown().await;
    printer.abort();
    Ok(())
}

fn ch(id: &str) -> ChannelId {
    ChannelId::from(id)
}

async fn run_step(
    session: &SyncSession,
    backend: &MemoryBackend,
    step: &Step,
) -> Result<Option<serde_json::Value>, SyncError> {
    let output = match step {
        Step::Focus { channel } => {
            session.on_channel_focused(&ch(channel)).await?;
            None
        }
        Step::Blur { channel } => {
            session.on_channel_blurred(&ch(channel)).await?;
            None
        }
        Step::Older { channel } => Some(json!(session.request_older(&ch(channel)).await?)),
        Step::Newer { channel } => Some(json!(session.request_newer(&ch(channel)).await?)),
        Step::Jump { channel, message } => Some(json!(
            session
                .jump_to(&ch(channel), &MessageId::from(message.as_str()))
                .await?
        )),
        Step::Send { channel, message } => {
            let mut message = message.to_message(channel);
            message.author = session.self_id().clone();
            session.record_sent(message.clone()).await?;
            backend.publish(ChangeEvent::MessageCreated(message));
            None
        }
        Step::Post { channel, message } => {
            backend.publish(ChangeEvent::MessageCreated(message.to_message(channel)));
            None
        }
        Step::Edit {
            channel,
            message,
            text,
        } => {
            match edit_event(backend, channel, message, text) {
                Some(event) => backend.publish(event),
                None => {
                    return Err(SyncError::NotFound {
                        channel: ch(channel),
                        message: MessageId::from(message.as_str()),
                    })
                }
            }
            None
        }
        Step::Delete { channel, message } => {
            backend.publish(delete_event(backend, channel, message));
            None
        }
        Step::React {
            channel,
            message,
            key,
            user,
            added,
        } => {
            backend.publish(ChangeEvent::ReactionChanged {
                channel_id: ch(channel),
                message_id: MessageId::from(message.as_str()),
                reaction_key: key.clone(),
                user_id: UserId::from(user.as_str()),
                added: *added,
            });
            None
        }
        Step::Pin {
            channel,
            message,
            pinned,
        } => {
            backend.publish(ChangeEvent::PinChanged {
                channel_id: ch(channel),
                message_id: MessageId::from(message.as_str()),
                pinned: *pinned,
            });
            None
        }
        Step::MarkAllRead { channels } => {
            let ids: Vec<ChannelId> = channels.iter().map(|c| ch(c)).collect();
            session.mark_all_as_read(&ids).await?;
            None
        }
        Step::Refresh => {
            let result = session.refresh_channel_list().await?;
            Some(json!({
                "added": result.added,
                "removed": result.removed,
                "corrected": result.corrected,
            }))
        }
        Step::Print { channel } => Some(json!(session.window_view(&ch(channel))?)),
        Step::Unread => Some(json!(session.unread_snapshot())),
        Step::SleepMs { ms } => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            None
        }
    };
    Ok(output)
}
