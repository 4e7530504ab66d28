//! JSON scenario format: the channels a backend starts with and the UI
//! actions and server events to replay against a session.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use chatsync_client::MemoryBackend;
use chatsync_shared::{
    ChangeEvent, ChannelId, ChannelKind, Message, MessageId, MessagePayload, UserId,
};

fn default_settle_ms() -> u64 {
    20
}

#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub viewer: String,
    #[serde(default)]
    pub page_size: Option<usize>,
    /// Pause after every step so live events reach the channel tasks.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    pub channels: Vec<ScriptChannel>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct ScriptChannel {
    pub id: String,
    pub kind: ChannelKind,
    #[serde(default)]
    pub unread: u32,
    #[serde(default)]
    pub history: Vec<ScriptMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptMessage {
    pub id: String,
    pub author: String,
    /// Defaults to the time the step runs.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    pub text: String,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl ScriptMessage {
    pub fn to_message(&self, channel: &str) -> Message {
        let message = Message::new(
            MessageId::from(self.id.as_str()),
            ChannelId::from(channel),
            UserId::from(self.author.as_str()),
            self.at.unwrap_or_else(Utc::now),
            MessagePayload::text(self.text.as_str()),
        );
        match &self.reply_to {
            Some(target) => message.with_reply_to(MessageId::from(target.as_str())),
            None => message,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Focus { channel: String },
    Blur { channel: String },
    Older { channel: String },
    Newer { channel: String },
    Jump { channel: String, message: String },
    /// The viewer sends a message: shown locally, then echoed by the server.
    Send { channel: String, message: ScriptMessage },
    /// Someone else's message arrives as a live event.
    Post { channel: String, message: ScriptMessage },
    Edit { channel: String, message: String, text: String },
    Delete { channel: String, message: String },
    React {
        channel: String,
        message: String,
        key: String,
        user: String,
        #[serde(default = "default_added")]
        added: bool,
    },
    Pin {
        channel: String,
        message: String,
        #[serde(default = "default_added")]
        pinned: bool,
    },
    MarkAllRead { channels: Vec<String> },
    Refresh,
    Print { channel: String },
    Unread,
    SleepMs { ms: u64 },
}

fn default_added() -> bool {
    true
}

impl Scenario {
    pub fn build_backend(&self) -> MemoryBackend {
        let backend = MemoryBackend::for_viewer(UserId::from(self.viewer.as_str()));
        for channel in &self.channels {
            let id = ChannelId::from(channel.id.as_str());
            backend.add_channel(id.clone(), channel.kind);
            backend.seed(channel.history.iter().map(|m| m.to_message(&channel.id)));
            backend.set_unread(&id, channel.unread);
        }
        backend
    }
}

/// Build the server-side event for an edit of an existing message.
pub fn edit_event(backend: &MemoryBackend, channel: &str, id: &str, text: &str) -> Option<ChangeEvent> {
    let mut message = find(backend, channel, id)?;
    message.payload = MessagePayload::text(text);
    message.edited = true;
    message.modified_at = Utc::now().max(message.modified_at);
    Some(ChangeEvent::MessageEdited(message))
}

pub fn delete_event(backend: &MemoryBackend, channel: &str, id: &str) -> ChangeEvent {
    ChangeEvent::MessageDeleted {
        channel_id: ChannelId::from(channel),
        message_id: MessageId::from(id),
        created_at: find(backend, channel, id).map(|m| m.created_at),
    }
}

fn find(backend: &MemoryBackend, channel: &str, id: &str) -> Option<Message> {
    backend
        .history(&ChannelId::from(channel))
        .into_iter()
        .find(|m| m.id.as_str() == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "viewer": "alice",
        "page_size": 2,
        "channels": [
            {
                "id": "general",
                "kind": "group",
                "unread": 1,
                "history": [
                    {"id": "m1", "author": "bob", "at": "2024-06-01T10:00:00Z", "text": "hello"},
                    {"id": "m2", "author": "bob", "at": "2024-06-01T10:01:00Z", "text": "again", "reply_to": "m1"}
                ]
            },
            {"id": "dm-bob", "kind": "direct"}
        ],
        "steps": [
            {"action": "focus", "channel": "general"},
            {"action": "react", "channel": "general", "message": "m1", "key": "+1", "user": "carol"},
            {"action": "mark_all_read", "channels": ["general", "dm-bob"]},
            {"action": "sleep_ms", "ms": 5},
            {"action": "unread"}
        ]
    }"#;

    #[test]
    fn parses_sample_scenario() {
        let scenario: Scenario = serde_json::from_str(SAMPLE).unwrap();

        assert_eq!(scenario.settle_ms, 20);
        assert_eq!(scenario.channels.len(), 2);
        assert_eq!(scenario.channels[1].kind, ChannelKind::Direct);
        assert_eq!(scenario.steps.len(), 5);
        assert!(matches!(&scenario.steps[1], Step::React { added: true, .. }));
        assert!(matches!(&scenario.steps[2], Step::MarkAllRead { channels } if channels.len() == 2));
    }

    #[test]
    fn backend_is_seeded_from_channels() {
        let scenario: Scenario = serde_json::from_str(SAMPLE).unwrap();
        let backend = scenario.build_backend();

        let history = backend.history(&ChannelId::from("general"));
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[1].reply_to.as_ref().map(|r| r.target.as_str()),
            Some("m1")
        );
        assert_eq!(backend.unread(&ChannelId::from("general")), Some(1));
    }

    #[test]
    fn edit_keeps_identity_and_marks_edited() {
        let scenario: Scenario = serde_json::from_str(SAMPLE).unwrap();
        let backend = scenario.build_backend();

        let Some(ChangeEvent::MessageEdited(message)) =
            edit_event(&backend, "general", "m2", "changed")
        else {
            panic!("expected an edit event");
        };
        assert_eq!(message.id.as_str(), "m2");
        assert!(message.edited);
        assert!(edit_event(&backend, "general", "missing", "x").is_none());
    }
}
