//! Envelope types carried by the message bus
//!
//! An [`Envelope`] is the unit of delivery in both directions: inbound
//! (channel to agent) and outbound (agent to channel). Its delivery state
//! lives on the envelope itself so a journal snapshot is self-describing.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::SYSTEM_CHANNEL;

/// Suffix appended to an inbound id to form the id of its reply.
const REPLY_SUFFIX: &str = ":reply";

/// Which way an envelope travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// From a chat channel to the agent
    Inbound,
    /// From the agent back to a chat channel
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Delivery lifecycle of an envelope.
///
/// `Failed` is still deliverable (awaiting redelivery); `Done` and
/// `DeadLetter` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    #[default]
    Pending,
    InFlight,
    Done,
    Failed,
    DeadLetter,
}

impl DeliveryState {
    /// Can a consumer claim an envelope in this state?
    pub fn is_deliverable(self) -> bool {
        matches!(self, DeliveryState::Pending | DeliveryState::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Done | DeliveryState::DeadLetter)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryState::Pending => "pending",
            DeliveryState::InFlight => "in_flight",
            DeliveryState::Done => "done",
            DeliveryState::Failed => "failed",
            DeliveryState::DeadLetter => "dead_letter",
        };
        write!(f, "{}", s)
    }
}

/// Represents a media attachment (image, audio, video, or document)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub media_type: MediaType,
    /// URL to the media (if hosted remotely)
    pub url: Option<String>,
    /// Raw bytes (if available locally)
    pub data: Option<Vec<u8>>,
    pub filename: Option<String>,
}

/// Types of media that can be attached to an envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediaType {
    Image,
    Audio,
    Video,
    Document,
}

impl MediaAttachment {
    pub fn new(media_type: MediaType) -> Self {
        Self {
            media_type,
            url: None,
            data: None,
            filename: None,
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }

    pub fn has_url(&self) -> bool {
        self.url.is_some()
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }
}

/// What an envelope carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaAttachment>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Payload {
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            ..Self::default()
        }
    }
}

/// A message in flight between channels and the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// UUID v7 for fresh envelopes, `"{inbound_id}:reply"` for replies
    pub id: String,
    /// Publish order, assigned by the store
    #[serde(default)]
    pub seq: u64,
    pub direction: Direction,
    /// Ordering key (default `"channel:chat_id"`)
    pub session_key: String,
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub payload: Payload,
    /// Inbound id this envelope answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub state: DeliveryState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Envelope {
    fn base(direction: Direction, channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            seq: 0,
            direction,
            session_key: format!("{}:{}", channel, chat_id),
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            payload: Payload::text(content),
            reply_to: None,
            created_at: Utc::now(),
            state: DeliveryState::Pending,
            attempts: 0,
            claimed_at: None,
            last_error: None,
        }
    }

    /// Creates an inbound envelope. The session key is `"channel:chat_id"`.
    ///
    /// ```
    /// use aisbot::bus::Envelope;
    ///
    /// let env = Envelope::inbound("telegram", "user123", "chat456", "Hello, bot!");
    /// assert_eq!(env.session_key, "telegram:chat456");
    /// ```
    pub fn inbound(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self::base(Direction::Inbound, channel, sender_id, chat_id, content)
    }

    /// Creates an inbound envelope on the system channel for background work
    /// reporting back to the chat `origin_channel:origin_chat_id`.
    ///
    /// It takes the origin chat's session key, so the bus orders it with that
    /// chat's user envelopes.
    ///
    /// ```
    /// use aisbot::bus::Envelope;
    ///
    /// let env = Envelope::system("cron", "telegram", "42", "Job finished");
    /// assert_eq!(env.channel, "system");
    /// assert_eq!(env.chat_id, "telegram:42");
    /// assert_eq!(env.session_key, "telegram:42");
    /// ```
    pub fn system(
        sender_id: &str,
        origin_channel: &str,
        origin_chat_id: &str,
        content: &str,
    ) -> Self {
        let origin = format!("{}:{}", origin_channel, origin_chat_id);
        Self::base(Direction::Inbound, SYSTEM_CHANNEL, sender_id, &origin, content)
            .with_session_key(&origin)
    }

    /// Creates an outbound envelope not tied to an inbound one.
    pub fn outbound(channel: &str, chat_id: &str, content: &str) -> Self {
        Self::base(Direction::Outbound, channel, "", chat_id, content)
    }

    /// Creates the reply to an inbound envelope.
    ///
    /// The id is derived from the inbound id, so publishing the same reply
    /// twice is detected as a duplicate.
    ///
    /// ```
    /// use aisbot::bus::{Direction, Envelope};
    ///
    /// let inbound = Envelope::inbound("telegram", "user123", "chat456", "Hello");
    /// let reply = Envelope::reply(&inbound, "Hello back!");
    /// assert_eq!(reply.direction, Direction::Outbound);
    /// assert_eq!(reply.id, Envelope::reply_id(&inbound.id));
    /// assert_eq!(reply.chat_id, "chat456");
    /// ```
    pub fn reply(inbound: &Envelope, content: &str) -> Self {
        let mut env = Self::base(
            Direction::Outbound,
            &inbound.channel,
            "",
            &inbound.chat_id,
            content,
        );
        env.id = Self::reply_id(&inbound.id);
        env.session_key = inbound.session_key.clone();
        env.reply_to = Some(inbound.id.clone());
        env
    }

    /// Id of the reply to the inbound envelope `inbound_id`.
    pub fn reply_id(inbound_id: &str) -> String {
        format!("{}{}", inbound_id, REPLY_SUFFIX)
    }

    /// Override the ordering key (builder pattern).
    pub fn with_session_key(mut self, key: &str) -> Self {
        self.session_key = key.to_string();
        self
    }

    /// Send to a different channel and chat (builder pattern).
    pub fn with_route(mut self, channel: &str, chat_id: &str) -> Self {
        self.channel = channel.to_string();
        self.chat_id = chat_id.to_string();
        self
    }

    pub fn with_media(mut self, media: MediaAttachment) -> Self {
        self.payload.media.push(media);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.payload
            .metadata
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_reply_to(mut self, id: &str) -> Self {
        self.reply_to = Some(id.to_string());
        self
    }

    pub fn content(&self) -> &str {
        &self.payload.content
    }

    pub fn has_media(&self) -> bool {
        !self.payload.media.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_envelope_creation() {
        let env = Envelope::inbound("telegram", "user123", "chat456", "Hello");
        assert_eq!(env.direction, Direction::Inbound);
        assert_eq!(env.channel, "telegram");
        assert_eq!(env.sender_id, "user123");
        assert_eq!(env.content(), "Hello");
        assert_eq!(env.session_key, "telegram:chat456");
        assert_eq!(env.state, DeliveryState::Pending);
        assert_eq!(env.attempts, 0);
        assert!(!env.has_media());
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let a = Envelope::inbound("cli", "u", "1", "a");
        let b = Envelope::inbound("cli", "u", "1", "b");
        assert_ne!(a.id, b.id);
        assert!(a.id < b.id);
    }

    #[test]
    fn test_reply_is_deterministic() {
        let inbound = Envelope::inbound("discord", "u", "c", "hi").with_session_key("discord:c:u");
        let first = Envelope::reply(&inbound, "one");
        let second = Envelope::reply(&inbound, "two");
        assert_eq!(first.id, second.id);
        assert_eq!(first.reply_to.as_deref(), Some(inbound.id.as_str()));
        assert_eq!(first.session_key, "discord:c:u");
    }

    #[test]
    fn test_with_route() {
        let inbound = Envelope::inbound("system", "cron", "telegram:42", "done");
        let reply = Envelope::reply(&inbound, "ok").with_route("telegram", "42");
        assert_eq!(reply.channel, "telegram");
        assert_eq!(reply.chat_id, "42");
    }

    #[test]
    fn test_media_and_metadata() {
        let media = MediaAttachment::new(MediaType::Audio)
            .with_url("https://example.com/audio.mp3")
            .with_data(vec![1, 2, 3])
            .with_filename("audio.mp3");
        let env = Envelope::inbound("telegram", "u", "c", "listen")
            .with_media(media)
            .with_metadata("message_id", "12345");

        assert!(env.has_media());
        assert!(env.payload.media[0].has_url());
        assert!(env.payload.media[0].has_data());
        assert_eq!(
            env.payload.metadata.get("message_id"),
            Some(&"12345".to_string())
        );
    }

    #[test]
    fn test_state_predicates() {
        assert!(DeliveryState::Pending.is_deliverable());
        assert!(DeliveryState::Failed.is_deliverable());
        assert!(!DeliveryState::InFlight.is_deliverable());
        assert!(DeliveryState::Done.is_terminal());
        assert!(DeliveryState::DeadLetter.is_terminal());
        assert!(!DeliveryState::Failed.is_terminal());
    }

    #[test]
    fn test_serialization_uses_snake_case() {
        let mut env = Envelope::inbound("cli", "u", "1", "x");
        env.state = DeliveryState::DeadLetter;
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"state\":\"dead_letter\""));
        assert!(json.contains("\"direction\":\"inbound\""));

        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_missing_delivery_fields_default() {
        let json = r#"{
            "id": "x", "direction": "outbound", "session_key": "cli:1",
            "channel": "cli", "sender_id": "", "chat_id": "1",
            "payload": {"content": "hi"}, "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.state, DeliveryState::Pending);
        assert_eq!(env.seq, 0);
        assert!(env.payload.media.is_empty());
    }
}
