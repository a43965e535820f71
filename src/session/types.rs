//! Session types for Aisbot
//!
//! Sessions, conversation messages, roles and tool calls. A session also keeps
//! a small ledger of inbound envelopes it has already answered, which is what
//! makes redelivered envelopes idempotent.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::CompressionStats;
use crate::bus::MediaAttachment;
use crate::error::{AisbotError, Result};

/// Processed envelope ids remembered per session.
pub const PROCESSED_LEDGER_CAPACITY: usize = 256;

/// A conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier for this session (e.g., "telegram:chat123")
    pub key: String,
    /// Ordered list of messages in this conversation
    pub messages: Vec<Message>,
    /// Optional summary of earlier conversation context
    #[serde(default)]
    pub summary: Option<String>,
    /// Hash key of the rendered system prompt last used for this session
    #[serde(default)]
    pub prompt_hash: Option<String>,
    /// Outcome of the most recent compression decision
    #[serde(default)]
    pub last_compression: Option<CompressionStats>,
    /// Inbound envelopes already answered, oldest first
    #[serde(default)]
    pub processed: VecDeque<ProcessedEnvelope>,
    /// Set when a cycle hit a fatal error
    #[serde(default)]
    pub failure: Option<String>,
    /// When this session was created
    pub created_at: DateTime<Utc>,
    /// When this session was last modified
    pub updated_at: DateTime<Utc>,
}

/// Record of an inbound envelope that produced a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEnvelope {
    pub envelope_id: String,
    pub reply: String,
    pub reply_channel: String,
    pub reply_chat_id: String,
    pub processed_at: DateTime<Utc>,
}

impl Session {
    /// Create a new empty session with the given key.
    ///
    /// # Example
    /// ```
    /// use aisbot::session::Session;
    ///
    /// let session = Session::new("telegram:chat123");
    /// assert!(session.messages.is_empty());
    /// ```
    pub fn new(key: &str) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            messages: Vec::new(),
            summary: None,
            prompt_hash: None,
            last_compression: None,
            processed: VecDeque::new(),
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message, enforcing tool call pairing.
    ///
    /// A tool result must answer a call that is outstanding (issued by an
    /// earlier assistant message and not yet answered). An assistant message
    /// may not reissue an id that is still outstanding.
    ///
    /// # Errors
    /// Returns `AisbotError::Fatal` when pairing would be violated. The
    /// session is left unchanged.
    ///
    /// # Example
    /// ```
    /// use aisbot::session::{Message, Session};
    ///
    /// let mut session = Session::new("test");
    /// session.add_message(Message::user("Hello!")).unwrap();
    /// assert!(session.add_message(Message::tool_result("nope", "3")).is_err());
    /// assert_eq!(session.messages.len(), 1);
    /// ```
    pub fn add_message(&mut self, message: Message) -> Result<()> {
        let outstanding = self.outstanding_tool_calls();

        if message.role == Role::Tool {
            match &message.tool_call_id {
                Some(id) if outstanding.contains(id.as_str()) => {}
                Some(id) => {
                    return Err(AisbotError::Fatal(format!(
                        "tool result '{}' does not answer an outstanding call in '{}'",
                        id, self.key
                    )))
                }
                None => {
                    return Err(AisbotError::Fatal(format!(
                        "tool result without a call id in '{}'",
                        self.key
                    )))
                }
            }
        }

        if let Some(calls) = &message.tool_calls {
            let mut seen = HashSet::new();
            for call in calls {
                if outstanding.contains(call.id.as_str()) || !seen.insert(call.id.as_str()) {
                    return Err(AisbotError::Fatal(format!(
                        "tool call id '{}' is already outstanding in '{}'",
                        call.id, self.key
                    )));
                }
            }
        }

        self.messages.push(message);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Ids of tool calls that have been issued but not yet answered.
    pub fn outstanding_tool_calls(&self) -> HashSet<&str> {
        let mut outstanding = HashSet::new();
        for msg in &self.messages {
            if let Some(calls) = &msg.tool_calls {
                outstanding.extend(calls.iter().map(|c| c.id.as_str()));
            }
            if let Some(id) = &msg.tool_call_id {
                outstanding.remove(id.as_str());
            }
        }
        outstanding
    }

    /// Remember that `envelope_id` was answered with `reply`.
    pub fn record_processed(
        &mut self,
        envelope_id: &str,
        reply: &str,
        reply_channel: &str,
        reply_chat_id: &str,
    ) {
        if self.processed_reply(envelope_id).is_some() {
            return;
        }
        while self.processed.len() >= PROCESSED_LEDGER_CAPACITY {
            self.processed.pop_front();
        }
        self.processed.push_back(ProcessedEnvelope {
            envelope_id: envelope_id.to_string(),
            reply: reply.to_string(),
            reply_channel: reply_channel.to_string(),
            reply_chat_id: reply_chat_id.to_string(),
            processed_at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// The stored reply for an already-processed envelope.
    pub fn processed_reply(&self, envelope_id: &str) -> Option<&ProcessedEnvelope> {
        self.processed
            .iter()
            .rev()
            .find(|p| p.envelope_id == envelope_id)
    }

    /// Mark the session as failed.
    pub fn mark_failed(&mut self, reason: &str) {
        self.failure = Some(reason.to_string());
        self.updated_at = Utc::now();
    }

    /// Clear all messages and summary from this session.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.summary = None;
        self.updated_at = Utc::now();
    }

    /// Get the number of messages in this session.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Check if this session is empty (no messages).
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Get the last message in this session, if any.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender
    pub role: Role,
    /// The text content of the message
    pub content: String,
    /// Tool calls made by the assistant (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// ID of the tool call this message is responding to (for tool results)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Whether a tool result reports a failure
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    /// Attachments sent along with a user message; each provider maps them
    /// onto its own multimodal format
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaAttachment>,
}

impl Message {
    fn with_role(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            tool_calls: None,
            tool_call_id: None,
            is_error: false,
            media: Vec::new(),
        }
    }

    /// Create a new user message.
    ///
    /// ```
    /// use aisbot::session::{Message, Role};
    ///
    /// let msg = Message::user("Hello, assistant!");
    /// assert_eq!(msg.role, Role::User);
    /// ```
    pub fn user(content: &str) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: &str) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: &str) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Create a successful tool result answering `tool_call_id`.
    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.to_string()),
            ..Self::with_role(Role::Tool, content)
        }
    }

    /// Create a failed tool result answering `tool_call_id`.
    pub fn tool_error(tool_call_id: &str, content: &str) -> Self {
        Self {
            is_error: true,
            ..Self::tool_result(tool_call_id, content)
        }
    }

    /// Create an assistant message that issues tool calls.
    ///
    /// ```
    /// use aisbot::session::{Message, ToolCall};
    ///
    /// let msg = Message::assistant_with_tools(
    ///     "Let me add those",
    ///     vec![ToolCall::new("call_1", "add", r#"{"a":1,"b":2}"#)],
    /// );
    /// assert!(msg.has_tool_calls());
    /// ```
    pub fn assistant_with_tools(content: &str, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(tool_calls),
            ..Self::with_role(Role::Assistant, content)
        }
    }

    /// Attach media (builder pattern).
    ///
    /// ```
    /// use aisbot::bus::{MediaAttachment, MediaType};
    /// use aisbot::session::Message;
    ///
    /// let photo = MediaAttachment::new(MediaType::Image).with_url("https://example.com/cat.png");
    /// let msg = Message::user("What is this?").with_media(vec![photo]);
    /// assert!(msg.has_media());
    /// ```
    pub fn with_media(mut self, media: Vec<MediaAttachment>) -> Self {
        self.media = media;
        self
    }

    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }

    /// Check if this message contains tool calls.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty())
    }

    /// Check if this message is a tool result.
    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool && self.tool_call_id.is_some()
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A tool call requested by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call
    pub id: String,
    /// Name of the tool to invoke
    pub name: String,
    /// Arguments as a JSON string
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: &str, name: &str, arguments: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }
}
