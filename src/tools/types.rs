//! Tool types for Aisbot
//!
//! The `Tool` trait every tool implements, what a tool returns, and the
//! context it runs in.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Result of a tool execution as fed back to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Content placed in the `tool` message
    pub for_llm: String,
    /// Optional text a channel may show the user directly
    pub for_user: Option<String>,
    /// Whether this output reports a failure
    pub is_error: bool,
}

impl ToolOutput {
    /// Output visible only to the model.
    pub fn llm_only(content: impl Into<String>) -> Self {
        Self {
            for_llm: content.into(),
            for_user: None,
            is_error: false,
        }
    }

    /// Output shown to both the model and the user.
    pub fn user_visible(content: impl Into<String>) -> Self {
        let s = content.into();
        Self {
            for_llm: s.clone(),
            for_user: Some(s),
            is_error: false,
        }
    }

    /// A failure. The content should start with `"Error: "`.
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            for_llm: content.into(),
            for_user: None,
            is_error: true,
        }
    }
}

/// A capability the model can invoke by name.
///
/// # Example
///
/// ```
/// use aisbot::tools::{Tool, ToolContext, ToolOutput};
/// use aisbot::Result;
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
///
/// struct AddTool;
///
/// #[async_trait]
/// impl Tool for AddTool {
///     fn name(&self) -> &str { "add" }
///     fn description(&self) -> &str { "Add two integers" }
///     fn parameters(&self) -> Value {
///         json!({"type": "object", "properties": {
///             "a": {"type": "integer"}, "b": {"type": "integer"}}})
///     }
///     async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
///         let a = args["a"].as_i64().unwrap_or(0);
///         let b = args["b"].as_i64().unwrap_or(0);
///         Ok(ToolOutput::llm_only((a + b).to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model uses to call this tool.
    fn name(&self) -> &str;

    /// What the tool does, shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters(&self) -> Value;

    /// Run the tool. Returning `Err` is fine: the loop turns it into an
    /// error result instead of aborting the cycle.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// Where a tool call originates.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Channel of the conversation
    pub channel: Option<String>,
    /// Chat within the channel
    pub chat_id: Option<String>,
    /// Session key of the conversation
    pub session_key: Option<String>,
    /// Workspace directory
    pub workspace: Option<String>,
}

impl ToolContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: &str, chat_id: &str) -> Self {
        self.channel = Some(channel.to_string());
        self.chat_id = Some(chat_id.to_string());
        self
    }

    pub fn with_session(mut self, session_key: &str) -> Self {
        self.session_key = Some(session_key.to_string());
        self
    }

    pub fn with_workspace(mut self, workspace: &str) -> Self {
        self.workspace = Some(workspace.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_output_constructors() {
        let out = ToolOutput::llm_only("3");
        assert!(!out.is_error);
        assert!(out.for_user.is_none());

        let out = ToolOutput::user_visible("done");
        assert_eq!(out.for_user.as_deref(), Some("done"));

        let out = ToolOutput::error("Error: boom");
        assert!(out.is_error);
    }

    #[test]
    fn test_tool_context_builder() {
        let ctx = ToolContext::new()
            .with_channel("telegram", "42")
            .with_session("telegram:42")
            .with_workspace("/tmp/ws");
        assert_eq!(ctx.channel.as_deref(), Some("telegram"));
        assert_eq!(ctx.chat_id.as_deref(), Some("42"));
        assert_eq!(ctx.session_key.as_deref(), Some("telegram:42"));
        assert_eq!(ctx.workspace.as_deref(), Some("/tmp/ws"));
    }
}
