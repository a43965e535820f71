//! Tools module - tool contract and registry for model function calling
//!
//! Individual tool implementations live with the embedding application; this
//! module only defines how they are described, looked up and executed.
//!
//! - `Tool` trait: the interface every tool implements
//! - `ToolContext`: channel, chat, session and workspace of the call
//! - `ToolRegistry`: name lookup plus bounded, never-failing invocation
//!
//! # Example
//!
//! ```rust
//! use aisbot::providers::LLMToolCall;
//! use aisbot::tools::{EchoTool, ToolContext, ToolRegistry};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let mut registry = ToolRegistry::new();
//! registry.register(Box::new(EchoTool));
//!
//! let call = LLMToolCall::new("call_1", "echo", r#"{"message": "Hello!"}"#);
//! let output = registry
//!     .invoke(&call, &ToolContext::new(), Duration::from_secs(5))
//!     .await;
//! assert_eq!(output.for_llm, "Hello!");
//! # });
//! ```

mod registry;
mod types;

pub use registry::ToolRegistry;
pub use types::{Tool, ToolContext, ToolOutput};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Echoes back its `message` argument. Handy for wiring tests.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the provided message"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let message = args
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(ToolOutput::llm_only(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_echo_tool_schema() {
        let params = EchoTool.parameters();
        assert_eq!(params["type"], "object");
        assert_eq!(params["properties"]["message"]["type"], "string");
    }

    #[tokio::test]
    async fn test_echo_tool_execute() {
        let out = EchoTool
            .execute(json!({"message": "Hello"}), &ToolContext::new())
            .await
            .unwrap();
        assert_eq!(out.for_llm, "Hello");

        let out = EchoTool.execute(json!({}), &ToolContext::new()).await.unwrap();
        assert_eq!(out.for_llm, "");
    }
}
