//! Tool registry for Aisbot
//!
//! Maps tool names to implementations and gives the agent loop one call,
//! [`ToolRegistry::invoke`], that always yields a [`ToolOutput`]: unknown
//! tools, malformed arguments, tool errors and timeouts all come back as
//! error outputs instead of aborting the cycle.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

use crate::error::Result;
use crate::providers::{LLMToolCall, ToolDefinition};

use super::{Tool, ToolContext, ToolOutput};

/// Name to tool map.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        info!(tool = %name, "Registering tool");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Execute a tool by name with parsed arguments.
    ///
    /// An unknown tool is reported as `Ok(ToolOutput::error(..))`; errors
    /// from the tool itself are propagated.
    pub async fn execute_with_context(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        let Some(tool) = self.tools.get(name) else {
            return Ok(ToolOutput::error(format!("Error: Tool not found: {}", name)));
        };

        let start = Instant::now();
        let result = tool.execute(args, ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(tool = name, duration_ms, "Tool executed successfully"),
            Err(e) => warn!(tool = name, error = %e, duration_ms, "Tool execution failed"),
        }
        result
    }

    /// Execute a model-issued call under a deadline.
    ///
    /// Never fails: every problem becomes an error output whose content
    /// starts with `"Error: "`. Arguments that are not a valid JSON object
    /// never reach the tool.
    pub async fn invoke(
        &self,
        call: &LLMToolCall,
        ctx: &ToolContext,
        timeout: Duration,
    ) -> ToolOutput {
        let args = match parse_call_arguments(&call.arguments) {
            Ok(args) => args,
            Err(reason) => {
                warn!(tool = %call.name, call_id = %call.id, "Rejected malformed tool arguments");
                return ToolOutput::error(format!(
                    "Error: invalid arguments for tool '{}': {}",
                    call.name, reason
                ));
            }
        };

        match tokio::time::timeout(timeout, self.execute_with_context(&call.name, args, ctx)).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => ToolOutput::error(format!("Error: {}", e)),
            Err(_) => {
                warn!(tool = %call.name, timeout_secs = timeout.as_secs_f64(), "Tool timed out");
                ToolOutput::error(format!(
                    "Error: tool '{}' timed out after {}s",
                    call.name,
                    timeout.as_secs_f64()
                ))
            }
        }
    }

    /// Definitions of every registered tool, sorted by name so the request
    /// sent to the model is stable across calls.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.parameters()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Sorted tool names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a raw argument string. Empty input means "no arguments".
fn parse_call_arguments(raw: &str) -> std::result::Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(format!("expected a JSON object, got {}", json_kind(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AisbotError;
    use crate::tools::EchoTool;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
            Err(AisbotError::Tool("disk on fire".into()))
        }
    }

    struct SleepyTool;

    #[async_trait]
    impl Tool for SleepyTool {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "Sleeps"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ToolOutput::llm_only("awake"))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        registry.register(Box::new(FailingTool));
        registry.register(Box::new(SleepyTool));
        registry
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_registry_basics() {
        let registry = registry();
        assert_eq!(registry.len(), 3);
        assert!(registry.has("echo"));
        assert!(!registry.has("nope"));
        assert_eq!(registry.names(), vec!["echo", "fail", "sleepy"]);
        assert!(ToolRegistry::default().is_empty());
    }

    #[test]
    fn test_definitions_sorted() {
        let names: Vec<String> = registry()
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["echo", "fail", "sleepy"]);
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let call = LLMToolCall::new("c1", "echo", r#"{"message":"hi"}"#);
        let out = registry().invoke(&call, &ToolContext::new(), SECOND).await;
        assert!(!out.is_error);
        assert_eq!(out.for_llm, "hi");
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let call = LLMToolCall::new("c1", "missing", "{}");
        let out = registry().invoke(&call, &ToolContext::new(), SECOND).await;
        assert!(out.is_error);
        assert_eq!(out.for_llm, "Error: Tool not found: missing");
    }

    #[tokio::test]
    async fn test_invoke_tool_error() {
        let call = LLMToolCall::new("c1", "fail", "{}");
        let out = registry().invoke(&call, &ToolContext::new(), SECOND).await;
        assert!(out.is_error);
        assert!(out.for_llm.starts_with("Error: "));
        assert!(out.for_llm.contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_invoke_malformed_arguments() {
        let registry = registry();
        for raw in ["{not json", "[1,2]", "42"] {
            let call = LLMToolCall::new("c1", "echo", raw);
            let out = registry.invoke(&call, &ToolContext::new(), SECOND).await;
            assert!(out.is_error, "{} should be rejected", raw);
            assert!(out.for_llm.contains("invalid arguments"));
        }
    }

    #[tokio::test]
    async fn test_invoke_empty_arguments_are_empty_object() {
        let call = LLMToolCall::new("c1", "echo", "");
        let out = registry().invoke(&call, &ToolContext::new(), SECOND).await;
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn test_invoke_timeout() {
        let call = LLMToolCall::new("c1", "sleepy", "{}");
        let out = registry()
            .invoke(&call, &ToolContext::new(), Duration::from_millis(20))
            .await;
        assert!(out.is_error);
        assert!(out.for_llm.contains("timed out"));
    }
}
