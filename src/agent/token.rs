//! Token estimation.
//!
//! A chars/4 heuristic, not a tokenizer. Good enough for budget decisions;
//! every budget in the crate is expressed in these estimated tokens.

use crate::providers::ToolDefinition;
use crate::session::Message;

/// Fixed per-message overhead for role and framing.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Estimated tokens of a piece of text: `ceil(chars / 4)`, 0 for empty text.
///
/// ```
/// use aisbot::agent::token::estimate_tokens;
///
/// assert_eq!(estimate_tokens(""), 0);
/// assert_eq!(estimate_tokens("abcd"), 1);
/// assert_eq!(estimate_tokens("abcde"), 2);
/// ```
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Estimated tokens of one message including overhead and tool calls.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut tokens = MESSAGE_OVERHEAD_TOKENS + estimate_tokens(&message.content);
    if let Some(calls) = &message.tool_calls {
        for call in calls {
            tokens += estimate_tokens(&call.name) + estimate_tokens(&call.arguments);
        }
    }
    if let Some(id) = &message.tool_call_id {
        tokens += estimate_tokens(id);
    }
    tokens
}

/// Estimated tokens of a message sequence.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Estimated tokens of one tool definition as sent to the model.
pub fn estimate_tool_tokens(tool: &ToolDefinition) -> usize {
    estimate_tokens(&tool.name)
        + estimate_tokens(&tool.description)
        + estimate_tokens(&tool.parameters.to_string())
}

/// Estimated tokens of all tool definitions.
pub fn estimate_tools_tokens(tools: &[ToolDefinition]) -> usize {
    tools.iter().map(estimate_tool_tokens).sum()
}
