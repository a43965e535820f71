//! Agent module - the conversation engine
//!
//! This module turns inbound envelopes into replies. The agent is responsible
//! for:
//!
//! - Claiming inbound envelopes from the bus, one session at a time
//! - Building the model context: cached system prompt plus compressed history
//! - Calling the LLM provider and executing the tool calls it requests
//! - Persisting the session before the reply is published
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  MessageBus │────>│  AgentLoop  │────>│ LLMProvider │
//! │  (inbound)  │<────│             │     │             │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                      │     │     │
//!                      ▼     ▼     ▼
//!          ┌─────────────┐ ┌──────────────┐ ┌─────────────┐
//!          │   Session   │ │ContextBuilder│ │    Tools    │
//!          │   Manager   │ │ + compressor │ │  Registry   │
//!          └─────────────┘ └──────────────┘ └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use aisbot::agent::AgentLoop;
//! use aisbot::bus::MessageBus;
//! use aisbot::config::Config;
//! use aisbot::session::SessionManager;
//! use aisbot::tools::EchoTool;
//!
//! async fn run_agent(provider: Arc<dyn aisbot::providers::LLMProvider>) {
//!     let bus = Arc::new(MessageBus::new());
//!     let agent = Arc::new(AgentLoop::new(Config::default(), SessionManager::new_memory(), bus));
//!
//!     agent.set_provider(provider).await;
//!     agent.register_tool(Box::new(EchoTool)).await;
//!
//!     agent.start().await.unwrap();
//! }
//! ```

pub mod compression;
mod context;
mod r#loop;
pub mod prompt_cache;
pub mod token;

pub use compression::{CompressionStats, CompressionStrategy, ContextCompressor, SkipReason};
pub use context::{
    BuiltContext, ContextBuilder, RuntimeContext, SessionInfo, BOOTSTRAP_FILES, MEMORY_FILE,
};
pub use prompt_cache::SystemPromptCache;
pub use r#loop::{AgentLoop, LoopState, SYSTEM_CHANNEL};
pub use token::{estimate_message_tokens, estimate_messages_tokens, estimate_tokens};
