//! Aisbot - core of a multi-channel personal AI assistant
//!
//! Channels publish inbound [`Envelope`]s on a durable [`MessageBus`]; the
//! [`AgentLoop`] claims them one session at a time, runs the model/tool cycle
//! over a compressed context and publishes the reply as an outbound envelope.

pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod providers;
pub mod session;
pub mod tools;
pub mod utils;

pub use agent::{AgentLoop, ContextBuilder, LoopState};
pub use bus::{DeliveryState, Direction, Envelope, MediaAttachment, MediaType, MessageBus};
pub use config::Config;
pub use error::{AisbotError, ErrorClass, Result};
pub use providers::{ChatOptions, LLMProvider, LLMResponse, LLMToolCall, ToolDefinition, Usage};
pub use session::{Message, Role, Session, SessionManager, ToolCall};
