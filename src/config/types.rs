//! Configuration types for Aisbot
//!
//! Every struct uses `#[serde(default)]` so a partial `config.json` only
//! overrides the fields it names.

use serde::{Deserialize, Serialize};

/// Compile-time default model. Override at build time with
/// `AISBOT_DEFAULT_MODEL=...`.
pub const COMPILE_TIME_DEFAULT_MODEL: &str = match option_env!("AISBOT_DEFAULT_MODEL") {
    Some(model) => model,
    None => "claude-sonnet-4-5-20250929",
};

/// Main configuration struct.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Agent configuration
    pub agents: AgentConfig,
    /// Context compression configuration
    pub compression: CompressionConfig,
    /// Message bus configuration
    pub bus: BusConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

// ============================================================================
// Agent Configuration
// ============================================================================

/// Agent configuration container.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Default agent settings
    pub defaults: AgentDefaults,
}

/// Default settings for the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefaults {
    /// Workspace directory handed to tools
    pub workspace: String,
    /// Model passed to the completion service
    pub model: String,
    /// Maximum tokens per completion
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum model/tool round trips per cycle
    pub max_tool_iterations: u32,
    /// Deadline for a single tool call
    pub tool_timeout_secs: u64,
    /// Deadline for a single completion attempt
    pub provider_timeout_secs: u64,
    /// Retries after the first failed completion attempt
    pub provider_retries: u32,
    /// Base delay for exponential backoff between retries
    pub retry_base_delay_ms: u64,
    /// Backoff cap
    pub retry_max_delay_ms: u64,
    /// Cycles allowed to run at once across all sessions
    pub max_concurrent_sessions: usize,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.aisbot/workspace".to_string(),
            model: COMPILE_TIME_DEFAULT_MODEL.to_string(),
            max_tokens: 8192,
            temperature: 0.7,
            max_tool_iterations: 20,
            tool_timeout_secs: 60,
            provider_timeout_secs: 120,
            provider_retries: 2,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            max_concurrent_sessions: 8,
        }
    }
}

// ============================================================================
// Compression Configuration
// ============================================================================

/// Which compression strategy reduces the older part of a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Sentence-boundary shortening, then oldest-first drops
    Truncation,
    /// Section salience scoring, then lowest-salience drops
    #[default]
    Semantic,
    /// One model call condensing the older segment
    Summary,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Truncation => write!(f, "truncation"),
            StrategyKind::Semantic => write!(f, "semantic"),
            StrategyKind::Summary => write!(f, "summary"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "truncation" => Ok(StrategyKind::Truncation),
            "semantic" => Ok(StrategyKind::Semantic),
            "summary" => Ok(StrategyKind::Summary),
            other => Err(format!("unknown compression strategy '{}'", other)),
        }
    }
}

/// Token budget and compression behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Turn compression off entirely
    pub enabled: bool,
    /// Compression triggers once the estimated context exceeds this
    pub max_context_tokens: usize,
    /// Compression aims for this many tokens
    pub target_context_tokens: usize,
    /// Trailing messages that are never rewritten
    pub recent_messages_keep: usize,
    /// Strategy applied to the older segment
    pub strategy: StrategyKind,
    /// Messages shorter than this (chars) are never rewritten
    pub min_content_length: usize,
    /// Reuse rendered system prompts keyed by content hash
    pub preserve_system_prompt_cache: bool,
    /// Tool results at least this long (chars) are compressed before entering history
    pub tool_result_threshold: usize,
    /// Rendered prompts kept in the cache
    pub prompt_cache_capacity: usize,
    /// Deadline for the summary strategy's model call
    pub summary_timeout_secs: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_context_tokens: 16_000,
            target_context_tokens: 12_000,
            recent_messages_keep: 10,
            strategy: StrategyKind::Semantic,
            min_content_length: 200,
            preserve_system_prompt_cache: true,
            tool_result_threshold: 1000,
            prompt_cache_capacity: 64,
            summary_timeout_secs: 30,
        }
    }
}

// ============================================================================
// Bus Configuration
// ============================================================================

/// Durable message bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Journal path; `None` means `~/.aisbot/bus/queue.jsonl`
    pub storage_path: Option<String>,
    /// Claimed envelopes older than this are redelivered by the sweeper
    pub visibility_timeout_secs: u64,
    /// Deliveries before an envelope is dead-lettered
    pub max_retries: u32,
    /// How often the sweeper runs
    pub sweep_interval_secs: u64,
    /// `sync_data` after every journal append
    pub fsync: bool,
    /// Completed envelopes kept across compaction for duplicate detection
    pub done_retention: usize,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            visibility_timeout_secs: 300,
            max_retries: 3,
            sweep_interval_secs: 30,
            fsync: false,
            done_retention: 1000,
            event_buffer: 256,
        }
    }
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output
    Pretty,
    /// Compact single-line output with a `component` field
    #[default]
    Component,
    /// JSON lines
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Optional log file (JSON format only)
    pub file: Option<String>,
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Component,
            file: None,
            level: "info".to_string(),
        }
    }
}
