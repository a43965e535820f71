//! Error types for Aisbot
//!
//! This module defines all error types used throughout the crate. Uses
//! `thiserror` for `Display`/`Error` derives and adds a coarse
//! [`ErrorClass`] so the agent loop can decide which failures stay inside a
//! cycle and which escape to the bus.

use std::fmt;
use thiserror::Error;

// ============================================================================
// Provider Error Classification
// ============================================================================

/// Structured provider error classification.
///
/// Lets retry decisions in the agent loop work without string matching.
#[derive(Debug)]
pub enum ProviderError {
    /// 401: invalid API key or authentication failure
    Auth(String),
    /// 429: rate limit or quota exceeded
    RateLimit(String),
    /// 402: payment required
    Billing(String),
    /// 500/502/503/504
    ServerError(String),
    /// 400: malformed request or parameters
    InvalidRequest(String),
    /// 404: model or endpoint not available
    ModelNotFound(String),
    /// Connection or read timeout
    Timeout(String),
    /// Provider is overloaded, retry with backoff
    Overloaded(String),
    /// Catch-all for unrecognized errors
    Unknown(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            ProviderError::RateLimit(msg) => write!(f, "Rate limit error: {}", msg),
            ProviderError::Billing(msg) => write!(f, "Billing error: {}", msg),
            ProviderError::ServerError(msg) => write!(f, "Server error: {}", msg),
            ProviderError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            ProviderError::ModelNotFound(msg) => write!(f, "Model not found: {}", msg),
            ProviderError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            ProviderError::Overloaded(msg) => write!(f, "Overloaded error: {}", msg),
            ProviderError::Unknown(msg) => write!(f, "Unknown provider error: {}", msg),
        }
    }
}

impl ProviderError {
    /// Returns `true` if the request should be retried.
    ///
    /// Retryable: RateLimit, ServerError, Timeout, Overloaded.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit(_)
                | ProviderError::ServerError(_)
                | ProviderError::Timeout(_)
                | ProviderError::Overloaded(_)
        )
    }

    /// Returns `true` if another provider might succeed where this one failed.
    ///
    /// Malformed requests fail everywhere, so they never fall back.
    pub fn should_fallback(&self) -> bool {
        !matches!(self, ProviderError::InvalidRequest(_))
    }

    /// Returns the HTTP status code associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProviderError::Auth(_) => Some(401),
            ProviderError::RateLimit(_) => Some(429),
            ProviderError::Billing(_) => Some(402),
            ProviderError::ServerError(_) => Some(500),
            ProviderError::InvalidRequest(_) => Some(400),
            ProviderError::ModelNotFound(_) => Some(404),
            ProviderError::Overloaded(_) => Some(503),
            ProviderError::Timeout(_) | ProviderError::Unknown(_) => None,
        }
    }
}

impl From<ProviderError> for AisbotError {
    fn from(err: ProviderError) -> Self {
        AisbotError::ProviderTyped(err)
    }
}

// ============================================================================
// Error Classes
// ============================================================================

/// Coarse failure taxonomy used by the agent loop.
///
/// Transient and structural failures are absorbed into the conversation
/// (retried, or fed back to the model as a tool error). Durability and fatal
/// failures escape the cycle so the inbound envelope is not acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, rate limits, flaky backends.
    Transient,
    /// Malformed tool arguments, unknown tools, bad payloads.
    Structural,
    /// Token budget or concurrency limits.
    Capacity,
    /// Journal or session persistence failed.
    Durability,
    /// Invalid configuration or broken invariants.
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Structural => "structural",
            ErrorClass::Capacity => "capacity",
            ErrorClass::Durability => "durability",
            ErrorClass::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for Aisbot operations.
#[derive(Error, Debug)]
pub enum AisbotError {
    /// Invalid config, missing required fields, etc.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Untyped provider failure.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Structured provider error with classification for retry decisions.
    #[error("Provider error: {0}")]
    ProviderTyped(ProviderError),

    /// Tool execution errors (invalid parameters, execution failures, etc.)
    #[error("Tool error: {0}")]
    Tool(String),

    /// Session persistence failures.
    #[error("Session error: {0}")]
    Session(String),

    /// Queue journal failures.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Context does not fit and cannot be reduced further.
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Message bus has been closed.
    #[error("Bus error: channel closed")]
    BusClosed,

    /// Resource not found (envelopes, sessions, tools, etc.)
    #[error("Not found: {0}")]
    NotFound(String),

    /// An external call exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Broken invariant that must not be absorbed.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AisbotError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            AisbotError::Provider(_) | AisbotError::ProviderTyped(_) | AisbotError::Timeout(_) => {
                ErrorClass::Transient
            }
            AisbotError::Tool(_) | AisbotError::NotFound(_) | AisbotError::Json(_) => {
                ErrorClass::Structural
            }
            AisbotError::Capacity(_) => ErrorClass::Capacity,
            AisbotError::Storage(_)
            | AisbotError::Session(_)
            | AisbotError::Io(_)
            | AisbotError::BusClosed => ErrorClass::Durability,
            AisbotError::Config(_) | AisbotError::Fatal(_) => ErrorClass::Fatal,
        }
    }

    /// Whether this error must leave the agent cycle instead of being turned
    /// into a reply.
    pub fn escapes_cycle(&self) -> bool {
        matches!(self.class(), ErrorClass::Durability | ErrorClass::Fatal)
    }
}

/// A specialized `Result` type for Aisbot operations.
pub type Result<T> = std::result::Result<T, AisbotError>;
