//! Providers module - the completion service seam
//!
//! Defines the [`LLMProvider`] trait plus the [`RetryProvider`] decorator.
//! Concrete backends live outside this crate; they map HTTP failures with
//! [`parse_provider_error`] so retry decisions stay typed.
//!
//! # Example
//!
//! ```rust,ignore
//! use aisbot::providers::{ChatOptions, LLMProvider};
//! use aisbot::session::Message;
//!
//! async fn example(provider: &dyn LLMProvider) {
//!     let messages = vec![Message::user("Hello!")];
//!     let response = provider
//!         .chat(messages, vec![], None, ChatOptions::new().with_max_tokens(1000))
//!         .await
//!         .unwrap();
//!     println!("Response: {}", response.content);
//! }
//! ```

pub mod retry;
mod types;

use crate::error::ProviderError;

pub use retry::RetryProvider;
pub use types::{ChatOptions, LLMProvider, LLMResponse, LLMToolCall, ToolDefinition, Usage};

/// Map an HTTP status code and response body to a [`ProviderError`].
pub fn parse_provider_error(status: u16, body: &str) -> ProviderError {
    let lower = body.to_lowercase();
    match status {
        401 | 403 => ProviderError::Auth(body.to_string()),
        402 => ProviderError::Billing(body.to_string()),
        404 => ProviderError::ModelNotFound(body.to_string()),
        408 => ProviderError::Timeout(body.to_string()),
        429 => ProviderError::RateLimit(body.to_string()),
        400 => ProviderError::InvalidRequest(body.to_string()),
        529 => ProviderError::Overloaded(body.to_string()),
        500..=599 if lower.contains("overloaded") => ProviderError::Overloaded(body.to_string()),
        500..=599 => ProviderError::ServerError(body.to_string()),
        _ => ProviderError::Unknown(format!("HTTP {}: {}", status, body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider_error() {
        assert!(matches!(
            parse_provider_error(401, "bad key"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            parse_provider_error(429, "slow down"),
            ProviderError::RateLimit(_)
        ));
        assert!(matches!(
            parse_provider_error(503, "upstream down"),
            ProviderError::ServerError(_)
        ));
        assert!(matches!(
            parse_provider_error(503, "overloaded_error"),
            ProviderError::Overloaded(_)
        ));
        assert!(matches!(
            parse_provider_error(418, "teapot"),
            ProviderError::Unknown(_)
        ));
    }

    #[test]
    fn test_parsed_errors_retry_classification() {
        assert!(parse_provider_error(429, "").is_retryable());
        assert!(parse_provider_error(502, "").is_retryable());
        assert!(!parse_provider_error(400, "").is_retryable());
        assert!(!parse_provider_error(404, "").is_retryable());
    }
}
