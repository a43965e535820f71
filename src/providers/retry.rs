//! Retry provider - decorator adding per-attempt deadlines and exponential
//! backoff to any [`LLMProvider`].
//!
//! The agent loop wraps its provider in a [`RetryProvider`] built from
//! `agents.defaults`, so every completion call is bounded and transient
//! failures (429, 5xx, overload, timeouts) are retried.
//!
//! ```rust,ignore
//! let provider = RetryProvider::new(inner)
//!     .with_max_retries(2)
//!     .with_timeout(Duration::from_secs(120));
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::AgentDefaults;
use crate::error::{AisbotError, ProviderError, Result};
use crate::session::Message;

use super::{ChatOptions, LLMProvider, LLMResponse, ToolDefinition};

/// Substrings of untyped provider errors that indicate a transient failure.
const RETRYABLE_PATTERNS: &[&str] = &[
    "429",
    "500",
    "502",
    "503",
    "504",
    "rate limit",
    "rate_limit",
    "overloaded",
    "too many requests",
    "server error",
    "service unavailable",
    "gateway timeout",
    "timed out",
];

/// Decorator that bounds and retries completion calls.
pub struct RetryProvider {
    inner: Arc<dyn LLMProvider>,
    /// Retries after the first attempt
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    /// Deadline for a single attempt
    timeout: Duration,
}

impl std::fmt::Debug for RetryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryProvider")
            .field("inner", &self.inner.name())
            .field("max_retries", &self.max_retries)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RetryProvider {
    /// Wrap `inner` with defaults: 2 retries, 1s base delay, 30s cap, 120s
    /// per-attempt timeout.
    pub fn new(inner: Arc<dyn LLMProvider>) -> Self {
        Self {
            inner,
            max_retries: 2,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            timeout: Duration::from_secs(120),
        }
    }

    /// Wrap `inner` using the retry settings of `defaults`.
    pub fn from_defaults(inner: Arc<dyn LLMProvider>, defaults: &AgentDefaults) -> Self {
        Self::new(inner)
            .with_max_retries(defaults.provider_retries)
            .with_base_delay_ms(defaults.retry_base_delay_ms)
            .with_max_delay_ms(defaults.retry_max_delay_ms)
            .with_timeout(Duration::from_secs(defaults.provider_timeout_secs))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Check whether an error is a transient failure worth retrying.
///
/// Typed provider errors use [`ProviderError::is_retryable`]; timeouts are
/// always retryable; untyped provider errors fall back to substring matching
/// with 400/401/403/404 excluded.
pub fn is_retryable(err: &AisbotError) -> bool {
    match err {
        AisbotError::ProviderTyped(pe) => pe.is_retryable(),
        AisbotError::Timeout(_) => true,
        AisbotError::Provider(_) => {
            let msg = err.to_string().to_lowercase();
            if ["400", "401", "403", "404"]
                .iter()
                .any(|p| msg.contains(p))
            {
                return false;
            }
            RETRYABLE_PATTERNS.iter().any(|p| msg.contains(p))
        }
        _ => false,
    }
}

/// Backoff delay for a retry attempt (0-indexed), without sleeping.
///
/// `min(base_delay_ms * 2^attempt + jitter_ms, max_delay_ms)`
pub fn compute_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_ms: u64) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(16));
    exponential.saturating_add(jitter_ms).min(max_delay_ms)
}

/// Sleep for the backoff delay of `attempt`.
///
/// Jitter comes from the sub-second nanos of the wall clock, which is enough
/// to decorrelate concurrent sessions.
pub async fn delay_with_jitter(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) {
    let jitter_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()) % base_delay_ms.max(1))
        .unwrap_or(0);
    let delay = compute_delay(attempt, base_delay_ms, max_delay_ms, jitter_ms);
    tokio::time::sleep(Duration::from_millis(delay)).await;
}

#[async_trait]
impl LLMProvider for RetryProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        model: Option<&str>,
        options: ChatOptions,
    ) -> Result<LLMResponse> {
        let mut attempt = 0;
        loop {
            let call = self
                .inner
                .chat(messages.clone(), tools.clone(), model, options.clone());
            let err = match tokio::time::timeout(self.timeout, call).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) => err,
                Err(_) => AisbotError::ProviderTyped(ProviderError::Timeout(format!(
                    "no response within {}s",
                    self.timeout.as_secs_f64()
                ))),
            };

            if attempt >= self.max_retries || !is_retryable(&err) {
                return Err(err);
            }

            warn!(
                provider = self.inner.name(),
                attempt = attempt + 1,
                max_retries = self.max_retries,
                error = %err,
                "Retrying chat request after transient error"
            );
            delay_with_jitter(attempt, self.base_delay_ms, self.max_delay_ms).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times with the given error factory, then succeeds.
    struct FlakyProvider {
        failures: u32,
        calls: AtomicU32,
        make_err: fn() -> AisbotError,
    }

    #[async_trait]
    impl LLMProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        fn default_model(&self) -> &str {
            "flaky-model"
        }

        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err((self.make_err)())
            } else {
                Ok(LLMResponse::text("ok"))
            }
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl LLMProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        fn default_model(&self) -> &str {
            "slow-model"
        }

        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(LLMResponse::text("late"))
        }
    }

    fn flaky(failures: u32, make_err: fn() -> AisbotError) -> Arc<FlakyProvider> {
        Arc::new(FlakyProvider {
            failures,
            calls: AtomicU32::new(0),
            make_err,
        })
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&AisbotError::ProviderTyped(
            ProviderError::RateLimit("slow down".into())
        )));
        assert!(!is_retryable(&AisbotError::ProviderTyped(
            ProviderError::Auth("bad key".into())
        )));
        assert!(is_retryable(&AisbotError::Provider(
            "HTTP 503 Service Unavailable".into()
        )));
        assert!(!is_retryable(&AisbotError::Provider(
            "HTTP 400 server error in request".into()
        )));
        assert!(is_retryable(&AisbotError::Timeout("x".into())));
        assert!(!is_retryable(&AisbotError::Tool("x".into())));
    }

    #[test]
    fn test_compute_delay() {
        assert_eq!(compute_delay(0, 100, 10_000, 0), 100);
        assert_eq!(compute_delay(3, 100, 10_000, 7), 807);
        assert_eq!(compute_delay(20, 100, 10_000, 0), 10_000);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let inner = flaky(2, || ProviderError::ServerError("boom".into()).into());
        let provider = RetryProvider::new(inner.clone())
            .with_max_retries(2)
            .with_base_delay_ms(1)
            .with_max_delay_ms(2);
        let response = provider
            .chat(vec![], vec![], None, ChatOptions::new())
            .await
            .unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let inner = flaky(5, || ProviderError::RateLimit("429".into()).into());
        let provider = RetryProvider::new(inner.clone())
            .with_max_retries(1)
            .with_base_delay_ms(1)
            .with_max_delay_ms(2);
        assert!(provider
            .chat(vec![], vec![], None, ChatOptions::new())
            .await
            .is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let inner = flaky(5, || ProviderError::Auth("401".into()).into());
        let provider = RetryProvider::new(inner.clone()).with_base_delay_ms(1);
        assert!(provider
            .chat(vec![], vec![], None, ChatOptions::new())
            .await
            .is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let provider = RetryProvider::new(Arc::new(SlowProvider))
            .with_max_retries(0)
            .with_timeout(Duration::from_millis(20));
        let err = provider
            .chat(vec![], vec![], None, ChatOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AisbotError::ProviderTyped(ProviderError::Timeout(_))
        ));
    }

    #[test]
    fn test_from_defaults() {
        let defaults = AgentDefaults {
            provider_retries: 4,
            provider_timeout_secs: 7,
            ..AgentDefaults::default()
        };
        let provider = RetryProvider::from_defaults(flaky(0, || AisbotError::Tool("x".into())), &defaults);
        assert_eq!(provider.max_retries, 4);
        assert_eq!(provider.timeout, Duration::from_secs(7));
    }
}
