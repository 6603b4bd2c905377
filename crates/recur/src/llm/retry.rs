use std::time::Duration;

use crate::error::Error;
use crate::llm::types::{CompletionRequest, CompletionResponse};

use super::LlmProvider;

/// Retry behavior for transient provider failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retry attempts (0 = only the initial call).
    pub max_retries: u32,
    /// Base delay for exponential backoff (doubled on each retry).
    pub base_delay: Duration,
    /// Delay cap.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Wraps any [`LlmProvider`] with retry + exponential backoff.
///
/// Retries rate limits (honoring a provider-supplied retry-after when
/// present), 5xx server errors, and network failures. Auth and 4xx client
/// errors fail immediately.
pub struct RetryingProvider<P> {
    inner: P,
    config: RetryConfig,
}

impl<P> RetryingProvider<P> {
    pub fn new(inner: P, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, RetryConfig::default())
    }
}

fn is_retryable(err: &Error) -> bool {
    match err {
        Error::RateLimited { .. } => true,
        Error::Api { status, .. } => matches!(*status, 500 | 502 | 503 | 529),
        Error::Http(_) => true,
        _ => false,
    }
}

/// Backoff delay for a given attempt; a rate-limit retry-after overrides
/// the exponential schedule.
fn compute_delay(config: &RetryConfig, attempt: u32, last_err: &Error) -> Duration {
    if let Error::RateLimited {
        retry_after_ms: Some(ms),
    } = last_err
    {
        return Duration::from_millis(*ms).min(config.max_delay);
    }
    let delay = config
        .base_delay
        .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    delay.min(config.max_delay)
}

impl<P: LlmProvider> LlmProvider for RetryingProvider<P> {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let err = last_err.as_ref().expect("last_err set before retry");
                let delay = compute_delay(&self.config, attempt - 1, err);
                tracing::warn!(
                    attempt,
                    max_retries = self.config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying LLM call after transient failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self.inner.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if is_retryable(&e) => {
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.expect("at least one attempt must have been made"))
    }

    async fn stream_complete(
        &self,
        request: CompletionRequest,
        on_text: &super::OnText,
    ) -> Result<CompletionResponse, Error> {
        // NOTE: on a mid-stream retry the callback restarts from the top of
        // the new response, so consumers may see duplicate deltas.
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let err = last_err.as_ref().expect("last_err set before retry");
                let delay = compute_delay(&self.config, attempt - 1, err);
                tokio::time::sleep(delay).await;
            }

            match self.inner.stream_complete(request.clone(), on_text).await {
                Ok(response) => return Ok(response),
                Err(e) if is_retryable(&e) => {
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.expect("at least one attempt must have been made"))
    }

    fn model_name(&self) -> Option<&str> {
        self.inner.model_name()
    }
}
