//! Transient-error retry wrapper for LLM clients.
//!
//! Wraps any [`LlmClient`] and retries transient failures (network errors,
//! 5xx responses, rate limits) with exponential backoff. Fatal errors
//! (auth, quota, bad request) pass through immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LlmError;

use super::client::{Completion, CompletionRequest, CompletionStream, LlmClient};

/// Maximum transient retries before surfacing the error.
const MAX_RETRIES: u32 = 3;
/// Base backoff delay.
const BASE_DELAY: Duration = Duration::from_millis(500);
/// Backoff cap.
const MAX_DELAY: Duration = Duration::from_secs(8);

/// An [`LlmClient`] decorator that retries transient failures.
pub struct RetryingClient {
    inner: Arc<dyn LlmClient>,
}

impl RetryingClient {
    /// Wraps a client with the default retry policy.
    pub fn new(inner: Arc<dyn LlmClient>) -> Self {
        Self { inner }
    }

    /// Backoff delay before the given retry (0-indexed).
    fn backoff(retry: u32) -> Duration {
        let delay = BASE_DELAY.saturating_mul(2u32.saturating_pow(retry));
        delay.min(MAX_DELAY)
    }
}

#[async_trait]
impl LlmClient for RetryingClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let mut last_error = None;

        for retry in 0..=MAX_RETRIES {
            if retry > 0 {
                let delay = Self::backoff(retry - 1);
                tracing::warn!(
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying LLM completion after transient error"
                );
                tokio::time::sleep(delay).await;
            }

            match self.inner.complete(request.clone()).await {
                Ok(completion) => return Ok(completion),
                Err(e) if e.is_transient() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.expect("at least one transient error recorded"))
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, LlmError> {
        // Retries apply to stream establishment only; a stream that dies
        // mid-flight surfaces to the caller, which owns the attempt budget.
        let mut last_error = None;

        for retry in 0..=MAX_RETRIES {
            if retry > 0 {
                let delay = Self::backoff(retry - 1);
                tracing::warn!(
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying LLM stream open after transient error"
                );
                tokio::time::sleep(delay).await;
            }

            match self.inner.stream(request.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_transient() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.expect("at least one transient error recorded"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::{ChatMessage, CompletionChunk, TokenUsage};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Client that fails transiently `failures` times, then succeeds.
    struct FlakyClient {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyClient {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(LlmError::RequestFailed("connection reset".into()))
            } else {
                Ok(Completion {
                    text: "ok".to_string(),
                    usage: TokenUsage::new(1, 1),
                })
            }
        }

        async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, LlmError> {
            let completion = self.complete(request).await?;
            let chunks = vec![
                Ok(CompletionChunk::Text(completion.text)),
                Ok(CompletionChunk::Done(completion.usage)),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    /// Client that always fails with a fatal error.
    struct FatalClient {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for FatalClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::AuthOrQuota {
                code: 401,
                message: "bad key".into(),
            })
        }

        async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, LlmError> {
            self.complete(request).await?;
            unreachable!()
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("test", vec![ChatMessage::user("hi")])
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(RetryingClient::backoff(0), Duration::from_millis(500));
        assert_eq!(RetryingClient::backoff(1), Duration::from_secs(1));
        assert_eq!(RetryingClient::backoff(2), Duration::from_secs(2));
        // Capped at 8 s.
        assert_eq!(RetryingClient::backoff(10), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried() {
        let inner = Arc::new(FlakyClient::new(2));
        let client = RetryingClient::new(inner.clone());

        let completion = client.complete(request()).await.unwrap();
        assert_eq!(completion.text, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_last_error() {
        let inner = Arc::new(FlakyClient::new(100));
        let client = RetryingClient::new(inner.clone());

        let result = client.complete(request()).await;
        assert!(matches!(result, Err(LlmError::RequestFailed(_))));
        // Initial call plus MAX_RETRIES.
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1 + MAX_RETRIES);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let inner = Arc::new(FatalClient {
            calls: AtomicU32::new(0),
        });
        let client = RetryingClient::new(inner.clone());

        let result = client.complete(request()).await;
        assert!(matches!(result, Err(LlmError::AuthOrQuota { .. })));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
