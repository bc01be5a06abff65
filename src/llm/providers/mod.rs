//! Provider transport implementations.
//!
//! Each supported provider (see [`crate::config::ProviderKind`]) maps onto
//! one of three transport protocol families:
//!
//! - OpenAI-compatible chat completions with SSE streaming (openai,
//!   deepseek, qwen, kimi, ollama, runpod)
//! - the Anthropic messages API (claude)
//! - the Google generativelanguage API (gemini)

pub mod anthropic;
pub mod gemini;
pub mod openai_compat;

use std::sync::Arc;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use openai_compat::OpenAiCompatClient;

use crate::config::{AppConfig, ProviderKind};
use crate::error::LlmError;

use super::client::LlmClient;
use super::retry::RetryingClient;

/// Builds the transport for the configured provider, wrapped in the
/// transient-retry decorator.
pub fn build_client(config: &AppConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    let api_key = match &config.api_key {
        Some(key) => key.clone(),
        None if config.provider.requires_api_key() => {
            return Err(LlmError::MissingApiKey(config.provider.name().to_string()))
        }
        None => String::new(),
    };

    let inner: Arc<dyn LlmClient> = match config.provider {
        ProviderKind::Claude => Arc::new(AnthropicClient::new(api_key, config.base_url.clone())),
        ProviderKind::Gemini => Arc::new(GeminiClient::new(api_key, config.base_url.clone())),
        kind => Arc::new(OpenAiCompatClient::new(
            kind,
            api_key,
            config.base_url.clone(),
        )),
    };

    Ok(Arc::new(RetryingClient::new(inner)))
}

/// Splits a buffered SSE body into complete `data:` payloads.
///
/// Returns the extracted payloads and leaves any incomplete trailing event
/// in the buffer. Shared by the SSE-speaking transports.
pub(crate) fn drain_sse_events(buffer: &mut String) -> Vec<String> {
    let mut events = Vec::new();

    while let Some(boundary) = buffer.find("\n\n") {
        let raw_event: String = buffer.drain(..boundary + 2).collect();
        for line in raw_event.lines() {
            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim();
                if !payload.is_empty() {
                    events.push(payload.to_string());
                }
            }
        }
    }

    events
}

/// Maps an HTTP error status plus body into the [`LlmError`] taxonomy.
pub(crate) fn map_http_error(status: u16, body: String) -> LlmError {
    match status {
        401 | 403 | 402 => LlmError::AuthOrQuota {
            code: status,
            message: body,
        },
        429 => LlmError::RateLimited(body),
        400 | 404 | 422 => LlmError::BadRequest {
            code: status,
            message: body,
        },
        _ => LlmError::ApiError {
            code: status,
            message: body,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_sse_events() {
        let mut buffer = String::from(
            "data: {\"a\":1}\n\ndata: [DONE]\n\ndata: {\"partial\":",
        );
        let events = drain_sse_events(&mut buffer);

        assert_eq!(events, vec!["{\"a\":1}", "[DONE]"]);
        // Incomplete event stays buffered.
        assert_eq!(buffer, "data: {\"partial\":");
    }

    #[test]
    fn test_drain_sse_multiline_event() {
        let mut buffer = String::from("event: message\ndata: {\"b\":2}\n\n");
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events, vec!["{\"b\":2}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_map_http_error() {
        assert!(matches!(
            map_http_error(401, "k".into()),
            LlmError::AuthOrQuota { .. }
        ));
        assert!(matches!(
            map_http_error(429, "r".into()),
            LlmError::RateLimited(_)
        ));
        assert!(matches!(
            map_http_error(400, "b".into()),
            LlmError::BadRequest { .. }
        ));
        assert!(matches!(
            map_http_error(503, "s".into()),
            LlmError::ApiError { code: 503, .. }
        ));
    }

    #[test]
    fn test_build_client_requires_key() {
        let config = crate::config::AppConfig::default();
        assert!(matches!(
            build_client(&config),
            Err(LlmError::MissingApiKey(_))
        ));

        let config = config.with_provider(crate::config::ProviderKind::Ollama);
        assert!(build_client(&config).is_ok());
    }
}
