//! Provider-agnostic LLM client surface.
//!
//! Value types for conversations and completions plus the [`LlmClient`]
//! trait implemented by every provider transport.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// A message in a conversation with an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender ("system", "user", "assistant").
    pub role: String,
    /// Content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Request for a completion from an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier to use.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature (0.0 - 2.0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum number of tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    /// Create a new request with default parameters.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Set the temperature for this request.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the max tokens for this request.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token usage statistics for a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the prompt.
    pub prompt_tokens: u32,
    /// Number of tokens generated.
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Create a new usage record.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Total tokens used.
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Sum of two usage records.
    pub fn add(&self, other: TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
        }
    }
}

/// A finished completion.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The generated text.
    pub text: String,
    /// Token usage for the call.
    pub usage: TokenUsage,
}

/// One element of a streaming completion.
#[derive(Debug, Clone)]
pub enum CompletionChunk {
    /// A fragment of generated text.
    Text(String),
    /// The terminal element carrying token usage.
    Done(TokenUsage),
}

/// A stream of completion chunks ending in [`CompletionChunk::Done`].
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk, LlmError>> + Send>>;

/// Trait for LLM providers.
///
/// Implemented once per transport protocol family; the closed set of
/// providers is enumerated in [`crate::config::ProviderKind`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion and wait for the full response.
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;

    /// Generate a completion as a stream of text chunks.
    ///
    /// The stream yields [`CompletionChunk::Text`] fragments and terminates
    /// with exactly one [`CompletionChunk::Done`] carrying token usage.
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, LlmError>;
}

/// Collects a chunk stream into a full [`Completion`].
///
/// Used by callers that want streaming events surfaced but a single value
/// returned.
pub async fn collect_stream(mut stream: CompletionStream) -> Result<Completion, LlmError> {
    use futures::StreamExt;

    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            CompletionChunk::Text(t) => text.push_str(&t),
            CompletionChunk::Done(usage) => return Ok(Completion { text, usage }),
        }
    }
    Err(LlmError::StreamTruncated)
}
