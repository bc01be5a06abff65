//! LLM integration for cad-forge.
//!
//! This module provides the provider-agnostic client surface used by every
//! pipeline phase: value types for chat messages and completions, the
//! [`LlmClient`] trait with blocking and streaming operations, transparent
//! transient-error retry, token cost estimation, and one transport
//! implementation per provider protocol family.

pub mod client;
pub mod cost;
pub mod providers;
pub mod retry;

pub use client::{
    ChatMessage, Completion, CompletionChunk, CompletionRequest, CompletionStream, LlmClient,
    TokenUsage,
};
pub use cost::{estimate_cost_usd, UsageAccumulator};
pub use providers::{build_client, AnthropicClient, GeminiClient, OpenAiCompatClient};
pub use retry::RetryingClient;
