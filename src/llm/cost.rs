//! Token cost estimation for LLM usage.
//!
//! Rates are coarse per-provider figures (USD per million tokens) used for
//! the `TokenUsage` pipeline events; they are an operator aid, not a bill.

use std::sync::Mutex;

use crate::config::ProviderKind;

use super::client::TokenUsage;

/// Returns (input, output) USD rates per million tokens for a provider.
fn rates(provider: ProviderKind) -> (f64, f64) {
    match provider {
        ProviderKind::Claude => (3.0, 15.0),
        ProviderKind::OpenAi => (2.5, 10.0),
        ProviderKind::Gemini => (0.1, 0.4),
        ProviderKind::DeepSeek => (0.27, 1.1),
        ProviderKind::Qwen => (1.6, 6.4),
        ProviderKind::Kimi => (2.0, 5.0),
        // Local / self-hosted: no per-token cost.
        ProviderKind::Ollama => (0.0, 0.0),
        ProviderKind::RunPod => (0.0, 0.0),
    }
}

/// Estimates the cost of a single usage record in USD.
pub fn estimate_cost_usd(provider: ProviderKind, usage: TokenUsage) -> f64 {
    let (input_rate, output_rate) = rates(provider);
    (usage.prompt_tokens as f64 * input_rate + usage.completion_tokens as f64 * output_rate) / 1e6
}

/// Accumulates token usage across the phases of one pipeline run.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    total: Mutex<TokenUsage>,
}

impl UsageAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records usage from one LLM call.
    pub fn record(&self, usage: TokenUsage) {
        let mut total = self.total.lock().expect("usage lock poisoned");
        *total = total.add(usage);
    }

    /// Returns the accumulated total.
    pub fn total(&self) -> TokenUsage {
        *self.total.lock().expect("usage lock poisoned")
    }
}
