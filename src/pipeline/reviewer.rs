//! Post-execution compliance review.
//!
//! An advisory LLM check of the final code against the user request and
//! the plan. The reviewer approves code that achieves the intent even when
//! its operation choices differ from the plan.

use std::sync::Arc;

use serde::Deserialize;

use crate::error::{LlmError, PipelineError};
use crate::llm::{ChatMessage, CompletionRequest, LlmClient, TokenUsage};
use crate::plan::Plan;

/// System prompt for the review call.
const REVIEW_SYSTEM_PROMPT: &str = r#"You are a CAD code reviewer checking a finished CadQuery script against the
user's request and the design plan that produced it.

Check:
1. Every planned feature is named or structurally present in the code.
2. Declared dimensions appear in the code exactly as planned.
3. The operation sequence in the code is order-compatible with the plan.

Approve when the code achieves the user's intent, even if it reaches it with
different operation choices than the plan. Reject only for missing features,
wrong dimensions or order violations that change the geometry.

You MUST respond with ONLY a JSON object in this exact format:
{
  "approved": <true or false>,
  "issues": ["<issue>", ...]
}

Do not include any text outside the JSON object."#;

/// User prompt template for the review call.
const REVIEW_USER_TEMPLATE: &str = r#"User request:
{request}

Design plan:
{plan}

Final code:
```python
{code}
```

Review the code against the request and plan."#;

/// Verdict of a review.
#[derive(Debug, Clone)]
pub struct ReviewReport {
    /// Whether the code passes review.
    pub approved: bool,
    /// Issues found, empty when approved cleanly.
    pub issues: Vec<String>,
}

/// The post-execution reviewer.
pub struct Reviewer {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl Reviewer {
    /// Creates a reviewer.
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Reviews final code against the request and plan.
    pub async fn review(
        &self,
        request_text: &str,
        plan: &Plan,
        code: &str,
    ) -> Result<(ReviewReport, TokenUsage), PipelineError> {
        let user = REVIEW_USER_TEMPLATE
            .replace("{request}", request_text)
            .replace("{plan}", plan.text())
            .replace("{code}", code);

        let request = CompletionRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(REVIEW_SYSTEM_PROMPT),
                ChatMessage::user(user),
            ],
        )
        .with_temperature(0.1)
        .with_max_tokens(1000);

        let completion = self.llm.complete(request).await?;
        let report = parse_review(&completion.text)
            .map_err(|e| PipelineError::Provider(LlmError::ParseError(e)))?;

        Ok((report, completion.usage))
    }
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    approved: bool,
    #[serde(default)]
    issues: Vec<String>,
}

/// Parses the review JSON, tolerating markdown fences around it.
fn parse_review(content: &str) -> Result<ReviewReport, String> {
    let json = extract_json(content).ok_or_else(|| "no JSON in review response".to_string())?;
    let parsed: ReviewResponse =
        serde_json::from_str(&json).map_err(|e| format!("invalid review JSON: {}", e))?;
    Ok(ReviewReport {
        approved: parsed.approved,
        issues: parsed.issues,
    })
}

/// Extracts a JSON object from the response, handling code fences.
fn extract_json(content: &str) -> Option<String> {
    let trimmed = content.trim();

    if trimmed.starts_with('{') {
        return Some(trimmed.to_string());
    }

    if let Some(start) = trimmed.find("```json") {
        let json_start = start + 7;
        if let Some(end) = trimmed[json_start..].find("```") {
            return Some(trimmed[json_start..json_start + end].trim().to_string());
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| trimmed[start..=end].to_string())
}
