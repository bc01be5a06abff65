//! Plan authorship via the LLM.

use std::sync::Arc;

use crate::error::PlanError;
use crate::llm::{ChatMessage, Completion, CompletionRequest, LlmClient, TokenUsage};
use crate::rules::RuleSet;

use super::Plan;

/// System prompt for plan authorship.
const PLAN_SYSTEM_PROMPT: &str = r#"You are a senior CAD engineer decomposing a part request into a build plan for CadQuery.

Write a plan with exactly these sections:

## Object Analysis
What the object is, its key features and critical dimensions.

## Approach
The modeling strategy in two or three sentences.

## Build Plan
A numbered list of build steps. Each step is one sentence, starts with a verb,
and names exactly one CAD operation (base shape, extrude, revolve, loft, sweep,
shell, fillet, chamfer, union, subtract, intersect, pattern, hole).

## Approximation Notes
Features intentionally simplified or omitted, and why.

Rules:
- State every dimension explicitly with units.
- Prefer simple operations: a box and a hole beat a loft.
- Put the base shape first, features next, booleans after, fillets last.
- Never plan more steps than the part needs.

Output only the plan text. No code."#;

/// User prompt template for a re-plan after rejection.
const REPLAN_USER_TEMPLATE: &str = r#"Your previous plan for this request was rejected by a deterministic validator.

Request:
{request}

Rejected plan:
{plan}

Rejection feedback:
{feedback}

Write a new plan that resolves the feedback. Reduce risk: fewer steps, simpler
operations, smaller fillets. Keep the same section structure."#;

/// Configuration for the planner.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Temperature for plan generation.
    pub temperature: f64,
    /// Maximum tokens for the plan.
    pub max_tokens: u32,
    /// Model identifier.
    pub model: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.4,
            max_tokens: 2000,
            model: String::new(),
        }
    }
}

impl PlannerConfig {
    /// Sets the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }
}

/// Produces design plans from user requests.
pub struct Planner {
    client: Arc<dyn LlmClient>,
    config: PlannerConfig,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Planner {
    /// Creates a new planner.
    pub fn new(client: Arc<dyn LlmClient>, config: PlannerConfig) -> Self {
        Self { client, config }
    }

    /// Produces a plan for a request.
    pub async fn create_plan(
        &self,
        request_text: &str,
        rules: &RuleSet,
    ) -> Result<(Plan, TokenUsage), PlanError> {
        let request = CompletionRequest::new(
            self.config.model.clone(),
            vec![
                ChatMessage::system(self.system_prompt(rules)),
                ChatMessage::user(request_text.to_string()),
            ],
        )
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens);

        let completion = self.client.complete(request).await?;
        self.into_plan(completion)
    }

    /// Produces a revised plan after a validator rejection.
    pub async fn revise_plan(
        &self,
        request_text: &str,
        rules: &RuleSet,
        rejected: &Plan,
        feedback: &str,
    ) -> Result<(Plan, TokenUsage), PlanError> {
        let user = REPLAN_USER_TEMPLATE
            .replace("{request}", request_text)
            .replace("{plan}", rejected.text())
            .replace("{feedback}", feedback);

        let request = CompletionRequest::new(
            self.config.model.clone(),
            vec![
                ChatMessage::system(self.system_prompt(rules)),
                ChatMessage::user(user),
            ],
        )
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens);

        let completion = self.client.complete(request).await?;
        self.into_plan(completion)
    }

    /// Assembles the planning system prompt from the rule set.
    fn system_prompt(&self, rules: &RuleSet) -> String {
        let mut sections = vec![PLAN_SYSTEM_PROMPT.to_string()];

        for (label, body) in [
            ("Manufacturing constraints", &rules.manufacturing),
            ("Dimension guidance", &rules.dimension_guidance),
            ("Known failure modes to avoid", &rules.failure_prevention),
        ] {
            if !body.is_empty() {
                sections.push(format!("# {}\n\n{}", label, body));
            }
        }

        sections.join("\n\n")
    }

    fn into_plan(&self, completion: Completion) -> Result<(Plan, TokenUsage), PlanError> {
        let plan = Plan::new(completion.text.trim().to_string());
        if plan.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        Ok((plan, completion.usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionChunk, CompletionStream};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockLlm {
        response: Mutex<String>,
        last_request: Mutex<Option<CompletionRequest>>,
    }

    impl MockLlm {
        fn new(response: &str) -> Self {
            Self {
                response: Mutex::new(response.to_string()),
                last_request: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
            *self.last_request.lock().unwrap() = Some(request);
            Ok(Completion {
                text: self.response.lock().unwrap().clone(),
                usage: TokenUsage::new(100, 40),
            })
        }

        async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, LlmError> {
            let completion = self.complete(request).await?;
            Ok(Box::pin(futures::stream::iter(vec![
                Ok(CompletionChunk::Text(completion.text)),
                Ok(CompletionChunk::Done(completion.usage)),
            ])))
        }
    }

    fn rules_with_context() -> RuleSet {
        RuleSet {
            manufacturing: "Minimum wall 0.8 mm.".to_string(),
            failure_prevention: "Never fillet before booleans.".to_string(),
            ..RuleSet::default()
        }
    }

    #[tokio::test]
    async fn test_create_plan() {
        let client = Arc::new(MockLlm::new(
            "## Object Analysis\nA cube.\n\n## Build Plan\n1. Create a 20 mm base cube",
        ));
        let planner = Planner::new(client.clone(), PlannerConfig::default());

        let (plan, usage) = planner
            .create_plan("a 20 mm cube", &rules_with_context())
            .await
            .unwrap();

        assert!(plan.text().contains("20 mm"));
        assert_eq!(usage.prompt_tokens, 100);

        let request = client.last_request.lock().unwrap().clone().unwrap();
        let system = &request.messages[0];
        assert_eq!(system.role, "system");
        assert!(system.content.contains("Minimum wall"));
        assert!(system.content.contains("Never fillet before booleans"));
    }

    #[tokio::test]
    async fn test_empty_plan_is_error() {
        let client = Arc::new(MockLlm::new("   "));
        let planner = Planner::new(client, PlannerConfig::default());

        let result = planner.create_plan("a cube", &RuleSet::default()).await;
        assert!(matches!(result, Err(PlanError::EmptyPlan)));
    }

    #[tokio::test]
    async fn test_revise_plan_includes_feedback() {
        let client = Arc::new(MockLlm::new("## Build Plan\n1. Create a base box"));
        let planner = Planner::new(client.clone(), PlannerConfig::default());

        let rejected = Plan::new("## Build Plan\n1. Shell everything");
        planner
            .revise_plan(
                "a phone case",
                &RuleSet::default(),
                &rejected,
                "risk score 9 exceeds threshold 7",
            )
            .await
            .unwrap();

        let request = client.last_request.lock().unwrap().clone().unwrap();
        let user = &request.messages[1];
        assert!(user.content.contains("risk score 9"));
        assert!(user.content.contains("Shell everything"));
        assert!(user.content.contains("phone case"));
    }
}
