//! Iterative build mode.
//!
//! Complex plans are executed step by step: each build step is generated
//! against the accumulated working code, executed with its own retry
//! budget, and either committed or skipped. A skipped step never
//! contaminates later steps; once a step succeeds its code is
//! prefix-permanent.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::generation::{extract_code, PromptBuilder};
use crate::llm::{ChatMessage, CompletionRequest, LlmClient};
use crate::plan::Plan;
use crate::runner::CadRunner;

use super::events::{EventBus, PipelineEvent};
use super::executor::{Executor, ExecutorConfig, SeedAttempt};
use super::{GenerationResult, Outcome};

/// Minimum step count that triggers iterative mode.
const STEP_COUNT_TRIGGER: usize = 4;

/// Configuration for the iterative builder.
#[derive(Debug, Clone)]
pub struct IterativeConfig {
    /// Retry budget per step.
    pub step_retry_budget: u8,
    /// Wall-clock limit per execution.
    pub exec_timeout: Duration,
    /// Model for step generation and repair.
    pub model: String,
    /// Temperature for step generation.
    pub temperature: f64,
}

impl Default for IterativeConfig {
    fn default() -> Self {
        Self {
            step_retry_budget: 3,
            exec_timeout: Duration::from_secs(30),
            model: String::new(),
            temperature: 0.3,
        }
    }
}

/// Builds a plan incrementally, one step at a time.
pub struct IterativeBuilder {
    llm: Arc<dyn LlmClient>,
    runner: Arc<dyn CadRunner>,
    config: IterativeConfig,
}

impl IterativeBuilder {
    /// Creates a builder.
    pub fn new(
        llm: Arc<dyn LlmClient>,
        runner: Arc<dyn CadRunner>,
        config: IterativeConfig,
    ) -> Self {
        Self {
            llm,
            runner,
            config,
        }
    }

    /// Whether a plan warrants iterative mode: four or more build steps,
    /// or any operation the kernel is known to choke on.
    pub fn should_trigger(plan: &Plan) -> bool {
        let steps = plan.build_steps();
        steps.len() >= STEP_COUNT_TRIGGER || steps.iter().any(|step| step.operation.is_risky())
    }

    /// Executes the plan step by step.
    ///
    /// Steps run in ascending index order. A step that exhausts its retry
    /// budget is skipped; later steps continue from the code accumulated
    /// through the last successful step.
    pub async fn run(
        &self,
        bus: &EventBus,
        cancel: &CancellationToken,
        system_prompt: &str,
        prompt_builder: &PromptBuilder,
        plan: &Plan,
    ) -> Result<GenerationResult, PipelineError> {
        let steps = plan.build_steps();

        let executor = Executor::new(
            Arc::clone(&self.llm),
            Arc::clone(&self.runner),
            ExecutorConfig {
                max_attempts: self.config.step_retry_budget,
                exec_timeout: self.config.exec_timeout,
                model: self.config.model.clone(),
                temperature: self.config.temperature,
            },
        );

        let mut result = GenerationResult::default();
        let mut working_code = String::new();
        let mut mesh: Vec<u8> = Vec::new();
        let mut succeeded_steps = 0usize;

        for step in &steps {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            bus.send(PipelineEvent::StepStarted {
                index: step.index,
                description: step.description.clone(),
            })
            .await;
            tracing::info!(step = step.index, operation = %step.operation, "Starting build step");

            let user_prompt = prompt_builder.step_user_prompt(&step.description, &working_code);
            let request = CompletionRequest::new(
                self.config.model.clone(),
                vec![
                    ChatMessage::system(system_prompt.to_string()),
                    ChatMessage::user(user_prompt.clone()),
                ],
            )
            .with_temperature(self.config.temperature);

            let completion = self.llm.complete(request).await?;

            let extracted = match extract_code(&completion.text) {
                Ok(extracted) => extracted,
                Err(e) => {
                    bus.send(PipelineEvent::StepSkipped {
                        index: step.index,
                        reason: format!("no code in model response: {}", e),
                    })
                    .await;
                    result.skipped_steps.push(step.index);
                    continue;
                }
            };

            bus.send(PipelineEvent::CodeExtracted {
                code: extracted.code.clone(),
                extractor_tier: extracted.tier,
            })
            .await;

            let seed = SeedAttempt {
                prompt: user_prompt,
                raw_response: completion.text,
                code: extracted.code,
                usage: completion.usage,
                temperature: self.config.temperature,
            };

            let report = executor
                .run(bus, cancel, system_prompt, seed, result.attempts.len())
                .await?;

            let step_succeeded = report.succeeded();
            let step_code = report.final_code.clone();
            let step_mesh = report.mesh.clone();
            result.attempts.extend(report.attempts);

            if step_succeeded {
                working_code = step_code;
                mesh = step_mesh.unwrap_or_default();
                succeeded_steps += 1;
                bus.send(PipelineEvent::StepComplete {
                    index: step.index,
                    code: working_code.clone(),
                })
                .await;
            } else {
                let reason = report
                    .last_error
                    .map(|error| format!("{}: {}", error.category, error.message))
                    .unwrap_or_else(|| "retry budget exhausted".to_string());
                tracing::warn!(step = step.index, reason = %reason, "Skipping build step");
                bus.send(PipelineEvent::StepSkipped {
                    index: step.index,
                    reason,
                })
                .await;
                result.skipped_steps.push(step.index);
                // working_code deliberately unchanged: the failed step's
                // code never becomes part of the prefix.
            }
        }

        result.code = working_code;
        result.mesh = mesh;
        result.outcome = if result.skipped_steps.is_empty() && succeeded_steps > 0 {
            Outcome::Success
        } else if succeeded_steps > 0 {
            Outcome::PartialSuccess
        } else {
            Outcome::Failure
        };

        Ok(result)
    }
}
