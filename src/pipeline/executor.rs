//! The execute/classify/re-prompt loop.
//!
//! Takes generated code, runs it through the CAD runner, and on failure
//! drives the classify → strategy → targeted re-prompt cycle until the
//! attempt budget or the strategy table is exhausted. Single-flight per
//! pipeline run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, RunnerError};
use crate::generation::extract_code;
use crate::llm::{ChatMessage, CompletionRequest, LlmClient, TokenUsage};
use crate::recovery::{classify, ClassifiedError, RetryStrategy};
use crate::runner::{CadRunner, ExecutionOutcome};

use super::events::{EventBus, PipelineEvent};
use super::{Attempt, AttemptOutcome};

/// Configuration for the executor loop.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Total attempt budget, including the seed attempt (1..=5).
    pub max_attempts: u8,
    /// Wall-clock limit per execution.
    pub exec_timeout: Duration,
    /// Model for repair completions.
    pub model: String,
    /// Temperature for repair completions.
    pub temperature: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            exec_timeout: Duration::from_secs(30),
            model: String::new(),
            temperature: 0.2,
        }
    }
}

/// The already-generated first attempt the loop starts from.
#[derive(Debug, Clone)]
pub struct SeedAttempt {
    /// The prompt that produced the code.
    pub prompt: String,
    /// The raw model response.
    pub raw_response: String,
    /// The extracted code.
    pub code: String,
    /// Token usage of the generation call.
    pub usage: TokenUsage,
    /// Sampling temperature of the generation call.
    pub temperature: f64,
}

/// What the loop produced.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Every attempt, in order.
    pub attempts: Vec<Attempt>,
    /// The last code, even when execution never succeeded.
    pub final_code: String,
    /// The mesh, when an attempt succeeded.
    pub mesh: Option<Vec<u8>>,
    /// The last classified failure, when no attempt succeeded.
    pub last_error: Option<ClassifiedError>,
    /// Token usage of the repair completions (excludes the seed).
    pub repair_usage: TokenUsage,
}

impl ExecutionReport {
    /// Whether any attempt produced a mesh.
    pub fn succeeded(&self) -> bool {
        self.mesh.is_some()
    }
}

/// The bounded execute-and-repair loop.
pub struct Executor {
    llm: Arc<dyn LlmClient>,
    runner: Arc<dyn CadRunner>,
    config: ExecutorConfig,
}

impl Executor {
    /// Creates an executor.
    pub fn new(llm: Arc<dyn LlmClient>, runner: Arc<dyn CadRunner>, config: ExecutorConfig) -> Self {
        Self {
            llm,
            runner,
            config,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs the loop starting from already-generated code.
    ///
    /// `index_offset` numbers the emitted attempts so that indices stay
    /// contiguous across a multi-step run.
    ///
    /// Exhausting the budget is not an `Err`: the report carries the last
    /// failure and code for the caller to surface or skip. `Err` is
    /// reserved for cancellation, provider exhaustion and infrastructure
    /// bugs.
    pub async fn run(
        &self,
        bus: &EventBus,
        cancel: &CancellationToken,
        system_prompt: &str,
        seed: SeedAttempt,
        index_offset: usize,
    ) -> Result<ExecutionReport, PipelineError> {
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut repair_usage = TokenUsage::default();

        let mut prompt = seed.prompt;
        let mut raw_response = seed.raw_response;
        let mut code = seed.code;
        let mut usage = seed.usage;
        let mut temperature = seed.temperature;

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let attempt_index = index_offset + attempts.len();
            let started = Instant::now();

            bus.send(PipelineEvent::ValidationAttempt {
                index: attempt_index,
            })
            .await;

            let outcome = match self
                .runner
                .execute(&code, self.config.exec_timeout, cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(RunnerError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => return Err(PipelineError::Internal(e.to_string())),
            };

            match outcome {
                ExecutionOutcome::Mesh(mesh) => {
                    bus.send(PipelineEvent::ValidationSuccess {
                        mesh_bytes: mesh.len(),
                    })
                    .await;
                    tracing::info!(
                        attempt = attempt_index,
                        mesh_bytes = mesh.len(),
                        "Execution succeeded"
                    );

                    attempts.push(Attempt {
                        index: attempt_index,
                        prompt,
                        raw_response,
                        code: code.clone(),
                        outcome: AttemptOutcome::Success { mesh: mesh.clone() },
                        usage,
                        duration: started.elapsed(),
                        temperature,
                    });

                    return Ok(ExecutionReport {
                        attempts,
                        final_code: code,
                        mesh: Some(mesh),
                        last_error: None,
                        repair_usage,
                    });
                }
                ExecutionOutcome::Failure(envelope) => {
                    let error = classify(&envelope);
                    bus.send(PipelineEvent::ValidationFailed {
                        category: error.category.clone(),
                        message: error.message.clone(),
                        line: error.line,
                    })
                    .await;
                    tracing::warn!(
                        attempt = attempt_index,
                        category = %error.category,
                        line = ?error.line,
                        "Execution failed"
                    );

                    attempts.push(Attempt {
                        index: attempt_index,
                        prompt: std::mem::take(&mut prompt),
                        raw_response: std::mem::take(&mut raw_response),
                        code: code.clone(),
                        outcome: AttemptOutcome::Failure(error.clone()),
                        usage,
                        duration: started.elapsed(),
                        temperature,
                    });

                    if attempts.len() >= self.config.max_attempts as usize {
                        tracing::warn!(
                            attempts = attempts.len(),
                            "Attempt budget exhausted"
                        );
                        return Ok(self.exhausted(attempts, code, error, repair_usage));
                    }

                    // The table caps at three ordinals and its level-2 cells
                    // are last, so a final-level strategy is selected at most
                    // once per category within one run.
                    let retry_ordinal = attempts.len() as u8;
                    let strategy = match RetryStrategy::select(&error, retry_ordinal) {
                        Some(strategy) => strategy,
                        None => {
                            tracing::warn!(category = %error.category, "Strategy table is terminal");
                            return Ok(self.exhausted(attempts, code, error, repair_usage));
                        }
                    };

                    prompt = build_retry_prompt(&strategy, &error, &code);
                    let request = CompletionRequest::new(
                        self.config.model.clone(),
                        vec![
                            ChatMessage::system(system_prompt.to_string()),
                            ChatMessage::user(prompt.clone()),
                        ],
                    )
                    .with_temperature(self.config.temperature);

                    let completion = self.llm.complete(request).await?;
                    repair_usage = repair_usage.add(completion.usage);
                    usage = completion.usage;
                    temperature = self.config.temperature;

                    match extract_code(&completion.text) {
                        Ok(extracted) => {
                            bus.send(PipelineEvent::CodeExtracted {
                                code: extracted.code.clone(),
                                extractor_tier: extracted.tier,
                            })
                            .await;
                            raw_response = completion.text;
                            code = extracted.code;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Retry response had no code");
                            return Ok(self.exhausted(attempts, code, error, repair_usage));
                        }
                    }
                }
            }
        }
    }

    fn exhausted(
        &self,
        attempts: Vec<Attempt>,
        code: String,
        error: ClassifiedError,
        repair_usage: TokenUsage,
    ) -> ExecutionReport {
        ExecutionReport {
            attempts,
            final_code: code,
            mesh: None,
            last_error: Some(error),
            repair_usage,
        }
    }
}

/// Assembles the repair prompt from the strategy and failure context.
fn build_retry_prompt(strategy: &RetryStrategy, error: &ClassifiedError, code: &str) -> String {
    let mut parts = vec![strategy.prompt_prefix.clone()];

    if let Some(clause) = strategy.forbidden_clause() {
        parts.push(clause);
    }

    let citation = match error.line {
        Some(line) => format!(
            "Failure: {} error at line {}: {}",
            error.category, line, error.message
        ),
        None => format!("Failure: {} error: {}", error.category, error.message),
    };
    parts.push(citation);

    parts.push(format!("Current code:\n```python\n{}\n```", code));
    parts.push("Return only the corrected code in <CODE> tags.".to_string());

    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{Completion, CompletionChunk, CompletionStream};
    use crate::pipeline::RunId;
    use crate::recovery::{ErrorCategory, RunnerEnvelope};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Runner scripted with one envelope per attempt.
    struct ScriptedRunner {
        outcomes: Mutex<Vec<ExecutionOutcome>>,
    }

    impl ScriptedRunner {
        fn new(outcomes: Vec<ExecutionOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
            }
        }

        fn mesh() -> ExecutionOutcome {
            let mut bytes = vec![0u8; 80];
            bytes.extend_from_slice(&1u32.to_le_bytes());
            bytes.extend(std::iter::repeat(0u8).take(50));
            ExecutionOutcome::Mesh(bytes)
        }

        fn syntax_failure() -> ExecutionOutcome {
            ExecutionOutcome::Failure(RunnerEnvelope::new(
                2,
                "  File \"script.py\", line 7\nSyntaxError: invalid syntax",
            ))
        }
    }

    #[async_trait]
    impl CadRunner for ScriptedRunner {
        async fn execute(
            &self,
            _source: &str,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<ExecutionOutcome, RunnerError> {
            Ok(self.outcomes.lock().unwrap().remove(0))
        }
    }

    /// LLM that always returns the same tagged code.
    struct FixedLlm {
        code: String,
    }

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion, LlmError> {
            Ok(Completion {
                text: format!("<CODE>\n{}\n</CODE>", self.code),
                usage: TokenUsage::new(50, 20),
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

    fn seed() -> SeedAttempt {
        SeedAttempt {
            prompt: "make a cube".into(),
            raw_response: "<CODE>bad code</CODE>".into(),
            code: "bad code".into(),
            usage: TokenUsage::new(100, 30),
            temperature: 0.3,
        }
    }

    fn executor(runner: ScriptedRunner, max_attempts: u8) -> Executor {
        Executor::new(
            Arc::new(FixedLlm {
                code: "import cadquery as cq\nresult = cq.Workplane(\"XY\").box(1, 1, 1)".into(),
            }),
            Arc::new(runner),
            ExecutorConfig {
                max_attempts,
                ..ExecutorConfig::default()
            },
        )
    }

    async fn drain(mut stream: super::super::events::EventStream) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_millis(100), stream.recv()).await
        {
            events.push(envelope.event);
        }
        events
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let (bus, stream) = EventBus::channel(RunId(1));
        let executor = executor(ScriptedRunner::new(vec![ScriptedRunner::mesh()]), 3);

        let report = executor
            .run(&bus, &CancellationToken::new(), "system", seed(), 0)
            .await
            .unwrap();
        drop(bus);

        assert!(report.succeeded());
        assert_eq!(report.attempts.len(), 1);
        assert!(report.attempts[0].outcome.is_success());

        let events = drain(stream).await;
        assert!(matches!(events[0], PipelineEvent::ValidationAttempt { index: 0 }));
        assert!(matches!(events[1], PipelineEvent::ValidationSuccess { .. }));
    }

    #[tokio::test]
    async fn test_syntax_error_recovered_on_second_attempt() {
        let (bus, stream) = EventBus::channel(RunId(2));
        let executor = executor(
            ScriptedRunner::new(vec![ScriptedRunner::syntax_failure(), ScriptedRunner::mesh()]),
            3,
        );

        let report = executor
            .run(&bus, &CancellationToken::new(), "system", seed(), 0)
            .await
            .unwrap();
        drop(bus);

        assert!(report.succeeded());
        assert_eq!(report.attempts.len(), 2);
        assert!(matches!(
            report.attempts[0].outcome,
            AttemptOutcome::Failure(_)
        ));
        assert!(report.attempts[1].outcome.is_success());
        // The retry prompt cites the failing line.
        assert!(report.attempts[1].prompt.contains("line 7"));

        let events = drain(stream).await;
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                PipelineEvent::ValidationAttempt { .. } => "attempt",
                PipelineEvent::ValidationFailed { .. } => "failed",
                PipelineEvent::CodeExtracted { .. } => "extracted",
                PipelineEvent::ValidationSuccess { .. } => "success",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["attempt", "failed", "extracted", "attempt", "success"]
        );
    }

    #[tokio::test]
    async fn test_max_attempts_one_fails_without_reprompt() {
        let (bus, stream) = EventBus::channel(RunId(3));
        let executor = executor(ScriptedRunner::new(vec![ScriptedRunner::syntax_failure()]), 1);

        let report = executor
            .run(&bus, &CancellationToken::new(), "system", seed(), 0)
            .await
            .unwrap();
        drop(bus);

        assert!(!report.succeeded());
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(
            report.last_error.as_ref().unwrap().category,
            ErrorCategory::Syntax
        );
        // No repair call was made.
        assert_eq!(report.repair_usage, TokenUsage::default());

        let events = drain(stream).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, PipelineEvent::CodeExtracted { .. })));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_keeps_last_code() {
        let (bus, _stream) = EventBus::channel(RunId(4));
        let executor = executor(
            ScriptedRunner::new(vec![
                ScriptedRunner::syntax_failure(),
                ScriptedRunner::syntax_failure(),
                ScriptedRunner::syntax_failure(),
            ]),
            3,
        );

        let report = executor
            .run(&bus, &CancellationToken::new(), "system", seed(), 0)
            .await
            .unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.attempts.len(), 3);
        // The user still gets the last code to edit manually.
        assert!(report.final_code.contains("cadquery"));
        // Attempt indices are contiguous from zero.
        for (i, attempt) in report.attempts.iter().enumerate() {
            assert_eq!(attempt.index, i);
        }
    }

    #[tokio::test]
    async fn test_cancellation_before_execute() {
        let (bus, _stream) = EventBus::channel(RunId(5));
        let executor = executor(ScriptedRunner::new(vec![ScriptedRunner::mesh()]), 3);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor.run(&bus, &cancel, "system", seed(), 0).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_index_offset_applied() {
        let (bus, stream) = EventBus::channel(RunId(6));
        let executor = executor(ScriptedRunner::new(vec![ScriptedRunner::mesh()]), 3);

        let report = executor
            .run(&bus, &CancellationToken::new(), "system", seed(), 5)
            .await
            .unwrap();
        drop(bus);

        assert_eq!(report.attempts[0].index, 5);
        let events = drain(stream).await;
        assert!(matches!(
            events[0],
            PipelineEvent::ValidationAttempt { index: 5 }
        ));
    }
}
