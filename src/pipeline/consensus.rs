//! Consensus mode: duplicate generations, execution-scored selection.
//!
//! Fans out K single-shot generations at diverse temperatures, executes
//! each through the repair loop, and picks the winner by score. Children
//! run concurrently under one deadline; stragglers are cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::generation::extract_code;
use crate::llm::{ChatMessage, CompletionRequest, LlmClient};
use crate::runner::CadRunner;

use super::events::{EventBus, PipelineEvent};
use super::executor::{Executor, ExecutorConfig, SeedAttempt};
use super::{GenerationResult, Outcome};

/// Success dominates the score outright.
const SUCCESS_SCORE: i64 = 1000;
/// Per-operation score weight.
const OP_SCORE: i64 = 10;

/// Configuration for consensus fan-out.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Sampling temperatures; one child per entry.
    pub temperatures: Vec<f64>,
    /// Wall-clock limit per execution inside a child.
    pub exec_timeout: Duration,
    /// Attempt budget per child.
    pub max_attempts: u8,
    /// Model identifier.
    pub model: String,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            temperatures: vec![0.3, 0.8],
            exec_timeout: Duration::from_secs(30),
            max_attempts: 3,
            model: String::new(),
        }
    }
}

impl ConsensusConfig {
    /// The fan-out deadline: twice the per-execute budget.
    pub fn deadline(&self) -> Duration {
        self.exec_timeout * 2
    }
}

/// One finished child, scored for selection.
#[derive(Debug)]
struct Candidate {
    child_index: usize,
    completion_seq: usize,
    result: GenerationResult,
    score: i64,
}

/// Consensus fan-out and winner selection.
pub struct Consensus {
    llm: Arc<dyn LlmClient>,
    runner: Arc<dyn CadRunner>,
    config: ConsensusConfig,
}

impl Consensus {
    /// Creates a consensus selector.
    pub fn new(
        llm: Arc<dyn LlmClient>,
        runner: Arc<dyn CadRunner>,
        config: ConsensusConfig,
    ) -> Self {
        Self {
            llm,
            runner,
            config,
        }
    }

    /// Runs the fan-out and returns the winner.
    ///
    /// Scoring: `1000·success + 10·op_count + line_count`; ties go to the
    /// earliest completion. With zero successes the highest-scoring
    /// failure is returned so the user still gets the best code.
    pub async fn run(
        &self,
        bus: &EventBus,
        cancel: &CancellationToken,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<GenerationResult, PipelineError> {
        let child_cancel = cancel.child_token();
        let mut set: JoinSet<Result<(usize, GenerationResult), PipelineError>> = JoinSet::new();

        for (child_index, temperature) in self.config.temperatures.iter().enumerate() {
            let llm = Arc::clone(&self.llm);
            let runner = Arc::clone(&self.runner);
            let child_bus = bus.child(child_index);
            let child_cancel = child_cancel.clone();
            let config = self.config.clone();
            let system_prompt = system_prompt.to_string();
            let user_prompt = user_prompt.to_string();
            let temperature = *temperature;

            set.spawn(async move {
                let result = run_child(
                    llm,
                    runner,
                    &child_bus,
                    &child_cancel,
                    &config,
                    &system_prompt,
                    &user_prompt,
                    temperature,
                )
                .await?;
                Ok((child_index, result))
            });
        }

        let deadline = tokio::time::sleep(self.config.deadline());
        tokio::pin!(deadline);

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut completion_seq = 0usize;

        loop {
            tokio::select! {
                joined = set.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok(Ok((child_index, result)))) => {
                            let score = score_result(&result);
                            tracing::info!(
                                child = child_index,
                                score,
                                outcome = %result.outcome,
                                "Consensus child finished"
                            );
                            candidates.push(Candidate {
                                child_index,
                                completion_seq,
                                result,
                                score,
                            });
                            completion_seq += 1;
                        }
                        Some(Ok(Err(PipelineError::Cancelled))) => {
                            // A child observing the shared deadline token is
                            // not a run-level cancellation.
                            completion_seq += 1;
                        }
                        Some(Ok(Err(e))) => return Err(e),
                        Some(Err(e)) => return Err(PipelineError::Internal(e.to_string())),
                    }
                }
                _ = &mut deadline => {
                    tracing::warn!(
                        finished = candidates.len(),
                        "Consensus deadline reached, cancelling stragglers"
                    );
                    child_cancel.cancel();
                    set.abort_all();
                    break;
                }
                _ = cancel.cancelled() => {
                    child_cancel.cancel();
                    set.abort_all();
                    return Err(PipelineError::Cancelled);
                }
            }
        }

        // Highest score wins; ties break to the earliest completion.
        let winner = match candidates.into_iter().min_by_key(|c| (-c.score, c.completion_seq)) {
            Some(winner) => winner,
            None if cancel.is_cancelled() => return Err(PipelineError::Cancelled),
            None => {
                return Err(PipelineError::Internal(
                    "no consensus child finished before the deadline".into(),
                ))
            }
        };

        tracing::info!(
            winner = winner.child_index,
            score = winner.score,
            "Consensus winner selected"
        );
        Ok(winner.result)
    }
}

/// One child: single-shot generation plus the repair loop. No nesting.
#[allow(clippy::too_many_arguments)]
async fn run_child(
    llm: Arc<dyn LlmClient>,
    runner: Arc<dyn CadRunner>,
    bus: &EventBus,
    cancel: &CancellationToken,
    config: &ConsensusConfig,
    system_prompt: &str,
    user_prompt: &str,
    temperature: f64,
) -> Result<GenerationResult, PipelineError> {
    bus.send(PipelineEvent::CodeStarted).await;

    let request = CompletionRequest::new(
        config.model.clone(),
        vec![
            ChatMessage::system(system_prompt.to_string()),
            ChatMessage::user(user_prompt.to_string()),
        ],
    )
    .with_temperature(temperature);

    let completion = llm.complete(request).await?;

    let extracted = match extract_code(&completion.text) {
        Ok(extracted) => extracted,
        Err(e) => {
            // A child with no code still participates as a scored failure.
            tracing::warn!(error = %e, "Consensus child produced no code");
            return Ok(GenerationResult::default());
        }
    };

    bus.send(PipelineEvent::CodeExtracted {
        code: extracted.code.clone(),
        extractor_tier: extracted.tier,
    })
    .await;

    let executor = Executor::new(
        llm,
        runner,
        ExecutorConfig {
            max_attempts: config.max_attempts,
            exec_timeout: config.exec_timeout,
            model: config.model.clone(),
            temperature,
        },
    );

    let seed = SeedAttempt {
        prompt: user_prompt.to_string(),
        raw_response: completion.text,
        code: extracted.code,
        usage: completion.usage,
        temperature,
    };

    let report = executor.run(bus, cancel, system_prompt, seed, 0).await?;

    let outcome = if report.succeeded() {
        Outcome::Success
    } else {
        Outcome::Failure
    };

    Ok(GenerationResult {
        code: report.final_code,
        mesh: report.mesh.unwrap_or_default(),
        attempts: report.attempts,
        skipped_steps: Vec::new(),
        outcome,
    })
}

/// `1000·success + 10·op_count + line_count`.
fn score_result(result: &GenerationResult) -> i64 {
    let success = i64::from(result.outcome == Outcome::Success);
    let ops = count_operations(&result.code) as i64;
    let lines = result.code.lines().count() as i64;
    SUCCESS_SCORE * success + OP_SCORE * ops + lines
}

/// Counts CAD operation calls in a script.
fn count_operations(code: &str) -> usize {
    const OP_CALLS: [&str; 14] = [
        ".box(",
        ".cylinder(",
        ".extrude(",
        ".revolve(",
        ".loft(",
        ".sweep(",
        ".shell(",
        ".fillet(",
        ".chamfer(",
        ".union(",
        ".cut(",
        ".intersect(",
        ".hole(",
        ".rarray(",
    ];

    OP_CALLS
        .iter()
        .map(|needle| code.matches(needle).count())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LlmError, RunnerError};
    use crate::llm::{Completion, CompletionChunk, CompletionStream, TokenUsage};
    use crate::pipeline::RunId;
    use crate::recovery::RunnerEnvelope;
    use crate::runner::ExecutionOutcome;
    use async_trait::async_trait;

    /// Returns different scripts per temperature: the cold child's script
    /// carries a poison marker the runner rejects.
    struct TemperatureLlm;

    #[async_trait]
    impl LlmClient for TemperatureLlm {
        async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
            let temp = request.temperature.unwrap_or(0.0);
            let code = if temp < 0.5 {
                "import cadquery as cq\n# cold\nresult = cq.Workplane(\"XY\").box(1, 1, 1)"
            } else {
                "import cadquery as cq\n# warm\nresult = cq.Workplane(\"XY\").box(2, 2, 2).fillet(0.1)"
            };
            Ok(Completion {
                text: format!("<CODE>\n{}\n</CODE>", code),
                usage: TokenUsage::new(10, 10),
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

    struct PoisonRunner {
        poison: &'static str,
    }

    #[async_trait]
    impl CadRunner for PoisonRunner {
        async fn execute(
            &self,
            source: &str,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<ExecutionOutcome, RunnerError> {
            if source.contains(self.poison) {
                Ok(ExecutionOutcome::Failure(RunnerEnvelope::new(
                    7,
                    "RuntimeError: kernel crashed",
                )))
            } else {
                let mut bytes = vec![0u8; 80];
                bytes.extend_from_slice(&1u32.to_le_bytes());
                bytes.extend(std::iter::repeat(0u8).take(50));
                Ok(ExecutionOutcome::Mesh(bytes))
            }
        }
    }

    fn consensus(poison: &'static str) -> Consensus {
        Consensus::new(
            Arc::new(TemperatureLlm),
            Arc::new(PoisonRunner { poison }),
            ConsensusConfig {
                max_attempts: 1,
                ..ConsensusConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_warm_child_wins_when_cold_fails() {
        let (bus, mut stream) = EventBus::channel_with_capacity(RunId(1), 1024);
        let result = consensus("# cold")
            .run(&bus, &CancellationToken::new(), "system", "make a cube")
            .await
            .unwrap();
        drop(bus);

        assert_eq!(result.outcome, Outcome::Success);
        assert!(result.code.contains("# warm"));
        assert!(!result.mesh.is_empty());

        // All events arrive wrapped with their child index.
        let mut saw_child = [false, false];
        while let Some(envelope) = stream.recv().await {
            match envelope.event {
                PipelineEvent::ConsensusChild { child_index, .. } => {
                    saw_child[child_index] = true;
                }
                other => panic!("unwrapped event escaped consensus: {:?}", other),
            }
        }
        assert!(saw_child[0] && saw_child[1]);
    }

    #[tokio::test]
    async fn test_all_children_failing_returns_best_failure() {
        let (bus, _stream) = EventBus::channel_with_capacity(RunId(2), 1024);
        // Poison both scripts.
        let result = consensus("import cadquery")
            .run(&bus, &CancellationToken::new(), "system", "make a cube")
            .await
            .unwrap();

        assert_eq!(result.outcome, Outcome::Failure);
        // The warm script has one more operation call, so it scores higher.
        assert!(result.code.contains("# warm"));
        assert!(result.mesh.is_empty());
    }

    #[tokio::test]
    async fn test_run_level_cancellation() {
        let (bus, _stream) = EventBus::channel_with_capacity(RunId(3), 1024);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let c = consensus("nothing");
        let result = c.run(&bus, &cancel, "system", "x").await;
        // Either the children observe the token first or the parent does;
        // both surface as cancellation.
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[test]
    fn test_count_operations() {
        let code = "cq.Workplane(\"XY\").box(1, 1, 1).fillet(0.1).fillet(0.2)";
        assert_eq!(count_operations(code), 3);
        assert_eq!(count_operations("no calls"), 0);
    }

    #[test]
    fn test_score_ordering() {
        let success = GenerationResult {
            code: "a.box(1)".into(),
            outcome: Outcome::Success,
            ..GenerationResult::default()
        };
        let failure = GenerationResult {
            code: "a.box(1)\n.fillet(2)\n.shell(3)\nmore\nlines".into(),
            outcome: Outcome::Failure,
            ..GenerationResult::default()
        };

        // Success always beats any failure.
        assert!(score_result(&success) > score_result(&failure));
    }
}
