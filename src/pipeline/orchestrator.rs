//! The top-level pipeline orchestrator.
//!
//! Owns run identity, mode selection, cancellation and the terminal
//! contract: every run's event stream ends with exactly one of `Done`,
//! `Cancelled` or `Error`, and the caller always gets a result value back,
//! with the last generated code even on failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::StreamExt;
use semver::Version;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::{ConfigError, PipelineError};
use crate::generation::{extract_code, PromptBuilder, PromptMode};
use crate::llm::{
    estimate_cost_usd, ChatMessage, CompletionChunk, CompletionRequest, LlmClient, TokenUsage,
};
use crate::plan::{Confidence, Plan, PlanValidator, Planner, PlannerConfig};
use crate::recovery::{ClassifiedError, ErrorCategory};
use crate::rules::{RuleSet, RuleStore};
use crate::runner::CadRunner;

use super::consensus::{Consensus, ConsensusConfig};
use super::events::{EventBus, EventStream, Phase, PipelineEvent};
use super::executor::{Executor, ExecutorConfig, SeedAttempt};
use super::iterative::{IterativeBuilder, IterativeConfig};
use super::reviewer::Reviewer;
use super::session::SessionMemory;
use super::{Attempt, AttemptOutcome, GenerationResult, Outcome, RunId, UserRequest};

/// Per-run options supplied by the caller.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Rule preset override.
    pub preset_id: Option<String>,
    /// Opt in to consensus mode.
    pub consensus: bool,
    /// Execute generated code automatically.
    pub auto_execute: bool,
    /// Attempt budget for this run.
    pub max_attempts: u8,
    /// Temperature override for generation.
    pub temperature: Option<f64>,
    /// Model override for this run.
    pub model_id: Option<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            preset_id: None,
            consensus: false,
            auto_execute: true,
            max_attempts: 3,
            temperature: None,
            model_id: None,
        }
    }
}

/// A started run: its id, event stream and eventual result.
pub struct RunHandle {
    pub run_id: RunId,
    pub events: EventStream,
    pub outcome: JoinHandle<(GenerationResult, SessionMemory)>,
}

/// The pipeline orchestrator.
pub struct Pipeline {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    runner: Arc<dyn CadRunner>,
    rules: Arc<RuleStore>,
    library_version: Version,
    next_run_id: AtomicU64,
    active: Arc<Mutex<HashMap<u64, CancellationToken>>>,
}

impl Pipeline {
    /// Creates a pipeline from explicit collaborators.
    pub fn new(
        config: AppConfig,
        llm: Arc<dyn LlmClient>,
        runner: Arc<dyn CadRunner>,
        rules: Arc<RuleStore>,
    ) -> Result<Self, ConfigError> {
        let library_version = Version::parse(&config.library_version).map_err(|e| {
            ConfigError::InvalidValue {
                key: "library_version".to_string(),
                message: e.to_string(),
            }
        })?;

        Ok(Self {
            config,
            llm,
            runner,
            rules,
            library_version,
            next_run_id: AtomicU64::new(0),
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Starts a run. Returns immediately with the handle; the pipeline
    /// drives itself on the runtime.
    pub fn run(
        &self,
        request: UserRequest,
        options: PipelineOptions,
        memory: SessionMemory,
    ) -> RunHandle {
        let run_id = RunId(self.next_run_id.fetch_add(1, Ordering::SeqCst));
        let (bus, events) = EventBus::channel(run_id);

        let cancel = CancellationToken::new();
        self.active
            .lock()
            .expect("active-run lock poisoned")
            .insert(run_id.0, cancel.clone());

        let context = RunContext {
            config: self.config.clone(),
            options,
            llm: Arc::clone(&self.llm),
            runner: Arc::clone(&self.runner),
            rules: Arc::clone(&self.rules),
            library_version: self.library_version.clone(),
            bus,
            cancel,
        };
        let active = Arc::clone(&self.active);

        let outcome = tokio::spawn(async move {
            let started = Instant::now();
            let mut result = GenerationResult::default();
            let mut memory = memory;
            let mut operations = Vec::new();

            let driven = context
                .drive(&request, &memory, &mut result, &mut operations)
                .await;

            match driven {
                Ok(()) => {
                    context
                        .bus
                        .send(PipelineEvent::Done {
                            outcome: result.outcome,
                            final_code: result.code.clone(),
                            final_mesh: (!result.mesh.is_empty()).then(|| result.mesh.clone()),
                        })
                        .await;
                }
                Err(PipelineError::Cancelled) => {
                    result.outcome = Outcome::Failure;
                    context.bus.send(PipelineEvent::Cancelled).await;
                }
                Err(e) => {
                    result.outcome = Outcome::Failure;
                    tracing::error!(run_id = %context.bus.run_id(), error = %e, "Run failed");
                    context
                        .bus
                        .send(PipelineEvent::Error {
                            fatal_reason: e.to_string(),
                        })
                        .await;
                }
            }

            memory.record(&request.text, operations, &result, started.elapsed());
            active
                .lock()
                .expect("active-run lock poisoned")
                .remove(&context.bus.run_id().0);

            (result, memory)
        });

        RunHandle {
            run_id,
            events,
            outcome,
        }
    }

    /// Cancels a run by id. No-op for unknown or finished runs.
    pub fn cancel(&self, run_id: RunId) {
        if let Some(token) = self
            .active
            .lock()
            .expect("active-run lock poisoned")
            .get(&run_id.0)
        {
            tracing::info!(%run_id, "Cancelling run");
            token.cancel();
        }
    }
}

/// Everything one run's driver task needs, by value.
struct RunContext {
    config: AppConfig,
    options: PipelineOptions,
    llm: Arc<dyn LlmClient>,
    runner: Arc<dyn CadRunner>,
    rules: Arc<RuleStore>,
    library_version: Version,
    bus: EventBus,
    cancel: CancellationToken,
}

impl RunContext {
    fn model(&self) -> String {
        self.options
            .model_id
            .clone()
            .unwrap_or_else(|| self.config.model.clone())
    }

    fn generation_temperature(&self) -> f64 {
        self.options.temperature.unwrap_or(0.3)
    }

    async fn emit_usage(&self, phase: Phase, usage: TokenUsage) {
        if usage == TokenUsage::default() {
            return;
        }
        self.bus
            .send(PipelineEvent::TokenUsage {
                phase,
                usage,
                cost_estimate: estimate_cost_usd(self.config.provider, usage),
            })
            .await;
    }

    /// Runs a future unless the run is cancelled first.
    async fn cancellable<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, PipelineError>>,
    ) -> Result<T, PipelineError> {
        tokio::select! {
            result = fut => result,
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
        }
    }

    /// The state machine: planning → validation → confidence → mode →
    /// review. Mutates `result` as phases complete so partial state
    /// survives cancellation.
    async fn drive(
        &self,
        request: &UserRequest,
        memory: &SessionMemory,
        result: &mut GenerationResult,
        operations: &mut Vec<crate::plan::OperationKind>,
    ) -> Result<(), PipelineError> {
        if request.text.trim().is_empty() {
            return Err(PipelineError::User("empty request".to_string()));
        }

        let preset = request
            .preset_id
            .clone()
            .or_else(|| self.options.preset_id.clone())
            .unwrap_or_else(|| self.config.preset_id.clone());
        let rules = self.rules.load(&preset).map_err(|e| match e {
            crate::error::RuleStoreError::PresetNotFound(p) => {
                PipelineError::User(format!("unknown preset '{}'", p))
            }
            other => PipelineError::Internal(other.to_string()),
        })?;

        let prompt_builder = PromptBuilder::new(self.library_version.clone());
        let session_context = memory.render();

        if request.is_modification() {
            return self
                .run_modification(request, &rules, &prompt_builder, session_context, result)
                .await;
        }

        // Planning, with at most one validator-driven re-plan.
        let (plan, risk_score, plan_usage) = self.run_planning(request, &rules).await?;
        self.emit_usage(Phase::Planning, plan_usage).await;
        *operations = plan.operations();

        // Pre-execution confidence.
        let cookbook = rules.cookbook_for_version(&self.library_version);
        let confidence = Confidence::new().estimate(&request.text, &plan, risk_score, &cookbook);
        self.bus
            .send(PipelineEvent::ConfidenceComputed {
                score: confidence.score,
                band: confidence.band,
            })
            .await;

        let system = prompt_builder
            .build_system(&rules, session_context.as_deref(), PromptMode::Generation)
            .system;

        if IterativeBuilder::should_trigger(&plan) {
            let builder = IterativeBuilder::new(
                Arc::clone(&self.llm),
                Arc::clone(&self.runner),
                IterativeConfig {
                    step_retry_budget: self.options.max_attempts,
                    exec_timeout: self.config.exec_timeout,
                    model: self.model(),
                    temperature: self.generation_temperature(),
                },
            );
            *result = builder
                .run(&self.bus, &self.cancel, &system, &prompt_builder, &plan)
                .await?;
            self.emit_usage(Phase::Generation, result.total_usage())
                .await;
        } else if self.options.consensus && self.config.enable_consensus {
            let consensus = Consensus::new(
                Arc::clone(&self.llm),
                Arc::clone(&self.runner),
                ConsensusConfig {
                    exec_timeout: self.config.exec_timeout,
                    max_attempts: self.options.max_attempts,
                    model: self.model(),
                    ..ConsensusConfig::default()
                },
            );
            let user = prompt_builder.generation_user_prompt(&request.text, plan.text());
            *result = consensus
                .run(&self.bus, &self.cancel, &system, &user)
                .await?;
            self.emit_usage(Phase::Generation, result.total_usage())
                .await;
        } else {
            let user = prompt_builder.generation_user_prompt(&request.text, plan.text());
            self.run_single_shot(&system, &user, result).await?;
        }

        // Post-execution confidence adjustment.
        let adjusted = confidence.after_outcome(result.outcome == Outcome::Success);
        self.bus
            .send(PipelineEvent::ConfidenceComputed {
                score: adjusted.score,
                band: adjusted.band,
            })
            .await;

        self.maybe_review(&request.text, &plan, result).await?;
        Ok(())
    }

    /// Modification mode: no planning, no confidence, one edit call.
    async fn run_modification(
        &self,
        request: &UserRequest,
        rules: &RuleSet,
        prompt_builder: &PromptBuilder,
        session_context: Option<String>,
        result: &mut GenerationResult,
    ) -> Result<(), PipelineError> {
        let existing = request
            .existing_code
            .as_deref()
            .expect("modification mode requires existing code");

        let system = prompt_builder
            .build_system(rules, session_context.as_deref(), PromptMode::Modification)
            .system;
        let user = prompt_builder.modification_user_prompt(&request.text, existing);

        self.run_single_shot(&system, &user, result).await?;
        self.maybe_review(&request.text, &Plan::new(""), result)
            .await
    }

    /// Planning with one re-plan on rejection; the second rejection is a
    /// generation failure.
    async fn run_planning(
        &self,
        request: &UserRequest,
        rules: &RuleSet,
    ) -> Result<(Plan, u8, TokenUsage), PipelineError> {
        let planner = Planner::new(
            Arc::clone(&self.llm),
            PlannerConfig::default().with_model(self.model()),
        );
        let validator = PlanValidator::new();
        let mut usage = TokenUsage::default();

        self.bus.send(PipelineEvent::PlanStarted).await;
        let (plan, plan_usage) = self
            .cancellable(self.with_plan_timeout(planner.create_plan(&request.text, rules)))
            .await?;
        usage = usage.add(plan_usage);
        self.bus
            .send(PipelineEvent::PlanComplete { plan: plan.clone() })
            .await;

        let verdict = validator.validate(&plan);
        if verdict.is_valid {
            return Ok((plan, verdict.risk_score, usage));
        }

        let reason = verdict
            .rejected_reason
            .unwrap_or_else(|| "plan rejected".to_string());
        self.bus
            .send(PipelineEvent::PlanRejected {
                reason: reason.clone(),
            })
            .await;
        tracing::warn!(reason = %reason, "Plan rejected, re-planning once");

        self.bus.send(PipelineEvent::PlanStarted).await;
        let (revised, revision_usage) = self
            .cancellable(self.with_plan_timeout(planner.revise_plan(
                &request.text,
                rules,
                &plan,
                &reason,
            )))
            .await?;
        usage = usage.add(revision_usage);
        self.bus
            .send(PipelineEvent::PlanComplete {
                plan: revised.clone(),
            })
            .await;

        let verdict = validator.validate(&revised);
        if verdict.is_valid {
            return Ok((revised, verdict.risk_score, usage));
        }

        let reason = verdict
            .rejected_reason
            .unwrap_or_else(|| "plan rejected".to_string());
        self.bus
            .send(PipelineEvent::PlanRejected {
                reason: reason.clone(),
            })
            .await;

        Err(PipelineError::Generation {
            error: ClassifiedError {
                category: ErrorCategory::Unknown,
                line: None,
                message: format!("plan rejected twice: {}", reason),
                operation: None,
            },
            last_code: String::new(),
        })
    }

    async fn with_plan_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, crate::error::PlanError>>,
    ) -> Result<T, PipelineError> {
        match tokio::time::timeout(self.config.plan_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(crate::error::PlanError::Llm(e))) => Err(PipelineError::Provider(e)),
            Ok(Err(e)) => Err(PipelineError::User(e.to_string())),
            Err(_) => Err(PipelineError::Provider(
                crate::error::LlmError::RequestFailed("planning timed out".to_string()),
            )),
        }
    }

    /// Streams one generation, extracts code, and (unless auto-execute is
    /// off) runs the repair loop.
    async fn run_single_shot(
        &self,
        system: &str,
        user: &str,
        result: &mut GenerationResult,
    ) -> Result<(), PipelineError> {
        let temperature = self.generation_temperature();

        self.bus.send(PipelineEvent::CodeStarted).await;
        let (raw_response, usage) = self.stream_completion(system, user, temperature).await?;

        let extracted = extract_code(&raw_response).map_err(|_| PipelineError::Generation {
            error: ClassifiedError {
                category: ErrorCategory::Unknown,
                line: None,
                message: "model response contained no code".to_string(),
                operation: None,
            },
            last_code: String::new(),
        })?;

        self.bus
            .send(PipelineEvent::CodeExtracted {
                code: extracted.code.clone(),
                extractor_tier: extracted.tier,
            })
            .await;
        self.emit_usage(Phase::Generation, usage).await;

        let seed = SeedAttempt {
            prompt: user.to_string(),
            raw_response,
            code: extracted.code,
            usage,
            temperature,
        };

        if !self.options.auto_execute {
            // Execution handed to the user; the code itself is the result.
            result.code = seed.code.clone();
            result.attempts.push(Attempt {
                index: 0,
                prompt: seed.prompt,
                raw_response: seed.raw_response,
                code: seed.code,
                outcome: AttemptOutcome::Skipped,
                usage: seed.usage,
                duration: std::time::Duration::ZERO,
                temperature,
            });
            result.outcome = Outcome::Success;
            return Ok(());
        }

        let executor = Executor::new(
            Arc::clone(&self.llm),
            Arc::clone(&self.runner),
            ExecutorConfig {
                max_attempts: self.options.max_attempts,
                exec_timeout: self.config.exec_timeout,
                model: self.model(),
                temperature,
            },
        );

        let report = executor
            .run(&self.bus, &self.cancel, system, seed, 0)
            .await?;
        self.emit_usage(Phase::Repair, report.repair_usage).await;

        result.code = report.final_code.clone();
        result.mesh = report.mesh.clone().unwrap_or_default();
        result.outcome = if report.succeeded() {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        result.attempts = report.attempts;
        Ok(())
    }

    /// Streams a completion, forwarding text chunks as `CodeChunk` events.
    async fn stream_completion(
        &self,
        system: &str,
        user: &str,
        temperature: f64,
    ) -> Result<(String, TokenUsage), PipelineError> {
        let request = CompletionRequest::new(
            self.model(),
            vec![
                ChatMessage::system(system.to_string()),
                ChatMessage::user(user.to_string()),
            ],
        )
        .with_temperature(temperature);

        let mut stream = self
            .cancellable(async { self.llm.stream(request).await.map_err(PipelineError::from) })
            .await?;

        let mut text = String::new();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
            };
            match chunk {
                Some(Ok(CompletionChunk::Text(t))) => {
                    self.bus
                        .send(PipelineEvent::CodeChunk { text: t.clone() })
                        .await;
                    text.push_str(&t);
                }
                Some(Ok(CompletionChunk::Done(usage))) => return Ok((text, usage)),
                Some(Err(e)) => return Err(PipelineError::Provider(e)),
                None => {
                    return Err(PipelineError::Provider(
                        crate::error::LlmError::StreamTruncated,
                    ))
                }
            }
        }
    }

    /// Post-execution review, when enabled and there is something to review.
    async fn maybe_review(
        &self,
        request_text: &str,
        plan: &Plan,
        result: &mut GenerationResult,
    ) -> Result<(), PipelineError> {
        if !self.config.enable_code_review
            || result.code.is_empty()
            || result.outcome == Outcome::Failure
        {
            return Ok(());
        }

        let reviewer = Reviewer::new(Arc::clone(&self.llm), self.model());
        let (report, usage) = self
            .cancellable(reviewer.review(request_text, plan, &result.code))
            .await?;

        self.emit_usage(Phase::Review, usage).await;
        self.bus
            .send(PipelineEvent::ReviewComplete {
                approved: report.approved,
                issues: report.issues,
            })
            .await;
        Ok(())
    }
}
