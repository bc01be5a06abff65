//! CLI commands: run the pipeline from a terminal without the desktop
//! shell, streaming events as log lines.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::AppConfig;
use crate::llm::build_client;
use crate::pipeline::{
    Pipeline, PipelineEvent, PipelineOptions, SessionMemory, UserRequest,
};
use crate::rules::RuleStore;
use crate::runner::ProcessCadRunner;

/// AI CAD code generation pipeline.
#[derive(Debug, Parser)]
#[command(name = "cad-forge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a part from a natural-language request.
    Generate {
        /// The request, e.g. "M5 bolt head, no threads".
        request: String,

        /// Enable consensus mode for this run.
        #[arg(long)]
        consensus: bool,

        /// Rule preset to use.
        #[arg(long)]
        preset: Option<String>,

        /// Attempt budget (1..=5).
        #[arg(long)]
        max_attempts: Option<u8>,

        /// Generate code without executing it.
        #[arg(long)]
        no_execute: bool,

        /// Existing code file to modify instead of generating from scratch.
        #[arg(long)]
        code: Option<PathBuf>,

        /// Where to write the final mesh.
        #[arg(long, default_value = "result.stl")]
        output: PathBuf,
    },

    /// List rule presets available in the store.
    Presets,
}

impl Cli {
    /// Executes the parsed command.
    pub async fn execute(self) -> anyhow::Result<()> {
        let config = AppConfig::from_env().context("loading configuration")?;

        match self.command {
            Command::Generate {
                request,
                consensus,
                preset,
                max_attempts,
                no_execute,
                code,
                output,
            } => {
                let llm = build_client(&config).context("building LLM client")?;
                let runner = Arc::new(ProcessCadRunner::new(&config.runner_command));
                let rules = Arc::new(RuleStore::new(&config.rules_path));
                let pipeline = Pipeline::new(config.clone(), llm, runner, rules)
                    .context("building pipeline")?;

                let mut user_request = UserRequest::new(request);
                if let Some(path) = code {
                    let existing = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    user_request = user_request.with_existing_code(existing);
                }
                if let Some(preset) = preset {
                    user_request = user_request.with_preset(preset);
                }

                let options = PipelineOptions {
                    consensus,
                    auto_execute: !no_execute,
                    max_attempts: max_attempts.unwrap_or(config.max_attempts),
                    ..PipelineOptions::default()
                };

                let mut handle = pipeline.run(user_request, options, SessionMemory::new());

                while let Some(envelope) = handle.events.recv().await {
                    log_event(&envelope.event);
                }

                let (result, _memory) = handle.outcome.await.context("pipeline task")?;

                println!("outcome: {}", result.outcome);
                println!("attempts: {}", result.attempts.len());
                if !result.code.is_empty() {
                    println!("--- final code ---\n{}", result.code);
                }
                if !result.mesh.is_empty() {
                    std::fs::write(&output, &result.mesh)
                        .with_context(|| format!("writing {}", output.display()))?;
                    println!("mesh: {} bytes -> {}", result.mesh.len(), output.display());
                }
                Ok(())
            }

            Command::Presets => {
                let store = RuleStore::new(&config.rules_path);
                for preset in store.available_presets() {
                    println!("{}", preset);
                }
                Ok(())
            }
        }
    }
}

/// Renders one pipeline event as a log line. Chunk events are skipped to
/// keep terminal output readable.
fn log_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::PlanStarted => tracing::info!("planning started"),
        PipelineEvent::PlanComplete { plan } => {
            tracing::info!(steps = plan.build_steps().len(), "plan complete")
        }
        PipelineEvent::PlanRejected { reason } => tracing::warn!(%reason, "plan rejected"),
        PipelineEvent::ConfidenceComputed { score, band } => {
            tracing::info!(score, %band, "confidence")
        }
        PipelineEvent::CodeStarted => tracing::info!("generation started"),
        PipelineEvent::CodeExtracted {
            code,
            extractor_tier,
        } => tracing::info!(lines = code.lines().count(), tier = %extractor_tier, "code extracted"),
        PipelineEvent::ValidationAttempt { index } => {
            tracing::info!(attempt = index, "executing")
        }
        PipelineEvent::ValidationSuccess { mesh_bytes } => {
            tracing::info!(mesh_bytes, "execution succeeded")
        }
        PipelineEvent::ValidationFailed {
            category,
            message,
            line,
        } => tracing::warn!(%category, line = ?line, %message, "execution failed"),
        PipelineEvent::StepStarted { index, description } => {
            tracing::info!(step = index, %description, "step started")
        }
        PipelineEvent::StepComplete { index, .. } => tracing::info!(step = index, "step complete"),
        PipelineEvent::StepSkipped { index, reason } => {
            tracing::warn!(step = index, %reason, "step skipped")
        }
        PipelineEvent::ConsensusChild {
            child_index,
            sub_event,
        } => {
            tracing::debug!(child = child_index, "consensus child event");
            log_event(sub_event);
        }
        PipelineEvent::ReviewComplete { approved, issues } => {
            tracing::info!(approved, issues = issues.len(), "review complete")
        }
        PipelineEvent::TokenUsage {
            phase,
            usage,
            cost_estimate,
        } => tracing::info!(
            %phase,
            prompt = usage.prompt_tokens,
            completion = usage.completion_tokens,
            cost_usd = format!("{:.4}", cost_estimate),
            "token usage"
        ),
        PipelineEvent::Done { outcome, .. } => tracing::info!(%outcome, "done"),
        PipelineEvent::Cancelled => tracing::warn!("cancelled"),
        PipelineEvent::Error { fatal_reason } => tracing::error!(%fatal_reason, "pipeline error"),
        PipelineEvent::PlanChunk { .. } | PipelineEvent::CodeChunk { .. } => {}
    }
}
