//! The generation pipeline: orchestration state machine, execution loop,
//! iterative builder, consensus selection, session memory and the event
//! protocol.

pub mod consensus;
pub mod events;
pub mod executor;
pub mod iterative;
pub mod orchestrator;
pub mod reviewer;
pub mod session;

pub use consensus::{Consensus, ConsensusConfig};
pub use events::{EventBus, EventEnvelope, EventStream, Phase, PipelineEvent};
pub use executor::{Executor, ExecutorConfig, ExecutionReport, SeedAttempt};
pub use iterative::{IterativeBuilder, IterativeConfig};
pub use orchestrator::{Pipeline, PipelineOptions, RunHandle};
pub use reviewer::{Reviewer, ReviewReport};
pub use session::{SessionEntry, SessionMemory};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;
use crate::recovery::ClassifiedError;

/// A monotonically increasing pipeline run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub u64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// An immutable user request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRequest {
    /// The natural-language request text.
    pub text: String,
    /// Existing code, present when the user is modifying a part.
    pub existing_code: Option<String>,
    /// Rule preset override for this request.
    pub preset_id: Option<String>,
}

impl UserRequest {
    /// Creates a plain generation request.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            existing_code: None,
            preset_id: None,
        }
    }

    /// Attaches existing code, switching the run to modification mode.
    pub fn with_existing_code(mut self, code: impl Into<String>) -> Self {
        self.existing_code = Some(code.into());
        self
    }

    /// Selects a rule preset.
    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset_id = Some(preset.into());
        self
    }

    /// Whether the request modifies existing code.
    pub fn is_modification(&self) -> bool {
        self.existing_code.is_some()
    }
}

/// Outcome of one generate/execute attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Execution produced a mesh.
    Success { mesh: Vec<u8> },
    /// Execution failed with a classified error.
    Failure(ClassifiedError),
    /// The attempt was not executed.
    Skipped,
}

impl AttemptOutcome {
    /// Whether the attempt succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success { .. })
    }
}

/// One (generate, execute) pair.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Zero-based attempt index, contiguous within a run.
    pub index: usize,
    /// The prompt sent for this attempt.
    pub prompt: String,
    /// The raw model response.
    pub raw_response: String,
    /// The extracted code.
    pub code: String,
    /// What execution did.
    pub outcome: AttemptOutcome,
    /// Token usage of the generation call.
    pub usage: TokenUsage,
    /// Wall-clock duration of the attempt.
    pub duration: Duration,
    /// Sampling temperature used.
    pub temperature: f64,
}

/// Overall outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    PartialSuccess,
    Failure,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::PartialSuccess => write!(f, "partial_success"),
            Outcome::Failure => write!(f, "failure"),
        }
    }
}

/// Final result of a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct GenerationResult {
    /// The final code (last attempt's code, even on failure).
    pub code: String,
    /// The final mesh bytes; empty on failure.
    pub mesh: Vec<u8>,
    /// Ordered attempts, indices contiguous from zero.
    pub attempts: Vec<Attempt>,
    /// Indices of skipped build steps (iterative mode).
    pub skipped_steps: Vec<usize>,
    /// Overall outcome.
    pub outcome: Outcome,
}

impl Default for Outcome {
    fn default() -> Self {
        Outcome::Failure
    }
}

impl GenerationResult {
    /// The dominant failure category, when the run failed.
    pub fn failure_category(&self) -> Option<&ClassifiedError> {
        self.attempts.iter().rev().find_map(|a| match &a.outcome {
            AttemptOutcome::Failure(error) => Some(error),
            _ => None,
        })
    }

    /// Total token usage across attempts.
    pub fn total_usage(&self) -> TokenUsage {
        self.attempts
            .iter()
            .fold(TokenUsage::default(), |acc, a| acc.add(a.usage))
    }
}
