//! The typed event protocol from the pipeline to the caller.
//!
//! One bounded single-producer single-consumer channel per run. Event
//! order is meaningful: events are emitted in state-transition order and
//! the channel never reorders or drops them; a slow consumer blocks the
//! producer.

use tokio::sync::mpsc;

use crate::generation::ExtractorTier;
use crate::llm::TokenUsage;
use crate::plan::{ConfidenceBand, Plan};
use crate::recovery::ErrorCategory;

use super::{Outcome, RunId};

/// Which pipeline phase a token-usage event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planning,
    Generation,
    Repair,
    Review,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Planning => write!(f, "planning"),
            Phase::Generation => write!(f, "generation"),
            Phase::Repair => write!(f, "repair"),
            Phase::Review => write!(f, "review"),
        }
    }
}

/// Every observable transition of the pipeline state machine.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    PlanStarted,
    PlanChunk {
        text: String,
    },
    PlanComplete {
        plan: Plan,
    },
    PlanRejected {
        reason: String,
    },
    ConfidenceComputed {
        score: u8,
        band: ConfidenceBand,
    },
    CodeStarted,
    CodeChunk {
        text: String,
    },
    CodeExtracted {
        code: String,
        extractor_tier: ExtractorTier,
    },
    ValidationAttempt {
        index: usize,
    },
    ValidationSuccess {
        mesh_bytes: usize,
    },
    ValidationFailed {
        category: ErrorCategory,
        message: String,
        line: Option<u32>,
    },
    StepStarted {
        index: usize,
        description: String,
    },
    StepComplete {
        index: usize,
        code: String,
    },
    StepSkipped {
        index: usize,
        reason: String,
    },
    ConsensusChild {
        child_index: usize,
        sub_event: Box<PipelineEvent>,
    },
    ReviewComplete {
        approved: bool,
        issues: Vec<String>,
    },
    TokenUsage {
        phase: Phase,
        usage: TokenUsage,
        cost_estimate: f64,
    },
    Done {
        outcome: Outcome,
        final_code: String,
        final_mesh: Option<Vec<u8>>,
    },
    Cancelled,
    Error {
        fatal_reason: String,
    },
}

impl PipelineEvent {
    /// Whether this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::Done { .. } | PipelineEvent::Cancelled | PipelineEvent::Error { .. }
        )
    }
}

/// An event tagged with its run.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub run_id: RunId,
    pub event: PipelineEvent,
}

/// The consumer half of a run's event channel.
pub type EventStream = mpsc::Receiver<EventEnvelope>;

/// Default channel capacity before back-pressure blocks the producer.
const DEFAULT_CAPACITY: usize = 64;

/// The producer half of a run's event channel.
///
/// Cloning shares the underlying channel; a clone created through
/// [`EventBus::child`] wraps every event in `ConsensusChild` so a parent
/// can aggregate child streams without interleaving their payloads.
#[derive(Clone)]
pub struct EventBus {
    run_id: RunId,
    tx: mpsc::Sender<EventEnvelope>,
    child_index: Option<usize>,
}

impl EventBus {
    /// Creates a bus/stream pair for one run.
    pub fn channel(run_id: RunId) -> (EventBus, EventStream) {
        Self::channel_with_capacity(run_id, DEFAULT_CAPACITY)
    }

    /// Creates a bus/stream pair with an explicit capacity.
    pub fn channel_with_capacity(run_id: RunId, capacity: usize) -> (EventBus, EventStream) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            EventBus {
                run_id,
                tx,
                child_index: None,
            },
            rx,
        )
    }

    /// The run this bus belongs to.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// A bus for a consensus child: events are wrapped with the child
    /// index before being forwarded.
    pub fn child(&self, child_index: usize) -> EventBus {
        EventBus {
            run_id: self.run_id,
            tx: self.tx.clone(),
            child_index: Some(child_index),
        }
    }

    /// Emits an event, blocking on back-pressure.
    ///
    /// A dropped receiver is not an error: the caller has abandoned the
    /// stream and the pipeline still runs to completion for its result.
    pub async fn send(&self, event: PipelineEvent) {
        let event = match self.child_index {
            Some(child_index) => PipelineEvent::ConsensusChild {
                child_index,
                sub_event: Box::new(event),
            },
            None => event,
        };

        let _ = self
            .tx
            .send(EventEnvelope {
                run_id: self.run_id,
                event,
            })
            .await;
    }
}
