//! Per-conversation session memory.
//!
//! An append-only record of prior generation outcomes, rendered into every
//! system prompt so the model stops repeating failed approaches. The
//! caller (the chat session) owns the single mutable cell; the pipeline
//! receives the memory by value and returns it with one entry appended.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::OperationKind;

use super::{GenerationResult, Outcome};

/// Characters of the request kept as the fingerprint.
const FINGERPRINT_LEN: usize = 80;

/// One remembered run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    /// First 80 characters of the request.
    pub request_summary: String,
    /// Operations the plan used.
    pub operations: Vec<OperationKind>,
    /// How the run ended.
    pub outcome: Outcome,
    /// Dominant failure category, when the run failed.
    pub failure_category: Option<String>,
    /// Total run duration.
    pub duration: Duration,
    /// When the run finished.
    pub recorded_at: DateTime<Utc>,
}

/// Append-only conversation memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMemory {
    entries: Vec<SessionEntry>,
}

impl SessionMemory {
    /// Creates empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of remembered runs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the conversation has no history yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The remembered entries, oldest first.
    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    /// Appends an entry for a finished run.
    pub fn record(
        &mut self,
        request_text: &str,
        operations: Vec<OperationKind>,
        result: &GenerationResult,
        duration: Duration,
    ) {
        let request_summary: String = request_text.chars().take(FINGERPRINT_LEN).collect();
        self.entries.push(SessionEntry {
            request_summary,
            operations,
            outcome: result.outcome,
            failure_category: result
                .failure_category()
                .map(|error| error.category.name().to_string()),
            duration,
            recorded_at: Utc::now(),
        });
    }

    /// Explicit conversation reset: the only way entries are removed.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Renders the memory as a prompt section.
    ///
    /// Returns `None` for an empty conversation so the prompt builder can
    /// omit the section entirely.
    pub fn render(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }

        let mut lines = vec!["Previous attempts in this session:".to_string()];
        for (i, entry) in self.entries.iter().enumerate() {
            let ops = if entry.operations.is_empty() {
                "unknown operations".to_string()
            } else {
                entry
                    .operations
                    .iter()
                    .map(|op| op.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            };

            let status = match (&entry.outcome, &entry.failure_category) {
                (Outcome::Failure, Some(category)) => format!("failed ({})", category),
                (Outcome::Failure, None) => "failed".to_string(),
                (Outcome::PartialSuccess, _) => "partially succeeded".to_string(),
                (Outcome::Success, _) => "succeeded".to_string(),
            };

            lines.push(format!(
                "{}. \"{}\" using [{}] — {} in {:.1}s",
                i + 1,
                entry.request_summary,
                ops,
                status,
                entry.duration.as_secs_f64()
            ));
        }

        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{ClassifiedError, ErrorCategory};
    use crate::pipeline::{Attempt, AttemptOutcome};
    use crate::llm::TokenUsage;

    fn failed_result() -> GenerationResult {
        GenerationResult {
            outcome: Outcome::Failure,
            attempts: vec![Attempt {
                index: 0,
                prompt: String::new(),
                raw_response: String::new(),
                code: String::new(),
                outcome: AttemptOutcome::Failure(ClassifiedError {
                    category: ErrorCategory::Topology {
                        operation: OperationKind::Fillet,
                    },
                    line: Some(9),
                    message: "fillet failed".into(),
                    operation: Some("fillet".into()),
                }),
                usage: TokenUsage::default(),
                duration: Duration::ZERO,
                temperature: 0.3,
            }],
            ..GenerationResult::default()
        }
    }

    #[test]
    fn test_empty_memory_renders_nothing() {
        assert!(SessionMemory::new().render().is_none());
    }

    #[test]
    fn test_record_and_render() {
        let mut memory = SessionMemory::new();
        memory.record(
            "a 20 mm cube with filleted edges",
            vec![OperationKind::Base, OperationKind::Fillet],
            &failed_result(),
            Duration::from_secs(12),
        );

        let rendered = memory.render().unwrap();
        assert!(rendered.starts_with("Previous attempts in this session:"));
        assert!(rendered.contains("1. \"a 20 mm cube"));
        assert!(rendered.contains("base, fillet"));
        assert!(rendered.contains("failed (topology)"));
    }

    #[test]
    fn test_fingerprint_truncated() {
        let mut memory = SessionMemory::new();
        let long_request = "x".repeat(200);
        memory.record(&long_request, vec![], &failed_result(), Duration::ZERO);

        assert_eq!(memory.entries()[0].request_summary.len(), 80);
    }

    #[test]
    fn test_append_only_until_reset() {
        let mut memory = SessionMemory::new();
        memory.record("one", vec![], &failed_result(), Duration::ZERO);
        memory.record("two", vec![], &failed_result(), Duration::ZERO);
        assert_eq!(memory.len(), 2);

        memory.reset();
        assert!(memory.is_empty());
    }

    #[test]
    fn test_success_entry() {
        let mut memory = SessionMemory::new();
        let result = GenerationResult {
            outcome: Outcome::Success,
            ..GenerationResult::default()
        };
        memory.record("a bracket", vec![OperationKind::Base], &result, Duration::from_secs(3));

        let rendered = memory.render().unwrap();
        assert!(rendered.contains("succeeded"));
        assert!(!rendered.contains("failed"));
    }
}
