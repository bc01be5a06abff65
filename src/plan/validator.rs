//! Deterministic plan validation.
//!
//! No LLM involvement: the validator extracts declared dimensions and the
//! operation sequence from the plan text and computes a risk score from
//! fixed weights. Rejection is rule-driven, not opinion-driven.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use super::{OperationKind, Plan};

/// Risk score above which a plan is rejected.
const REJECT_THRESHOLD: u8 = 7;

/// Dimensional feasibility range in millimetres.
const MIN_DIMENSION_MM: f64 = 0.01;
const MAX_DIMENSION_MM: f64 = 10_000.0;

/// Fillet radii above this fraction of the smallest declared dimension are
/// penalized.
const FILLET_RADIUS_FRACTION: f64 = 0.25;

/// Verdict of a validation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanVerdict {
    /// Whether the plan may proceed.
    pub is_valid: bool,
    /// Risk score in 0..=10.
    pub risk_score: u8,
    /// Advisory findings that did not cause rejection.
    pub warnings: Vec<String>,
    /// Why the plan was rejected, when it was.
    pub rejected_reason: Option<String>,
}

impl PlanVerdict {
    fn rejected(risk_score: u8, warnings: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            risk_score,
            warnings,
            rejected_reason: Some(reason.into()),
        }
    }
}

/// Deterministic plan validator.
#[derive(Debug, Default)]
pub struct PlanValidator;

impl PlanValidator {
    /// Creates a validator.
    pub fn new() -> Self {
        Self
    }

    /// Scores a plan for feasibility and risk.
    ///
    /// Same plan text always yields the same verdict.
    pub fn validate(&self, plan: &Plan) -> PlanVerdict {
        if plan.is_empty() {
            return PlanVerdict::rejected(10, Vec::new(), "empty plan");
        }

        let steps = plan.build_steps();
        if steps.is_empty() {
            return PlanVerdict::rejected(10, Vec::new(), "plan has no build steps");
        }

        let mut warnings = Vec::new();
        let mut score: u32 = 0;

        // Per-operation weights.
        for step in &steps {
            score += operation_weight(step.operation) as u32;
        }

        // Shell after a long boolean chain is a known kernel killer.
        let mut booleans_seen = 0usize;
        for step in &steps {
            if step.operation.is_boolean() || step.operation == OperationKind::Hole {
                booleans_seen += 1;
            }
            if step.operation == OperationKind::Shell && booleans_seen > 3 {
                score += 3;
                warnings.push(format!(
                    "shell at step {} follows {} boolean operations",
                    step.index + 1,
                    booleans_seen
                ));
                break;
            }
        }

        // Oversized fillet radii relative to the smallest declared dimension.
        let dimensions = extract_dimensions_mm(plan.text());
        if let Some(smallest) = dimensions.iter().copied().reduce(f64::min) {
            let limit = smallest * FILLET_RADIUS_FRACTION;
            for step in &steps {
                if step.operation != OperationKind::Fillet {
                    continue;
                }
                for radius in extract_dimensions_mm(&step.description) {
                    if radius > limit {
                        score += 2;
                        warnings.push(format!(
                            "fillet radius {:.3} mm exceeds {:.0}% of smallest dimension {:.3} mm",
                            radius,
                            FILLET_RADIUS_FRACTION * 100.0,
                            smallest
                        ));
                    }
                }
            }
        }

        // Missing required sections.
        let missing = plan.missing_sections();
        score += missing.len() as u32;
        for label in &missing {
            warnings.push(format!("missing section: {}", label));
        }

        // Dimensional feasibility is asserted, not scored.
        for dim in &dimensions {
            if !(MIN_DIMENSION_MM..=MAX_DIMENSION_MM).contains(dim) {
                warnings.push(format!(
                    "dimension {:.4} mm outside feasible range {}..{} mm",
                    dim, MIN_DIMENSION_MM, MAX_DIMENSION_MM
                ));
            }
        }

        let risk_score = score.min(10) as u8;

        if risk_score > REJECT_THRESHOLD {
            let reason = if warnings.is_empty() {
                format!("risk score {} exceeds threshold {}", risk_score, REJECT_THRESHOLD)
            } else {
                format!(
                    "risk score {} exceeds threshold {}: {}",
                    risk_score,
                    REJECT_THRESHOLD,
                    warnings.join("; ")
                )
            };
            return PlanVerdict::rejected(risk_score, warnings, reason);
        }

        PlanVerdict {
            is_valid: true,
            risk_score,
            warnings,
            rejected_reason: None,
        }
    }
}

/// Weight each operation contributes to the risk score.
fn operation_weight(op: OperationKind) -> u8 {
    match op {
        OperationKind::Base => 0,
        OperationKind::Extrude => 1,
        OperationKind::Fillet => 2,
        OperationKind::Chamfer => 1,
        OperationKind::Shell => 2,
        OperationKind::Sweep => 3,
        OperationKind::Loft => 3,
        OperationKind::Revolve => 2,
        OperationKind::BooleanUnion
        | OperationKind::BooleanSubtract
        | OperationKind::BooleanIntersect => 1,
        OperationKind::Pattern => 1,
        OperationKind::Hole => 1,
    }
}

fn dimension_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+(?:\.\d+)?)\s*(mm|cm|m)\b").expect("valid regex")
    })
}

/// Extracts declared dimensions from text, normalized to millimetres.
fn extract_dimensions_mm(text: &str) -> Vec<f64> {
    dimension_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let value: f64 = caps[1].parse().ok()?;
            let scale = match &caps[2] {
                "mm" => 1.0,
                "cm" => 10.0,
                "m" => 1000.0,
                _ => return None,
            };
            Some(value * scale)
        })
        .collect()
}
