//! Pre-execution success estimation.
//!
//! The estimate is a heuristic over the validated plan and the cookbook:
//! low plan risk plus a close match to a known-good recipe predicts
//! success; an unfamiliar operation set predicts trouble.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::rules::CookbookRecipe;

use super::{OperationKind, Plan};

/// Traffic-light band for a confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    Green,
    Yellow,
    Red,
}

impl ConfidenceBand {
    /// Band thresholds: green ≥ 75, yellow 40..=74, red < 40.
    pub fn from_score(score: u8) -> Self {
        match score {
            75..=100 => ConfidenceBand::Green,
            40..=74 => ConfidenceBand::Yellow,
            _ => ConfidenceBand::Red,
        }
    }
}

impl std::fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfidenceBand::Green => write!(f, "green"),
            ConfidenceBand::Yellow => write!(f, "yellow"),
            ConfidenceBand::Red => write!(f, "red"),
        }
    }
}

/// A confidence estimate for one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceReport {
    /// Score in 0..=100.
    pub score: u8,
    /// Band derived from the score.
    pub band: ConfidenceBand,
}

impl ConfidenceReport {
    fn from_score(score: i32) -> Self {
        let score = score.clamp(0, 100) as u8;
        Self {
            score,
            band: ConfidenceBand::from_score(score),
        }
    }

    /// Post-execution adjustment: success raises the estimate by 10,
    /// failure drops it by 20, both clamped.
    pub fn after_outcome(self, success: bool) -> Self {
        let delta = if success { 10 } else { -20 };
        Self::from_score(self.score as i32 + delta)
    }
}

/// Confidence estimator.
#[derive(Debug, Default)]
pub struct Confidence;

impl Confidence {
    /// Creates an estimator.
    pub fn new() -> Self {
        Self
    }

    /// Estimates success likelihood before execution.
    ///
    /// `base = 100 − 10·risk_score`, plus a cookbook match bonus in
    /// `[-15, +15]` from operation-set overlap and title keyword match,
    /// clamped to `[0, 100]`.
    pub fn estimate(
        &self,
        request_text: &str,
        plan: &Plan,
        risk_score: u8,
        cookbook: &[&CookbookRecipe],
    ) -> ConfidenceReport {
        let base = 100 - 10 * risk_score as i32;
        let bonus = cookbook_bonus(request_text, plan, cookbook);
        ConfidenceReport::from_score(base + bonus)
    }
}

/// Cookbook match bonus in `[-15, +15]`.
///
/// The best-matching recipe contributes up to 10 points of operation-set
/// overlap and 5 for a title keyword hit. An entirely unfamiliar operation
/// set against a non-empty cookbook costs the full 15.
fn cookbook_bonus(request_text: &str, plan: &Plan, cookbook: &[&CookbookRecipe]) -> i32 {
    if cookbook.is_empty() {
        return 0;
    }

    let plan_ops: BTreeSet<OperationKind> = plan.operations().into_iter().collect();
    let keywords = significant_words(request_text);

    let mut best = 0i32;
    for recipe in cookbook {
        let recipe_ops: BTreeSet<OperationKind> = recipe.operations.iter().copied().collect();
        let overlap = jaccard(&plan_ops, &recipe_ops);

        let title = recipe.title.to_lowercase();
        let title_hit = keywords.iter().any(|word| title.contains(word.as_str()));

        let score = (overlap * 10.0).round() as i32 + if title_hit { 5 } else { 0 };
        best = best.max(score);
    }

    if best == 0 {
        -15
    } else {
        best.min(15)
    }
}

fn jaccard(a: &BTreeSet<OperationKind>, b: &BTreeSet<OperationKind>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn significant_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() > 3)
        .map(|word| word.to_lowercase())
        .collect()
}
