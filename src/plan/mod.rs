//! Design plans: authorship, parsing, validation and confidence.
//!
//! A [`Plan`] is free-form text partitioned into labelled sections. The
//! `Build Plan` section is an ordered numbered list of build steps, each a
//! sentence beginning with a verb and naming an operation.

pub mod confidence;
pub mod planner;
pub mod steps;
pub mod validator;

pub use confidence::{Confidence, ConfidenceBand, ConfidenceReport};
pub use planner::{Planner, PlannerConfig};
pub use steps::{BuildStep, OperationKind};
pub use validator::{PlanValidator, PlanVerdict};

use serde::{Deserialize, Serialize};

/// Section labels a plan is expected to carry.
pub const REQUIRED_SECTIONS: [&str; 4] = [
    "Object Analysis",
    "Approach",
    "Build Plan",
    "Approximation Notes",
];

/// A design plan produced by the planner.
///
/// The text is the source of truth; sections and build steps are parsed on
/// demand and never mutated in place. Re-planning produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    text: String,
}

impl Plan {
    /// Wraps raw plan text.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// The full plan text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether the plan has no content.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Returns the body of a labelled section, if present.
    ///
    /// A section starts at a line containing the label (optionally prefixed
    /// with `#` heading markers or numbering) and runs until the next
    /// section label or the end of the plan.
    pub fn section(&self, label: &str) -> Option<String> {
        let lines: Vec<&str> = self.text.lines().collect();
        let start = lines.iter().position(|line| is_section_heading(line, label))?;

        let mut body = Vec::new();
        for line in &lines[start + 1..] {
            if REQUIRED_SECTIONS
                .iter()
                .any(|other| is_section_heading(line, other))
            {
                break;
            }
            body.push(*line);
        }

        Some(body.join("\n").trim().to_string())
    }

    /// Labels of required sections missing from this plan.
    pub fn missing_sections(&self) -> Vec<&'static str> {
        REQUIRED_SECTIONS
            .iter()
            .copied()
            .filter(|label| self.section(label).is_none())
            .collect()
    }

    /// The ordered build steps parsed from the `Build Plan` section.
    ///
    /// Falls back to scanning the whole plan when the section label is
    /// absent, so a minimally formatted plan still yields steps.
    pub fn build_steps(&self) -> Vec<BuildStep> {
        let source = self
            .section("Build Plan")
            .unwrap_or_else(|| self.text.clone());
        steps::extract_steps(&source)
    }

    /// The distinct operations the plan uses, in first-use order.
    pub fn operations(&self) -> Vec<OperationKind> {
        let mut seen = Vec::new();
        for step in self.build_steps() {
            if !seen.contains(&step.operation) {
                seen.push(step.operation);
            }
        }
        seen
    }
}

/// Matches a line like `## Build Plan`, `Build Plan:` or `3. Build Plan`.
fn is_section_heading(line: &str, label: &str) -> bool {
    let trimmed = line
        .trim()
        .trim_start_matches('#')
        .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
        .trim();
    trimmed
        .strip_prefix(label)
        .map(|rest| rest.trim_start().is_empty() || rest.trim_start().starts_with(':'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
## Object Analysis
A mounting bracket with two holes.

## Approach
Extrude the profile, then drill.

## Build Plan
1. Create the base plate as a 60x40x5 box
2. Extrude a 10 mm boss on the top face
3. Drill two 5 mm holes through the plate
4. Fillet the outer edges with radius 2 mm

## Approximation Notes
Hole chamfers omitted.
";

    #[test]
    fn test_section_extraction() {
        let plan = Plan::new(SAMPLE);

        let approach = plan.section("Approach").unwrap();
        assert_eq!(approach, "Extrude the profile, then drill.");

        let analysis = plan.section("Object Analysis").unwrap();
        assert!(analysis.contains("bracket"));

        assert!(plan.section("Nonexistent").is_none());
        assert!(plan.missing_sections().is_empty());
    }

    #[test]
    fn test_section_heading_variants() {
        assert!(is_section_heading("## Build Plan", "Build Plan"));
        assert!(is_section_heading("Build Plan:", "Build Plan"));
        assert!(is_section_heading("3. Build Plan", "Build Plan"));
        assert!(!is_section_heading("The Build Planner", "Build Plan"));
        assert!(!is_section_heading("a Build Plan entry", "Build Plan"));
    }

    #[test]
    fn test_build_steps_parsed_in_order() {
        let plan = Plan::new(SAMPLE);
        let steps = plan.build_steps();

        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].index, 0);
        assert_eq!(steps[0].operation, OperationKind::Base);
        assert_eq!(steps[1].operation, OperationKind::Extrude);
        assert_eq!(steps[2].operation, OperationKind::Hole);
        assert_eq!(steps[3].operation, OperationKind::Fillet);
    }

    #[test]
    fn test_missing_sections_reported() {
        let plan = Plan::new("## Build Plan\n1. Create a box");
        let missing = plan.missing_sections();
        assert_eq!(
            missing,
            vec!["Object Analysis", "Approach", "Approximation Notes"]
        );
    }

    #[test]
    fn test_operations_dedup() {
        let plan = Plan::new(
            "## Build Plan\n1. Fillet edge A with radius 1\n2. Fillet edge B with radius 2",
        );
        assert_eq!(plan.operations(), vec![OperationKind::Fillet]);
    }

    #[test]
    fn test_empty_plan() {
        assert!(Plan::new("   \n ").is_empty());
        assert!(!Plan::new(SAMPLE).is_empty());
    }
}
