//! Build steps and the CAD operation vocabulary.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// The closed vocabulary of CAD operations a build step can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Base,
    Extrude,
    Revolve,
    Loft,
    Sweep,
    Shell,
    Fillet,
    Chamfer,
    BooleanUnion,
    BooleanSubtract,
    BooleanIntersect,
    Pattern,
    Hole,
}

impl OperationKind {
    /// Operations that trigger iterative build mode on their own.
    pub const RISKY: [OperationKind; 4] = [
        OperationKind::Shell,
        OperationKind::Loft,
        OperationKind::Sweep,
        OperationKind::Revolve,
    ];

    /// Stable lowercase name, matching the serde representation.
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Base => "base",
            OperationKind::Extrude => "extrude",
            OperationKind::Revolve => "revolve",
            OperationKind::Loft => "loft",
            OperationKind::Sweep => "sweep",
            OperationKind::Shell => "shell",
            OperationKind::Fillet => "fillet",
            OperationKind::Chamfer => "chamfer",
            OperationKind::BooleanUnion => "boolean_union",
            OperationKind::BooleanSubtract => "boolean_subtract",
            OperationKind::BooleanIntersect => "boolean_intersect",
            OperationKind::Pattern => "pattern",
            OperationKind::Hole => "hole",
        }
    }

    /// Whether this operation is a boolean of any flavor.
    pub fn is_boolean(&self) -> bool {
        matches!(
            self,
            OperationKind::BooleanUnion
                | OperationKind::BooleanSubtract
                | OperationKind::BooleanIntersect
        )
    }

    /// Whether this operation triggers iterative mode.
    pub fn is_risky(&self) -> bool {
        Self::RISKY.contains(self)
    }

    /// Detects the operation a step description names.
    ///
    /// Keywords are checked from most to least specific so that e.g.
    /// "drill a hole" does not read as a generic subtract.
    pub fn detect(description: &str) -> OperationKind {
        let lower = description.to_lowercase();

        const KEYWORDS: [(&str, OperationKind); 22] = [
            ("loft", OperationKind::Loft),
            ("sweep", OperationKind::Sweep),
            ("shell", OperationKind::Shell),
            ("hollow", OperationKind::Shell),
            ("revolve", OperationKind::Revolve),
            ("lathe", OperationKind::Revolve),
            ("fillet", OperationKind::Fillet),
            ("round the", OperationKind::Fillet),
            ("chamfer", OperationKind::Chamfer),
            ("bevel", OperationKind::Chamfer),
            ("hole", OperationKind::Hole),
            ("drill", OperationKind::Hole),
            ("bore", OperationKind::Hole),
            ("pattern", OperationKind::Pattern),
            ("array", OperationKind::Pattern),
            ("intersect", OperationKind::BooleanIntersect),
            ("subtract", OperationKind::BooleanSubtract),
            ("cut away", OperationKind::BooleanSubtract),
            ("union", OperationKind::BooleanUnion),
            ("fuse", OperationKind::BooleanUnion),
            ("combine", OperationKind::BooleanUnion),
            ("extrude", OperationKind::Extrude),
        ];

        for (keyword, op) in KEYWORDS {
            if lower.contains(keyword) {
                return op;
            }
        }
        OperationKind::Base
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One ordered step of a build plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    /// Zero-based position in the build plan.
    pub index: usize,
    /// The imperative step description.
    pub description: String,
    /// The operation the description names.
    pub operation: OperationKind,
}

fn numbered_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:\d+[.)]|[-*])\s+(.+)$").expect("valid regex"))
}

/// Extracts ordered build steps from build-plan text.
///
/// A step is a numbered (`1.` / `2)`) or bulleted line. Indices are
/// re-assigned contiguously from zero regardless of the list numbering.
pub fn extract_steps(text: &str) -> Vec<BuildStep> {
    text.lines()
        .filter_map(|line| {
            numbered_line()
                .captures(line)
                .map(|caps| caps[1].trim().to_string())
        })
        .filter(|description| !description.is_empty())
        .enumerate()
        .map(|(index, description)| {
            let operation = OperationKind::detect(&description);
            BuildStep {
                index,
                description,
                operation,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_specific_before_generic() {
        assert_eq!(
            OperationKind::detect("Drill a 5 mm hole and subtract it"),
            OperationKind::Hole
        );
        assert_eq!(
            OperationKind::detect("Subtract the cutting tool"),
            OperationKind::BooleanSubtract
        );
        assert_eq!(
            OperationKind::detect("Loft between the two profiles"),
            OperationKind::Loft
        );
        assert_eq!(
            OperationKind::detect("Create the base cylinder"),
            OperationKind::Base
        );
        assert_eq!(
            OperationKind::detect("Shell the body to 2 mm walls"),
            OperationKind::Shell
        );
    }

    #[test]
    fn test_boolean_and_risky_predicates() {
        assert!(OperationKind::BooleanSubtract.is_boolean());
        assert!(!OperationKind::Fillet.is_boolean());
        assert!(OperationKind::Loft.is_risky());
        assert!(!OperationKind::Extrude.is_risky());
    }

    #[test]
    fn test_extract_steps_numbering_styles() {
        let text = "\
1. Create the base box
2) Extrude the boss
- Fillet the edges
* Drill the mounting hole
not a step line
";
        let steps = extract_steps(text);
        assert_eq!(steps.len(), 4);
        assert_eq!(
            steps.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(steps[3].operation, OperationKind::Hole);
    }

    #[test]
    fn test_extract_steps_empty() {
        assert!(extract_steps("no list here").is_empty());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&OperationKind::BooleanSubtract).unwrap();
        assert_eq!(json, "\"boolean_subtract\"");
        let parsed: OperationKind = serde_json::from_str("\"loft\"").unwrap();
        assert_eq!(parsed, OperationKind::Loft);
    }
}
