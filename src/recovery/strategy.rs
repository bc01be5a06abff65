//! The retry strategy table.
//!
//! Maps a classified failure plus the retry ordinal to a prompt prefix, a
//! forbidden-operation set and a simplification level. Pure and
//! deterministic; the executor owns all state.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::plan::OperationKind;

use super::classifier::{ClassifiedError, ErrorCategory};

/// Operations forbidden in primitives-only mode.
///
/// What remains is the survivable core: base shapes, extrudes, booleans
/// and plain holes.
const PRIMITIVES_FORBIDDEN: [OperationKind; 7] = [
    OperationKind::Shell,
    OperationKind::Loft,
    OperationKind::Sweep,
    OperationKind::Revolve,
    OperationKind::Fillet,
    OperationKind::Chamfer,
    OperationKind::Pattern,
];

/// A retry strategy: how the next prompt attacks the failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Instruction prefix for the retry prompt.
    pub prompt_prefix: String,
    /// Operations the retry must not use.
    pub forbidden_operations: BTreeSet<OperationKind>,
    /// 0 = surgical fix, 1 = replace the failing operation, 2 = primitives only.
    pub simplification_level: u8,
    /// Retries permitted at this level before escalating.
    pub max_retries: u8,
}

impl RetryStrategy {
    /// Selects the strategy for a failure and retry ordinal (1-based).
    ///
    /// Returns `None` when the table is terminal for this category: the
    /// caller gives up and surfaces the failure.
    pub fn select(error: &ClassifiedError, attempt: u8) -> Option<RetryStrategy> {
        if attempt == 0 || attempt > 3 {
            return None;
        }

        let (prefix, forbidden, level): (String, Vec<OperationKind>, u8) =
            match (&error.category, attempt) {
                // Syntax: surgical, then re-plan the statement, then primitives.
                (ErrorCategory::Syntax, 1) => (
                    match error.line {
                        Some(line) => format!(
                            "The script has a syntax error on line {}. Repair that line only; change nothing else.",
                            line
                        ),
                        None => "The script has a syntax error. Repair it with the smallest possible edit.".to_string(),
                    },
                    vec![],
                    0,
                ),
                (ErrorCategory::Syntax, 2) => (
                    "The syntax error persists. Rewrite the failing statement from scratch instead of patching it."
                        .to_string(),
                    vec![],
                    1,
                ),

                // Fillets: shrink, then drop, then primitives.
                (ErrorCategory::Topology { operation: OperationKind::Fillet }, 1) => (
                    "The fillet failed in the kernel. Halve every fillet radius and try again.".to_string(),
                    vec![],
                    1,
                ),
                (ErrorCategory::Topology { operation: OperationKind::Fillet }, 2) => (
                    "The fillet still fails. Remove the fillet calls on the failing edges entirely.".to_string(),
                    vec![OperationKind::Fillet],
                    1,
                ),

                // Chamfers behave like fillets.
                (ErrorCategory::Topology { operation: OperationKind::Chamfer }, 1) => (
                    "The chamfer failed in the kernel. Halve every chamfer distance and try again.".to_string(),
                    vec![],
                    1,
                ),
                (ErrorCategory::Topology { operation: OperationKind::Chamfer }, 2) => (
                    "The chamfer still fails. Remove the chamfer calls on the failing edges entirely.".to_string(),
                    vec![OperationKind::Chamfer],
                    1,
                ),

                // Shell: replace with manual hollowing, then simplify it.
                (ErrorCategory::Topology { operation: OperationKind::Shell }, 1) => (
                    "The shell operation failed. Replace it with a manual subtraction of a scaled inner box to hollow the part.".to_string(),
                    vec![OperationKind::Shell],
                    1,
                ),
                (ErrorCategory::Topology { operation: OperationKind::Shell }, 2) => (
                    "Hollowing still fails. Simplify the hollowing strategy: subtract one plain inner volume, keep walls thick and uniform.".to_string(),
                    vec![OperationKind::Shell],
                    1,
                ),

                // Booleans: nudge the tool, then merge bodies first.
                (ErrorCategory::Topology { operation }, 1) if operation.is_boolean() => (
                    "The boolean operation failed. Extend the cutting tool by 1 unit beyond every face it must cut through, so the intersection is unambiguous.".to_string(),
                    vec![],
                    0,
                ),
                (ErrorCategory::Topology { operation }, 2) if operation.is_boolean() => (
                    "The boolean still fails. Merge all intermediate bodies into one solid first, then apply the boolean operations one at a time.".to_string(),
                    vec![],
                    1,
                ),

                // Loft and sweep: stacked extrudes, then revolve.
                (ErrorCategory::Topology { operation: OperationKind::Loft | OperationKind::Sweep }, 1) => (
                    "The loft/sweep failed. Approximate the shape with a stack of straight extrusions between the profiles instead.".to_string(),
                    vec![OperationKind::Loft, OperationKind::Sweep],
                    1,
                ),
                (ErrorCategory::Topology { operation: OperationKind::Loft | OperationKind::Sweep }, 2) => (
                    "The stacked approximation failed too. If the shape is rotationally symmetric, build it with a single revolve of a simple profile.".to_string(),
                    vec![OperationKind::Loft, OperationKind::Sweep],
                    1,
                ),

                // Remaining topology failures fall back to kernel handling.
                (ErrorCategory::Topology { .. }, 1)
                | (ErrorCategory::GeometryKernel { .. }, 1) => (
                    "The geometry kernel rejected the shape. Simplify the failing profile: fewer points, larger features, no degenerate edges.".to_string(),
                    vec![],
                    1,
                ),
                (ErrorCategory::Topology { .. }, 2)
                | (ErrorCategory::GeometryKernel { .. }, 2) => (
                    "The kernel still rejects the shape. Replace all curved profile segments with straight line segments.".to_string(),
                    vec![],
                    1,
                ),

                // API misuse: cite the reference, then re-plan.
                (ErrorCategory::ApiMisuse { symbol }, 1) => (
                    format!(
                        "The script misuses the CadQuery API around '{}'. Use the exact signature from the API reference section and correct the call.",
                        symbol
                    ),
                    vec![],
                    0,
                ),
                (ErrorCategory::ApiMisuse { .. }, 2) => (
                    "The API misuse persists. Re-plan the failing step using only calls that appear verbatim in the API reference.".to_string(),
                    vec![],
                    1,
                ),

                // Split solids: extend overlaps, then re-order operations.
                (ErrorCategory::SplitSolids, 1) => (
                    "The result is not a single connected solid. Extend the overlap on the last additive operation so every body fuses into one.".to_string(),
                    vec![],
                    0,
                ),
                (ErrorCategory::SplitSolids, 2) => (
                    "The result still splits into pieces. Re-order the script: base shape first, then additive features, then booleans, fillets last.".to_string(),
                    vec![],
                    1,
                ),

                // Runtime and timeout burn their budget faster.
                (ErrorCategory::Runtime | ErrorCategory::Timeout | ErrorCategory::Unknown, 1) => (
                    "Execution failed or ran too long. Reduce the feature count: keep the primary shape, drop secondary details.".to_string(),
                    vec![],
                    1,
                ),
                (ErrorCategory::Runtime | ErrorCategory::Timeout | ErrorCategory::Unknown, 2) => {
                    return Some(primitives_only(&error.category, Vec::new()));
                }
                (ErrorCategory::Runtime | ErrorCategory::Timeout | ErrorCategory::Unknown, 3) => {
                    // Terminal: the table gives up.
                    return None;
                }

                // Every other category escalates to primitives-only on the
                // third retry.
                (_, 3) => {
                    let carried = carried_forbidden(&error.category);
                    return Some(primitives_only(&error.category, carried));
                }
                _ => return None,
            };

        Some(RetryStrategy {
            prompt_prefix: prefix,
            forbidden_operations: forbidden.into_iter().collect(),
            simplification_level: level,
            max_retries: 1,
        })
    }

    /// Whether this is the last escalation level.
    pub fn is_final_level(&self) -> bool {
        self.simplification_level == 2
    }

    /// Renders the forbidden set as a prompt clause.
    pub fn forbidden_clause(&self) -> Option<String> {
        if self.forbidden_operations.is_empty() {
            return None;
        }
        let names: Vec<&str> = self
            .forbidden_operations
            .iter()
            .map(|op| op.name())
            .collect();
        Some(format!(
            "Forbidden operations for this attempt: {}.",
            names.join(", ")
        ))
    }
}

/// Forbidden operations earlier retries of a category already imposed.
fn carried_forbidden(category: &ErrorCategory) -> Vec<OperationKind> {
    match category {
        ErrorCategory::Topology {
            operation: OperationKind::Fillet,
        } => vec![OperationKind::Fillet],
        ErrorCategory::Topology {
            operation: OperationKind::Chamfer,
        } => vec![OperationKind::Chamfer],
        ErrorCategory::Topology {
            operation: OperationKind::Shell,
        } => vec![OperationKind::Shell],
        ErrorCategory::Topology {
            operation: OperationKind::Loft | OperationKind::Sweep,
        } => vec![OperationKind::Loft, OperationKind::Sweep],
        _ => Vec::new(),
    }
}

/// The level-2 strategy shared by every category.
fn primitives_only(category: &ErrorCategory, carried: Vec<OperationKind>) -> RetryStrategy {
    let mut forbidden: BTreeSet<OperationKind> = PRIMITIVES_FORBIDDEN.into_iter().collect();
    forbidden.extend(carried);

    RetryStrategy {
        prompt_prefix: format!(
            "Repeated {} failures. Rebuild the part from primitives only: boxes, \
             cylinders, straight extrusions, plain holes and booleans. No other operations.",
            category.name()
        ),
        forbidden_operations: forbidden,
        simplification_level: 2,
        max_retries: 1,
    }
}
