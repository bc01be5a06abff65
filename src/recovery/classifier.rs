//! Classification of CAD runner failures.
//!
//! The runner reports failures as an exit code plus a stderr traceback.
//! Classification applies ordered rules, first match wins; message rules
//! take precedence over exit codes because the kernel's tracebacks are
//! more specific than the coarse exit taxonomy.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::plan::OperationKind;

/// Exit codes of the runner contract.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const SYNTAX: i32 = 2;
    pub const KERNEL: i32 = 3;
    pub const TOPOLOGY: i32 = 4;
    pub const SPLIT_SOLIDS: i32 = 5;
    pub const API: i32 = 6;
    pub const RUNTIME: i32 = 7;
    /// Exit codes at or above this mean the process died to a signal.
    pub const SIGNAL_BASE: i32 = 128;
}

/// OCCT kernel failure tag.
const KERNEL_TAG: &str = "StdFail_NotDone";
/// OCCT build-API failure tag.
const BUILD_API_TAG: &str = "BRep_API";

/// The failure envelope the runner hands back.
#[derive(Debug, Clone)]
pub struct RunnerEnvelope {
    /// Process exit code.
    pub exit_code: i32,
    /// Raw stderr text (traceback on failure).
    pub stderr: String,
}

impl RunnerEnvelope {
    /// Creates an envelope.
    pub fn new(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
        }
    }
}

/// The typed failure category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The script does not parse.
    Syntax,
    /// The geometry kernel could not build a shape.
    GeometryKernel { operation: Option<OperationKind> },
    /// A topological operation failed on valid inputs.
    Topology { operation: OperationKind },
    /// The script calls the CAD library incorrectly.
    ApiMisuse { symbol: String },
    /// A generic runtime failure in the script.
    Runtime,
    /// The result is not a single manifold solid.
    SplitSolids,
    /// The runner was killed at the wall-clock limit.
    Timeout,
    /// Nothing matched; should not happen for real runner output.
    Unknown,
}

impl ErrorCategory {
    /// Stable name used in logs and session memory.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCategory::Syntax => "syntax",
            ErrorCategory::GeometryKernel { .. } => "geometry_kernel",
            ErrorCategory::Topology { .. } => "topology",
            ErrorCategory::ApiMisuse { .. } => "api_misuse",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::SplitSolids => "split_solids",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A classified failure with its extracted context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// The category the ordered rules assigned.
    pub category: ErrorCategory,
    /// Line number in the generated script, when the traceback names one.
    pub line: Option<u32>,
    /// One-line failure summary.
    pub message: String,
    /// The failing operation name, when recognizable.
    pub operation: Option<String>,
}

fn syntax_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"SyntaxError|IndentationError").expect("valid regex"))
}

fn split_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"disconnected|non-manifold|SPLIT_BODY").expect("valid regex"))
}

fn api_error_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"AttributeError|TypeError").expect("valid regex"))
}

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"line (\d+)").expect("valid regex"))
}

fn symbol_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `'Workplane' object has no attribute 'filet'` or
    // `module 'cadquery' has no attribute 'Box'`.
    RE.get_or_init(|| Regex::new(r"has no attribute '([A-Za-z_][A-Za-z0-9_]*)'").expect("valid regex"))
}

fn operation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(fillet|chamfer|shell|loft|sweep|revolve|cut|union|intersect)\b")
            .expect("valid regex")
    })
}

/// Classifies a runner failure envelope.
///
/// Total on the envelope domain: every input maps to some category.
pub fn classify(envelope: &RunnerEnvelope) -> ClassifiedError {
    let stderr = &envelope.stderr;
    let line = extract_line(stderr);
    let message = summarize(stderr);
    let operation = find_operation(stderr);

    let category = classify_category(envelope, &operation);

    ClassifiedError {
        operation: operation.map(|op| op.name().to_string()),
        category,
        line,
        message,
    }
}

fn classify_category(
    envelope: &RunnerEnvelope,
    operation: &Option<OperationKind>,
) -> ErrorCategory {
    let stderr = &envelope.stderr;
    let exit = envelope.exit_code;

    if exit == exit_code::SYNTAX || syntax_regex().is_match(stderr) {
        return ErrorCategory::Syntax;
    }

    if exit == exit_code::SPLIT_SOLIDS || split_regex().is_match(stderr) {
        return ErrorCategory::SplitSolids;
    }

    if stderr.contains(KERNEL_TAG) {
        if let Some(op) = operation {
            return ErrorCategory::Topology { operation: *op };
        }
    }

    if stderr.contains(BUILD_API_TAG) {
        return ErrorCategory::GeometryKernel {
            operation: *operation,
        };
    }

    if api_error_regex().is_match(stderr) {
        if let Some(symbol) = extract_cad_symbol(stderr) {
            return ErrorCategory::ApiMisuse { symbol };
        }
    }

    if exit >= exit_code::SIGNAL_BASE {
        return ErrorCategory::Timeout;
    }

    // Exit-code fallbacks for messages the rules above did not recognize.
    match exit {
        exit_code::KERNEL => ErrorCategory::GeometryKernel {
            operation: *operation,
        },
        exit_code::TOPOLOGY => match operation {
            Some(op) => ErrorCategory::Topology { operation: *op },
            None => ErrorCategory::GeometryKernel { operation: None },
        },
        exit_code::API => ErrorCategory::ApiMisuse {
            symbol: extract_cad_symbol(stderr).unwrap_or_default(),
        },
        exit_code::SUCCESS => ErrorCategory::Unknown,
        _ => ErrorCategory::Runtime,
    }
}

/// Extracts the deepest script line number from a Python traceback.
fn extract_line(stderr: &str) -> Option<u32> {
    line_regex()
        .captures_iter(stderr)
        .last()
        .and_then(|caps| caps[1].parse().ok())
}

/// Finds the failing operation mentioned in the traceback.
fn find_operation(stderr: &str) -> Option<OperationKind> {
    let lower = stderr.to_lowercase();
    let found = operation_regex().find(&lower)?;
    Some(match found.as_str() {
        "fillet" => OperationKind::Fillet,
        "chamfer" => OperationKind::Chamfer,
        "shell" => OperationKind::Shell,
        "loft" => OperationKind::Loft,
        "sweep" => OperationKind::Sweep,
        "revolve" => OperationKind::Revolve,
        "cut" => OperationKind::BooleanSubtract,
        "union" => OperationKind::BooleanUnion,
        _ => OperationKind::BooleanIntersect,
    })
}

/// Extracts a symbol that resolves into the CAD library namespace.
///
/// A symbol resolves when the traceback ties it to `cadquery`, the `cq`
/// alias or a `Workplane` receiver.
fn extract_cad_symbol(stderr: &str) -> Option<String> {
    let in_namespace = stderr.contains("cadquery")
        || stderr.contains("'cq'")
        || stderr.contains("cq.")
        || stderr.contains("Workplane");
    if !in_namespace {
        return None;
    }
    symbol_regex()
        .captures(stderr)
        .map(|caps| caps[1].to_string())
}

/// One-line summary: the last non-empty stderr line.
fn summarize(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("runner produced no diagnostics")
        .to_string()
}
