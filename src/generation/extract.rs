//! Code extraction from model responses.
//!
//! Models are instructed to return code in `<CODE>` tags, but responses in
//! the wild fall back to fenced blocks or bare scripts. Extraction is a
//! three-tier cascade; the tier that matched is recorded on the attempt so
//! format drift is observable.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::ExtractError;

/// Which cascade tier produced the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorTier {
    /// `<CODE> … </CODE>` region.
    Tagged,
    /// Triple-backtick fenced block with an executable language tag.
    Fenced,
    /// Bare script located by import and entry-point heuristics.
    Heuristic,
}

impl std::fmt::Display for ExtractorTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractorTier::Tagged => write!(f, "tagged"),
            ExtractorTier::Fenced => write!(f, "fenced"),
            ExtractorTier::Heuristic => write!(f, "heuristic"),
        }
    }
}

/// Extracted code plus the tier that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCode {
    pub code: String,
    pub tier: ExtractorTier,
}

fn tagged_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<CODE>(.*?)</CODE>").expect("valid regex"))
}

fn fenced_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:python|py)[ \t]*\n(.*?)```").expect("valid regex")
    })
}

/// Extracts a CAD script from a model response.
///
/// Tiers are tried in order; the first match wins. Extraction is pure, so
/// running it twice on the same text yields the same code and tier.
///
/// # Errors
///
/// Returns [`ExtractError::ExtractionEmpty`] when no tier matches.
pub fn extract_code(response: &str) -> Result<ExtractedCode, ExtractError> {
    if let Some(caps) = tagged_regex().captures(response) {
        let code = caps[1].trim();
        if !code.is_empty() {
            return Ok(ExtractedCode {
                code: code.to_string(),
                tier: ExtractorTier::Tagged,
            });
        }
    }

    if let Some(caps) = fenced_regex().captures(response) {
        let code = caps[1].trim();
        if !code.is_empty() {
            return Ok(ExtractedCode {
                code: code.to_string(),
                tier: ExtractorTier::Fenced,
            });
        }
    }

    if let Some(code) = heuristic_region(response) {
        return Ok(ExtractedCode {
            code,
            tier: ExtractorTier::Heuristic,
        });
    }

    Err(ExtractError::ExtractionEmpty)
}

/// Locates a bare script: from the first cadquery import to the last
/// entry-point line (`show_object(...)` call or assignment to `result`).
fn heuristic_region(response: &str) -> Option<String> {
    let lines: Vec<&str> = response.lines().collect();

    let start = lines.iter().position(|line| {
        let trimmed = line.trim_start();
        trimmed.starts_with("import cadquery") || trimmed.starts_with("from cadquery import")
    })?;

    let end = lines.iter().rposition(|line| {
        let trimmed = line.trim_start();
        trimmed.contains("show_object(")
            || trimmed.starts_with("result =")
            || trimmed.starts_with("result=")
    })?;

    if end < start {
        return None;
    }

    Some(lines[start..=end].join("\n").trim().to_string())
}
