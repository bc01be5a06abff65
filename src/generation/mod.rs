//! Code generation support: prompt assembly and code extraction.

pub mod extract;
pub mod prompt;

pub use extract::{extract_code, ExtractedCode, ExtractorTier};
pub use prompt::{BuiltPrompt, PromptBuilder, PromptMode, OUTPUT_FORMAT_SPEC};
