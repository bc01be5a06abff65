//! cad-forge: the AI code-generation pipeline of a desktop CAD application.
//!
//! A natural-language request goes in; a validated, executable CadQuery
//! script and its mesh come out. The pipeline plans, generates, executes
//! in a sandboxed child process, classifies failures into targeted
//! retries, and streams every state transition to the caller.

pub mod cli;
pub mod config;
pub mod error;
pub mod generation;
pub mod llm;
pub mod pipeline;
pub mod plan;
pub mod recovery;
pub mod rules;
pub mod runner;

// Re-export commonly used error types
pub use error::{
    ConfigError, ExtractError, LlmError, PipelineError, PlanError, RuleStoreError, RunnerError,
};
