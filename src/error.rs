//! Error types for cad-forge operations.
//!
//! Defines error types for the major subsystems:
//! - LLM API interactions
//! - CAD runner subprocess execution
//! - Rule store loading and reloads
//! - Code extraction from model responses
//! - Plan authorship and validation
//! - The pipeline boundary taxonomy

use thiserror::Error;

use crate::recovery::ClassifiedError;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key for provider '{0}'")]
    MissingApiKey(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication or quota error ({code}): {message}")]
    AuthOrQuota { code: u16, message: String },

    #[error("Bad request ({code}): {message}")]
    BadRequest { code: u16, message: String },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Stream ended without a completion")]
    StreamTruncated,

    #[error("Request cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlmError {
    /// Whether the error is worth retrying with backoff.
    ///
    /// Transient errors are network failures, 5xx responses and rate
    /// limits. Auth, quota and bad-request errors are fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RequestFailed(_) | LlmError::RateLimited(_) => true,
            LlmError::ApiError { code, .. } => *code >= 500,
            _ => false,
        }
    }
}

/// Errors that can occur while executing CAD source in the runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to set up execution directory: {0}")]
    Setup(String),

    #[error("Failed to spawn CAD runner process: {0}")]
    Spawn(String),

    #[error("Runner killed after exceeding {0:?}")]
    Timeout(std::time::Duration),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while loading or reloading the rule store.
#[derive(Debug, Error)]
pub enum RuleStoreError {
    #[error("Preset '{0}' not found in rule store")]
    PresetNotFound(String),

    #[error("Failed to parse cookbook file '{path}': {message}")]
    CookbookParse { path: String, message: String },

    #[error("Invalid library version '{0}'")]
    InvalidVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur while extracting code from a model response.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// No extraction tier matched the response text.
    #[error("No code block found in model response")]
    ExtractionEmpty,
}

/// Errors that can occur during plan authorship and validation.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Planner returned an empty plan")]
    EmptyPlan,

    #[error("Plan rejected: {0}")]
    Rejected(String),

    #[error("LLM error during planning: {0}")]
    Llm(#[from] LlmError),
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown AI provider: {0}")]
    UnknownProvider(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The error taxonomy at the pipeline boundary.
///
/// Everything a caller can observe from a failed run collapses into one of
/// these variants. Recoverable failures (CAD execution, transient provider
/// errors, a first plan rejection) are handled inside the pipeline and only
/// surface here after their budgets are exhausted.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The request itself is unusable (empty text, missing API key).
    #[error("User error: {0}")]
    User(String),

    /// The LLM provider failed after the transient retry budget.
    #[error("Provider error: {0}")]
    Provider(#[from] LlmError),

    /// The full retry budget ran without a successful execution.
    ///
    /// Carries the last classified failure and the last generated code so
    /// the user can still edit it manually.
    #[error("Generation failed after retries: {}", .error.message)]
    Generation {
        error: ClassifiedError,
        last_code: String,
    },

    /// A bug inside the pipeline. Never masked.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The run was cancelled by the caller.
    #[error("Run cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_transient_classification() {
        assert!(LlmError::RequestFailed("connection reset".into()).is_transient());
        assert!(LlmError::RateLimited("slow down".into()).is_transient());
        assert!(LlmError::ApiError {
            code: 503,
            message: "unavailable".into()
        }
        .is_transient());

        assert!(!LlmError::ApiError {
            code: 404,
            message: "not found".into()
        }
        .is_transient());
        assert!(!LlmError::AuthOrQuota {
            code: 401,
            message: "bad key".into()
        }
        .is_transient());
        assert!(!LlmError::BadRequest {
            code: 400,
            message: "bad body".into()
        }
        .is_transient());
        assert!(!LlmError::MissingApiKey("claude".into()).is_transient());
    }

    #[test]
    fn test_pipeline_error_display() {
        let err = PipelineError::User("empty request".into());
        assert!(err.to_string().contains("empty request"));

        let err = PipelineError::Cancelled;
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn test_runner_error_display() {
        let err = RunnerError::Timeout(std::time::Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }
}
