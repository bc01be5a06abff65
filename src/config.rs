//! Application configuration for the generation pipeline.
//!
//! This module provides the recognized configuration surface: AI provider
//! selection, model and credentials, rule preset, and the pipeline toggles
//! (code review, consensus, attempt budget, auto-execute).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The closed set of supported AI providers.
///
/// Each provider owns its transport protocol and error mapping; see
/// `crate::llm::providers` for the per-protocol implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Claude,
    OpenAi,
    Gemini,
    DeepSeek,
    Qwen,
    Kimi,
    Ollama,
    RunPod,
}

impl ProviderKind {
    /// All supported providers, in documentation order.
    pub const ALL: [ProviderKind; 8] = [
        ProviderKind::Claude,
        ProviderKind::OpenAi,
        ProviderKind::Gemini,
        ProviderKind::DeepSeek,
        ProviderKind::Qwen,
        ProviderKind::Kimi,
        ProviderKind::Ollama,
        ProviderKind::RunPod,
    ];

    /// Stable configuration name for this provider.
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Qwen => "qwen",
            ProviderKind::Kimi => "kimi",
            ProviderKind::Ollama => "ollama",
            ProviderKind::RunPod => "runpod",
        }
    }

    /// Default model identifier for this provider.
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude-sonnet-4-5",
            ProviderKind::OpenAi => "gpt-4o",
            ProviderKind::Gemini => "gemini-2.0-flash",
            ProviderKind::DeepSeek => "deepseek-chat",
            ProviderKind::Qwen => "qwen-max",
            ProviderKind::Kimi => "moonshot-v1-32k",
            ProviderKind::Ollama => "qwen2.5-coder:14b",
            ProviderKind::RunPod => "default",
        }
    }

    /// Whether the provider requires an API key.
    ///
    /// Local providers (ollama) run without credentials.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, ProviderKind::Ollama)
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" | "anthropic" => Ok(ProviderKind::Claude),
            "openai" => Ok(ProviderKind::OpenAi),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "deepseek" => Ok(ProviderKind::DeepSeek),
            "qwen" => Ok(ProviderKind::Qwen),
            "kimi" | "moonshot" => Ok(ProviderKind::Kimi),
            "ollama" => Ok(ProviderKind::Ollama),
            "runpod" => Ok(ProviderKind::RunPod),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Recognized rule presets shipped with the knowledge base.
pub const KNOWN_PRESETS: [&str; 3] = ["default", "printing-focused", "cnc-focused"];

/// Application configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Provider settings
    /// Which AI provider to use.
    pub provider: ProviderKind,
    /// Model identifier for the provider.
    pub model: String,
    /// API key; optional only for providers that do not require one.
    pub api_key: Option<String>,
    /// Override for the provider's base URL.
    pub base_url: Option<String>,

    // Pipeline settings
    /// Rule preset identifier.
    pub preset_id: String,
    /// Whether the post-execution code review runs.
    pub enable_code_review: bool,
    /// Whether consensus mode is available to runs that opt in.
    pub enable_consensus: bool,
    /// Maximum generate/execute attempts per target (1..=5).
    pub max_attempts: u8,
    /// Whether generated code is executed automatically.
    pub auto_execute: bool,

    // Runner settings
    /// Command used to launch the CAD runner child process.
    pub runner_command: String,
    /// Root directory of the on-disk rule store.
    pub rules_path: PathBuf,
    /// Installed CadQuery version, used for cookbook filtering.
    pub library_version: String,

    // Timeouts
    /// Wall-clock budget per CAD execution.
    pub exec_timeout: Duration,
    /// Wall-clock budget per planning call.
    pub plan_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Claude,
            model: ProviderKind::Claude.default_model().to_string(),
            api_key: None,
            base_url: None,
            preset_id: "default".to_string(),
            enable_code_review: true,
            enable_consensus: false,
            max_attempts: 3,
            auto_execute: true,
            runner_command: "python3".to_string(),
            rules_path: PathBuf::from("./rules"),
            library_version: "2.4.0".to_string(),
            exec_timeout: Duration::from_secs(30),
            plan_timeout: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CADFORGE_PROVIDER`: AI provider (default: claude)
    /// - `CADFORGE_MODEL`: model identifier (default: provider default)
    /// - `CADFORGE_API_KEY`: API key (required for remote providers)
    /// - `CADFORGE_BASE_URL`: provider base URL override
    /// - `CADFORGE_PRESET`: rule preset (default: default)
    /// - `CADFORGE_ENABLE_CODE_REVIEW`: post-execution review (default: true)
    /// - `CADFORGE_ENABLE_CONSENSUS`: consensus availability (default: false)
    /// - `CADFORGE_MAX_ATTEMPTS`: attempt budget 1..=5 (default: 3)
    /// - `CADFORGE_AUTO_EXECUTE`: execute generated code (default: true)
    /// - `CADFORGE_RUNNER_COMMAND`: CAD runner interpreter (default: python3)
    /// - `CADFORGE_RULES_PATH`: rule store root (default: ./rules)
    /// - `CADFORGE_LIBRARY_VERSION`: installed CadQuery version (default: 2.4.0)
    /// - `CADFORGE_EXEC_TIMEOUT_SECS`: per-execute timeout (default: 30)
    /// - `CADFORGE_PLAN_TIMEOUT_SECS`: per-plan timeout (default: 60)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CADFORGE_PROVIDER") {
            config.provider = val.parse()?;
            config.model = config.provider.default_model().to_string();
        }

        if let Ok(val) = std::env::var("CADFORGE_MODEL") {
            config.model = val;
        }

        if let Ok(val) = std::env::var("CADFORGE_API_KEY") {
            config.api_key = Some(val);
        }

        if let Ok(val) = std::env::var("CADFORGE_BASE_URL") {
            config.base_url = Some(val);
        }

        if let Ok(val) = std::env::var("CADFORGE_PRESET") {
            config.preset_id = val;
        }

        if let Ok(val) = std::env::var("CADFORGE_ENABLE_CODE_REVIEW") {
            config.enable_code_review = parse_env_bool(&val, "CADFORGE_ENABLE_CODE_REVIEW")?;
        }

        if let Ok(val) = std::env::var("CADFORGE_ENABLE_CONSENSUS") {
            config.enable_consensus = parse_env_bool(&val, "CADFORGE_ENABLE_CONSENSUS")?;
        }

        if let Ok(val) = std::env::var("CADFORGE_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "CADFORGE_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("CADFORGE_AUTO_EXECUTE") {
            config.auto_execute = parse_env_bool(&val, "CADFORGE_AUTO_EXECUTE")?;
        }

        if let Ok(val) = std::env::var("CADFORGE_RUNNER_COMMAND") {
            config.runner_command = val;
        }

        if let Ok(val) = std::env::var("CADFORGE_RULES_PATH") {
            config.rules_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("CADFORGE_LIBRARY_VERSION") {
            config.library_version = val;
        }

        if let Ok(val) = std::env::var("CADFORGE_EXEC_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "CADFORGE_EXEC_TIMEOUT_SECS")?;
            config.exec_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("CADFORGE_PLAN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "CADFORGE_PLAN_TIMEOUT_SECS")?;
            config.plan_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` for out-of-range or missing
    /// values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model must not be empty".to_string(),
            ));
        }

        if !(1..=5).contains(&self.max_attempts) {
            return Err(ConfigError::ValidationFailed(format!(
                "max_attempts must be in 1..=5, got {}",
                self.max_attempts
            )));
        }

        if self.provider.requires_api_key() && self.api_key.is_none() {
            return Err(ConfigError::ValidationFailed(format!(
                "provider '{}' requires an API key",
                self.provider
            )));
        }

        if self.exec_timeout.is_zero() || self.plan_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "timeouts must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the provider and resets the model to the provider default.
    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self.model = provider.default_model().to_string();
        self
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, attempts: u8) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the rule preset.
    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset_id = preset.into();
        self
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{}", e),
    })
}

/// Parses a boolean environment variable ("true"/"false"/"1"/"0").
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parsing() {
        assert_eq!(
            "claude".parse::<ProviderKind>().unwrap(),
            ProviderKind::Claude
        );
        assert_eq!(
            "DeepSeek".parse::<ProviderKind>().unwrap(),
            ProviderKind::DeepSeek
        );
        assert_eq!(
            "moonshot".parse::<ProviderKind>().unwrap(),
            ProviderKind::Kimi
        );
        assert!("notaprovider".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_provider_roundtrip_names() {
        for provider in ProviderKind::ALL {
            let parsed: ProviderKind = provider.name().parse().unwrap();
            assert_eq!(parsed, provider);
        }
    }

    #[test]
    fn test_ollama_needs_no_key() {
        assert!(!ProviderKind::Ollama.requires_api_key());
        assert!(ProviderKind::Claude.requires_api_key());

        let config = AppConfig::default().with_provider(ProviderKind::Ollama);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_missing_key() {
        let config = AppConfig::default();
        // Claude with no key.
        assert!(config.validate().is_err());

        let config = config.with_api_key("sk-test");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_attempts() {
        let config = AppConfig::default()
            .with_api_key("sk-test")
            .with_max_attempts(0);
        assert!(config.validate().is_err());

        let config = config.with_max_attempts(6);
        assert!(config.validate().is_err());

        let config = config.with_max_attempts(5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "K").unwrap());
        assert!(parse_env_bool("1", "K").unwrap());
        assert!(!parse_env_bool("no", "K").unwrap());
        assert!(parse_env_bool("maybe", "K").is_err());
    }

    #[test]
    fn test_with_provider_resets_model() {
        let config = AppConfig::default().with_provider(ProviderKind::DeepSeek);
        assert_eq!(config.model, "deepseek-chat");
    }
}
