//! Configuration management for Conduit
//!
//! Configuration is loaded from `~/.conduit/config.json` with environment
//! variable overrides (`CONDUIT_SECTION_KEY`), then validated before any
//! runtime component is built from it.

mod types;
pub mod validate;

pub use types::*;

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ConduitError, Result};
use validate::{validate_config, validate_semantics, DiagnosticLevel};

impl Config {
    /// Returns the Conduit configuration directory path (~/.conduit)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".conduit")
    }

    /// Returns the path to the config file (~/.conduit/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// A `.env` file in the working directory is read first, so its values
    /// participate in the override pass. If the config file doesn't exist,
    /// the default configuration is used.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    ///
    /// Unknown fields are reported as errors so typos fail fast instead of
    /// silently falling back to defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let raw: serde_json::Value = serde_json::from_str(&content)?;
            let errors: Vec<String> = validate_config(&raw)
                .into_iter()
                .filter(|d| d.level == DiagnosticLevel::Error)
                .map(|d| d.to_string())
                .collect();
            if !errors.is_empty() {
                return Err(ConduitError::Config(errors.join("; ")));
            }
            serde_json::from_value(raw)?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints (ranges, required credentials).
    ///
    /// Returns every problem at once rather than stopping at the first.
    pub fn validate(&self) -> Result<()> {
        let errors: Vec<String> = validate_semantics(self)
            .into_iter()
            .filter(|d| d.level == DiagnosticLevel::Error)
            .map(|d| d.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConduitError::Config(errors.join("; ")))
        }
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables follow the pattern: CONDUIT_SECTION_KEY
    pub fn apply_env_overrides(&mut self) {
        // Agent
        if let Ok(val) = std::env::var("CONDUIT_AGENT_PROVIDER") {
            self.agent.provider = val;
        }
        if let Ok(val) = std::env::var("CONDUIT_AGENT_MODEL") {
            self.agent.model = Some(val);
        }
        if let Ok(val) = std::env::var("CONDUIT_AGENT_MAX_ITERATIONS") {
            if let Ok(v) = val.parse() {
                self.agent.max_iterations = v;
            }
        }
        if let Ok(val) = std::env::var("CONDUIT_AGENT_STREAMING") {
            if let Ok(v) = val.parse() {
                self.agent.streaming = v;
            }
        }

        // Context
        if let Ok(val) = std::env::var("CONDUIT_CONTEXT_MAX_INPUT_TOKENS") {
            if let Ok(v) = val.parse() {
                self.context.max_input_tokens = Some(v);
            }
        }
        if let Ok(val) = std::env::var("CONDUIT_CONTEXT_COMPACTION_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.context.compaction_threshold = v;
            }
        }

        // Approval
        if let Ok(val) = std::env::var("CONDUIT_APPROVAL_TIMEOUT_SECS") {
            if let Ok(v) = val.parse() {
                self.approval.timeout_secs = v;
            }
        }

        // Tools
        if let Ok(val) = std::env::var("CONDUIT_TOOLS_WORKSPACE") {
            self.tools.workspace = Some(val);
        }

        // Logging
        if let Ok(val) = std::env::var("CONDUIT_LOGGING_LEVEL") {
            self.logging.level = val;
        }

        self.apply_provider_env_overrides();
    }

    /// Apply provider-specific environment variable overrides
    fn apply_provider_env_overrides(&mut self) {
        // Anthropic
        if let Ok(val) = std::env::var("CONDUIT_PROVIDERS_ANTHROPIC_API_KEY") {
            let provider = self
                .providers
                .anthropic
                .get_or_insert_with(ProviderConfig::default);
            provider.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("CONDUIT_PROVIDERS_ANTHROPIC_API_BASE") {
            let provider = self
                .providers
                .anthropic
                .get_or_insert_with(ProviderConfig::default);
            provider.api_base = Some(val);
        }

        // OpenAI
        if let Ok(val) = std::env::var("CONDUIT_PROVIDERS_OPENAI_API_KEY") {
            let provider = self
                .providers
                .openai
                .get_or_insert_with(ProviderConfig::default);
            provider.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("CONDUIT_PROVIDERS_OPENAI_API_BASE") {
            let provider = self
                .providers
                .openai
                .get_or_insert_with(ProviderConfig::default);
            provider.api_base = Some(val);
        }

        if let Ok(val) = std::env::var("CONDUIT_PROVIDERS_RETRY_MAX_RETRIES") {
            if let Ok(v) = val.parse() {
                self.providers.retry.max_retries = v;
            }
        }
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// API key for the named provider, if configured and non-empty.
    pub fn api_key_for(&self, provider: &str) -> Option<String> {
        let cfg = match provider {
            "anthropic" | "claude" => self.providers.anthropic.as_ref(),
            "openai" => self.providers.openai.as_ref(),
            _ => None,
        }?;
        cfg.api_key.clone().filter(|k| !k.is_empty())
    }

    /// API base override for the named provider.
    pub fn api_base_for(&self, provider: &str) -> Option<String> {
        let cfg = match provider {
            "anthropic" | "claude" => self.providers.anthropic.as_ref(),
            "openai" => self.providers.openai.as_ref(),
            _ => None,
        }?;
        cfg.api_base.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.agent.provider, "anthropic");
        assert_eq!(config.agent.max_iterations, 20);
        assert!((config.context.compaction_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.providers.retry.max_retries, 3);
        assert_eq!(config.approval.timeout_secs, 300);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"agent": {"max_iterations": 5}}"#).unwrap();
        assert_eq!(config.agent.max_iterations, 5);
        assert_eq!(config.agent.provider, "anthropic");
        assert_eq!(config.context.keep_recent_turns, 4);
    }

    #[test]
    fn test_load_from_missing_path_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(&dir.path().join("missing.json")).unwrap();
        assert_eq!(config.agent.max_iterations, 20);
    }

    #[test]
    fn test_load_from_path_rejects_unknown_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, r#"{{"agnet": {{}}}}"#).unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConduitError::Config(_)));
        assert!(err.to_string().contains("did you mean 'agent'"));
    }

    #[test]
    fn test_load_from_path_rejects_bad_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"context": {"compaction_threshold": 1.5}}"#).unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("compaction_threshold"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.agent.max_iterations = 7;
        config.save_to_path(&path).unwrap();

        let restored = Config::load_from_path(&path).unwrap();
        assert_eq!(restored.agent.max_iterations, 7);
    }

    #[test]
    fn test_api_key_for() {
        let mut config = Config::default();
        assert!(config.api_key_for("anthropic").is_none());
        config.providers.anthropic = Some(ProviderConfig {
            api_key: Some("sk-test".to_string()),
            api_base: None,
        });
        assert_eq!(config.api_key_for("claude").as_deref(), Some("sk-test"));
        config.providers.openai = Some(ProviderConfig {
            api_key: Some(String::new()),
            api_base: Some("http://localhost:8080/v1".to_string()),
        });
        assert!(config.api_key_for("openai").is_none());
        assert_eq!(
            config.api_base_for("openai").as_deref(),
            Some("http://localhost:8080/v1")
        );
    }
}
