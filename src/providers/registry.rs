//! Provider registry: maps `agent.provider` to a configured adapter.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, ProviderConfig};
use crate::error::{ConduitError, Result};

use super::claude::ClaudeAdapter;
use super::openai::OpenAIAdapter;
use super::ProviderAdapter;

/// Metadata describing a supported provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSpec {
    /// Config key under `providers`
    pub name: &'static str,
    /// Other names accepted in `agent.provider`
    pub aliases: &'static [&'static str],
}

/// Supported providers.
pub const PROVIDER_REGISTRY: &[ProviderSpec] = &[
    ProviderSpec {
        name: "anthropic",
        aliases: &["claude"],
    },
    ProviderSpec {
        name: "openai",
        aliases: &[],
    },
];

/// Find the registry entry for a provider name or alias.
pub fn lookup(name: &str) -> Option<&'static ProviderSpec> {
    PROVIDER_REGISTRY
        .iter()
        .find(|spec| spec.name == name || spec.aliases.contains(&name))
}

fn provider_config<'a>(config: &'a Config, name: &str) -> Option<&'a ProviderConfig> {
    match name {
        "anthropic" => config.providers.anthropic.as_ref(),
        "openai" => config.providers.openai.as_ref(),
        _ => None,
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

/// Build the adapter selected by `agent.provider`.
///
/// Fails with a config error when the provider is unknown or has no API key.
pub fn build_adapter(config: &Config) -> Result<Arc<dyn ProviderAdapter>> {
    let spec = lookup(&config.agent.provider).ok_or_else(|| {
        ConduitError::Config(format!("Unknown provider '{}'", config.agent.provider))
    })?;
    let provider = provider_config(config, spec.name);
    let api_key = non_empty(provider.and_then(|p| p.api_key.as_ref())).ok_or_else(|| {
        ConduitError::Config(format!("providers.{}.api_key is not set", spec.name))
    })?;
    let api_base = non_empty(provider.and_then(|p| p.api_base.as_ref()));
    let timeout = Duration::from_secs(config.providers.request_timeout_secs);

    let adapter: Arc<dyn ProviderAdapter> = match spec.name {
        "anthropic" => {
            let mut adapter = ClaudeAdapter::with_timeout(api_key, timeout);
            if let Some(base) = api_base {
                adapter = adapter.with_api_base(base);
            }
            Arc::new(adapter)
        }
        _ => {
            let mut adapter = OpenAIAdapter::with_timeout(api_key, timeout);
            if let Some(base) = api_base {
                adapter = adapter.with_api_base(base);
            }
            Arc::new(adapter)
        }
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_key(provider: &str, key: &str) -> Config {
        let mut config = Config::default();
        config.agent.provider = provider.to_string();
        let entry = Some(ProviderConfig {
            api_key: Some(key.to_string()),
            api_base: None,
        });
        match provider {
            "openai" => config.providers.openai = entry,
            _ => config.providers.anthropic = entry,
        }
        config
    }

    #[test]
    fn test_lookup_alias() {
        assert_eq!(lookup("claude").map(|s| s.name), Some("anthropic"));
        assert_eq!(lookup("openai").map(|s| s.name), Some("openai"));
        assert!(lookup("gemini").is_none());
    }

    #[test]
    fn test_build_adapter() {
        let adapter = build_adapter(&with_key("claude", "sk-ant")).unwrap();
        assert_eq!(adapter.name(), "anthropic");
        let adapter = build_adapter(&with_key("openai", "sk-openai")).unwrap();
        assert_eq!(adapter.name(), "openai");
    }

    #[test]
    fn test_build_adapter_requires_key() {
        let err = build_adapter(&with_key("openai", "")).err().unwrap();
        assert!(err.to_string().contains("providers.openai.api_key"));

        let mut config = Config::default();
        config.agent.provider = "gemini".into();
        assert!(build_adapter(&config).is_err());
    }
}
