// Configuration module
// Author: kelexine (https://github.com/kelexine)

mod models;

pub use models::*;

use crate::error::{BridgeError, Result};
use config::{Config, Environment, File};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

impl AppConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (`CUEBRIDGE__CACHE__MAX_ENTRIES=1000`)
    /// 2. Config file (`path`, or `~/.cuebridge/config.toml` when present)
    /// 3. Defaults (lowest)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path.to_path_buf()).required(true),
            None => File::from(Self::default_config_path()).required(false),
        };

        let config = Config::builder()
            // Start with defaults
            .add_source(Config::try_from(&Self::default())?)
            .add_source(file)
            .add_source(
                Environment::with_prefix("CUEBRIDGE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| BridgeError::Config(e.to_string()))?;

        let loaded: AppConfig = config
            .try_deserialize()
            .map_err(|e| BridgeError::Config(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings that would make the orchestrator or cache misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.chunk_size == 0 {
            return Err(BridgeError::Config("orchestrator.chunk_size must be > 0".into()));
        }
        if self.orchestrator.max_attempts == 0 {
            return Err(BridgeError::Config("orchestrator.max_attempts must be >= 1".into()));
        }
        if self.cache.max_entries == 0 {
            return Err(BridgeError::Config("cache.max_entries must be > 0".into()));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.is_empty() {
                return Err(BridgeError::Config("provider id must not be empty".into()));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(BridgeError::Config(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
            if provider.chunk_size == Some(0) {
                return Err(BridgeError::Config(format!(
                    "provider '{}' chunk_size must be > 0",
                    provider.id
                )));
            }
        }

        if let Some(default) = &self.default_provider {
            if !seen.contains(default.as_str()) {
                return Err(BridgeError::Config(format!(
                    "default_provider '{}' is not configured",
                    default
                )));
            }
        }
        Ok(())
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Resolve `id`, falling back to `default_provider` and then the first entry.
    pub fn resolve_provider(&self, id: Option<&str>) -> Result<&ProviderConfig> {
        let wanted = id.or(self.default_provider.as_deref());
        match wanted {
            Some(id) => self
                .provider(id)
                .ok_or_else(|| BridgeError::ProviderNotRegistered(id.to_string())),
            None => self.providers.first().ok_or_else(|| {
                BridgeError::ProviderNotRegistered("no providers configured".to_string())
            }),
        }
    }

    fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cuebridge")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.cache.max_entries, 500);
        assert_eq!(config.orchestrator.chunk_size, 30);
        assert_eq!(config.orchestrator.context_window, 5);
        assert!(config.cache.ttl().is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
default_provider = "local"

[cache]
max_entries = 3
ttl_hours = 0

[[providers]]
id = "local"
type = "ollama"
model = "qwen2.5:7b"
timeout_seconds = 20
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.cache.max_entries, 3);
        assert!(config.cache.ttl().is_none());
        assert_eq!(config.cache.l1_capacity, 256);

        let provider = config.resolve_provider(None).unwrap();
        assert_eq!(provider.provider_type, "ollama");
        assert_eq!(provider.model.as_deref(), Some("qwen2.5:7b"));
    }

    #[test]
    fn test_duplicate_provider_ids_rejected() {
        let mut config = AppConfig::default();
        config.providers.push(ProviderConfig::new("a", "openai"));
        config.providers.push(ProviderConfig::new("a", "anthropic"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_provider_debug_redacts_key() {
        let mut provider = ProviderConfig::new("a", "openai");
        provider.api_key = Some("sk-secret".into());
        let printed = format!("{:?}", provider);
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("[REDACTED]"));
    }
}
