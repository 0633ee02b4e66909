// Provider registry: type tag → constructor
// Author: kelexine (https://github.com/kelexine)

use super::{
    anthropic::AnthropicProvider, chatgpt::ChatGptProvider, google_free::GoogleFreeProvider,
    ollama::OllamaProvider, openai::OpenAiProvider, ProviderKind, TranslationProvider,
};
use crate::config::ProviderConfig;
use crate::credentials::CredentialStore;
use crate::error::{BridgeError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Shared resources handed to every constructor.
#[derive(Clone)]
pub struct ProviderEnv {
    /// Where subscription sessions live; `None` keeps sessions in memory only.
    pub credentials: Option<CredentialStore>,
    pub refresh_skew: Duration,
}

impl Default for ProviderEnv {
    fn default() -> Self {
        Self {
            credentials: None,
            refresh_skew: Duration::from_secs(300),
        }
    }
}

pub type ProviderConstructor = Arc<
    dyn Fn(&ProviderConfig, &ProviderEnv) -> Result<Arc<dyn TranslationProvider>> + Send + Sync,
>;

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    constructors: HashMap<String, ProviderConstructor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in backend family.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in ProviderKind::ALL {
            let ctor: ProviderConstructor = match kind {
                ProviderKind::Anthropic | ProviderKind::ClaudeSubscription => {
                    Arc::new(build_anthropic)
                }
                ProviderKind::OpenAi => Arc::new(build_openai),
                ProviderKind::Ollama => Arc::new(build_ollama),
                ProviderKind::GoogleFree => Arc::new(build_google_free),
                ProviderKind::ChatGptSubscription => Arc::new(build_chatgpt),
            };
            registry.register(kind.as_str(), ctor);
        }
        registry
    }

    /// Register or replace the constructor for `type_tag`.
    pub fn register(&mut self, type_tag: impl Into<String>, constructor: ProviderConstructor) {
        self.constructors.insert(type_tag.into(), constructor);
    }

    pub fn is_registered(&self, type_tag: &str) -> bool {
        self.constructors.contains_key(type_tag)
    }

    pub fn type_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Instantiate one provider. Unknown tags fail with `ProviderNotRegistered`.
    pub fn create(
        &self,
        config: &ProviderConfig,
        env: &ProviderEnv,
    ) -> Result<Arc<dyn TranslationProvider>> {
        let ctor = self
            .constructors
            .get(&config.provider_type)
            .ok_or_else(|| BridgeError::ProviderNotRegistered(config.provider_type.clone()))?;
        ctor(config, env)
    }

    /// Like [`create`](Self::create), but logs and returns `None` on failure.
    pub fn try_create(
        &self,
        config: &ProviderConfig,
        env: &ProviderEnv,
    ) -> Option<Arc<dyn TranslationProvider>> {
        match self.create(config, env) {
            Ok(provider) => Some(provider),
            Err(e) => {
                warn!("Skipping provider '{}': {}", config.id, e);
                None
            }
        }
    }

    /// Instantiate every configured provider that can be built, keyed by id.
    pub fn instantiate_all(
        &self,
        configs: &[ProviderConfig],
        env: &ProviderEnv,
    ) -> HashMap<String, Arc<dyn TranslationProvider>> {
        let providers: HashMap<_, _> = configs
            .iter()
            .filter_map(|cfg| self.try_create(cfg, env).map(|p| (cfg.id.clone(), p)))
            .collect();
        info!("Instantiated {}/{} providers", providers.len(), configs.len());
        providers
    }
}

fn build_anthropic(cfg: &ProviderConfig, env: &ProviderEnv) -> Result<Arc<dyn TranslationProvider>> {
    Ok(Arc::new(AnthropicProvider::from_config(cfg, env)?))
}

fn build_openai(cfg: &ProviderConfig, _env: &ProviderEnv) -> Result<Arc<dyn TranslationProvider>> {
    Ok(Arc::new(OpenAiProvider::from_config(cfg)?))
}

fn build_ollama(cfg: &ProviderConfig, _env: &ProviderEnv) -> Result<Arc<dyn TranslationProvider>> {
    Ok(Arc::new(OllamaProvider::from_config(cfg)?))
}

fn build_google_free(
    cfg: &ProviderConfig,
    _env: &ProviderEnv,
) -> Result<Arc<dyn TranslationProvider>> {
    Ok(Arc::new(GoogleFreeProvider::from_config(cfg)?))
}

fn build_chatgpt(cfg: &ProviderConfig, env: &ProviderEnv) -> Result<Arc<dyn TranslationProvider>> {
    Ok(Arc::new(ChatGptProvider::from_config(cfg, env)?))
}
