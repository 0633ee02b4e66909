//! Configuration data structures for cuebridge.
//!
//! This module defines the schema for the application settings: the local
//! daemon, cache tiers, batch orchestration, the credential store and the list
//! of configured translation backends.
//!
//! Author: kelexine (<https://github.com/kelexine>)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// The root configuration object for the application.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// HTTP daemon settings (host, port, body limit).
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging and observability settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// L1/L2 cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Chunking, context and retry settings for batch translation.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Encrypted session storage.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Provider id used when a request does not name one.
    /// Default: the first entry of `providers`.
    #[serde(default)]
    pub default_provider: Option<String>,

    /// Configured translation backends.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Settings for the local HTTP daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The IP address or hostname the server should bind to.
    /// Default: `127.0.0.1`
    #[serde(default = "default_host")]
    pub host: String,

    /// The port number the server should listen on.
    /// Default: `8787`
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum accepted request body in bytes.
    /// Default: `16 MiB`
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

/// Settings for application logging and output format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum log level (`trace`, `debug`, `info`, `warn`, `error`).
    /// Default: `info`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format for logs (`pretty`, `json`).
    /// Default: `pretty`
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to mask tokens and API keys in logged response bodies.
    /// Default: `true`
    #[serde(default = "default_true")]
    pub sanitize_tokens: bool,
}

/// Settings for the two cache tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum documents held in the in-process tier.
    /// Default: `256`
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,

    /// Optional age limit for in-process entries.
    /// Default: none
    #[serde(default)]
    pub l1_ttl_seconds: Option<u64>,

    /// SQLite database file for the durable tier.
    /// Default: `~/.cuebridge/cache.db`
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Entry-count ceiling for the durable tier.
    /// Default: `500`
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Durable entries older than this are expired. `0` disables expiry.
    /// Default: `720` (30 days)
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,

    /// Interval of the background expiry sweep run by the daemon.
    /// Default: `60`
    #[serde(default = "default_sweep_minutes")]
    pub expiry_sweep_minutes: u64,
}

/// Settings for batch orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Cues per backend call unless the provider overrides it.
    /// Default: `30`
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Translated cues carried from one chunk into the next.
    /// Default: `5`
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Attempts per chunk for retryable failures, including the first.
    /// Default: `3`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Default: `1000`
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Default: `30000`
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Settings for the encrypted session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Directory holding one envelope file per provider id.
    /// Default: `~/.cuebridge/credentials`
    #[serde(default = "default_credentials_dir")]
    pub directory: String,

    /// 32-byte AES key file, created on first use.
    /// Default: `~/.cuebridge/credentials.key`
    #[serde(default = "default_key_path")]
    pub key_path: String,

    /// Seconds before expiry at which a session is refreshed proactively.
    /// Default: `300`
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_seconds: u64,
}

/// Per-million-token pricing used by cost estimates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct PricingConfig {
    #[serde(default)]
    pub input_per_million: f64,
    #[serde(default)]
    pub output_per_million: f64,
}

/// One configured translation backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique id used in requests and as the credential file name.
    pub id: String,

    /// Registry type tag (`anthropic`, `claude-subscription`, `openai`,
    /// `ollama`, `google-free`, `chatgpt-subscription`).
    #[serde(rename = "type")]
    pub provider_type: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    /// Overrides the per-family default timeout.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Overrides `orchestrator.chunk_size` for this backend.
    #[serde(default)]
    pub chunk_size: Option<usize>,

    /// Minimum spacing between requests to this backend.
    #[serde(default)]
    pub min_request_interval_ms: Option<u64>,

    #[serde(default)]
    pub pricing: Option<PricingConfig>,

    #[serde(default)]
    pub oauth_client_id: Option<String>,

    #[serde(default)]
    pub oauth_token_url: Option<String>,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, provider_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_type: provider_type.into(),
            api_key: None,
            model: None,
            base_url: None,
            timeout_seconds: None,
            chunk_size: None,
            min_request_interval_ms: None,
            pricing: None,
            oauth_client_id: None,
            oauth_token_url: None,
        }
    }

    /// Configured timeout, or `default` for the backend family.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("type", &self.provider_type)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl CacheConfig {
    pub fn l1_ttl(&self) -> Option<Duration> {
        self.l1_ttl_seconds.map(Duration::from_secs)
    }

    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_hours > 0).then(|| Duration::from_secs(self.ttl_hours * 3600))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_minutes.max(1) * 60)
    }

    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.database_path)
    }
}

impl OrchestratorConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl CredentialsConfig {
    pub fn directory(&self) -> PathBuf {
        expand_home(&self.directory)
    }

    pub fn key_path(&self) -> PathBuf {
        expand_home(&self.key_path)
    }

    pub fn refresh_skew(&self) -> Duration {
        Duration::from_secs(self.refresh_skew_seconds)
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// Default trait implementations linking to custom logic

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            sanitize_tokens: true,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: default_l1_capacity(),
            l1_ttl_seconds: None,
            database_path: default_database_path(),
            max_entries: default_max_entries(),
            ttl_hours: default_ttl_hours(),
            expiry_sweep_minutes: default_sweep_minutes(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            context_window: default_context_window(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            directory: default_credentials_dir(),
            key_path: default_key_path(),
            refresh_skew_seconds: default_refresh_skew(),
        }
    }
}

// Helper functions for serde defaults and shared constants
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_body_limit() -> usize {
    16 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_l1_capacity() -> usize {
    256
}

fn default_database_path() -> String {
    "~/.cuebridge/cache.db".to_string()
}

fn default_max_entries() -> usize {
    500
}

fn default_ttl_hours() -> u64 {
    720 // 30 days
}

fn default_sweep_minutes() -> u64 {
    60
}

fn default_chunk_size() -> usize {
    30
}

fn default_context_window() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_credentials_dir() -> String {
    "~/.cuebridge/credentials".to_string()
}

fn default_key_path() -> String {
    "~/.cuebridge/credentials.key".to_string()
}

fn default_refresh_skew() -> u64 {
    300 // 5 minutes
}
