//! Structured logging and security-focused trace utilities.
//!
//! This module configures the `tracing` ecosystem for the application,
//! supporting multiple output formats and providing utilities to prevent
//! sensitive data (bearer tokens, API keys, JWTs) from leaking into logs.
//!
//! Author: kelexine (<https://github.com/kelexine>)

use crate::config::LoggingConfig;
use crate::error::{BridgeError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the global tracing subscriber for the application.
///
/// Supports two output formats:
/// - `json`: Structured JSON logs for production ingestion.
/// - `pretty` (default): Human-readable, colorized output for development.
///
/// Log levels are controlled via the `RUST_LOG` environment variable or
/// the provided `LoggingConfig`.
pub fn init(config: &LoggingConfig) -> Result<()> {
    // Configure filter from environment or config file
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let installed = match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
    };

    installed.map_err(|e| BridgeError::Internal(format!("failed to install logger: {}", e)))
}

static BEARER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=\-]+").unwrap());
static API_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"sk-[A-Za-z0-9_\-]{8,}").unwrap());
static JWT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"eyJ[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]*").unwrap());
static TOKEN_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(access_token|refresh_token|id_token|api_key)"\s*:\s*"[^"]*""#).unwrap()
});

/// Sanitizes sensitive information from log messages.
///
/// Replaces bearer credentials, `sk-` API keys, JWTs and token-valued JSON
/// fields with a `[REDACTED]` placeholder so upstream error bodies can be
/// logged safely.
pub fn sanitize(input: &str) -> String {
    let result = TOKEN_FIELD.replace_all(input, r#""$1":"[REDACTED]""#);
    let result = BEARER.replace_all(&result, "Bearer [REDACTED]");
    let result = JWT.replace_all(&result, "[REDACTED_JWT]");
    let result = API_KEY.replace_all(&result, "[REDACTED_API_KEY]");
    result.into_owned()
}

/// Sanitize and truncate an upstream body for inclusion in errors and logs.
pub fn excerpt(body: &str, max_chars: usize) -> String {
    let clean = sanitize(body.trim());
    if clean.chars().count() <= max_chars {
        return clean;
    }
    let mut out: String = clean.chars().take(max_chars).collect();
    out.push('…');
    out
}
