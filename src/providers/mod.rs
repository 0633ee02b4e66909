//! Translation backends.
//!
//! Every backend implements [`TranslationProvider`]. Backends own their
//! authentication (API keys or a [`SessionManager`](crate::auth::SessionManager))
//! and their response-stream parsing; callers only ever see reconciled cues
//! and [`BridgeError`](crate::error::BridgeError) classes.
//!
//! # Submodules
//!
//! - `registry`: type-tag → constructor table
//! - `http`: client construction and HTTP status classification
//! - `sse`: SSE / NDJSON framing over byte streams
//! - `prompt`: prompt text and numbered-line response parsing
//! - `reconcile`: index-based matching of responses to requested cues
//! - `rate_limit`: request spacing and advisory limit status
//!
//! Author: kelexine (<https://github.com/kelexine>)

pub mod anthropic;
pub mod chatgpt;
pub mod google_free;
pub mod http;
pub mod ollama;
pub mod openai;
pub mod prompt;
pub mod rate_limit;
pub mod reconcile;
pub mod registry;
pub mod sse;

pub use registry::{ProviderEnv, ProviderRegistry};

use crate::config::PricingConfig;
use crate::error::{ErrorKind, Result};
use crate::models::{Cue, TokenUsage, TranslationWarning};
use crate::orchestrator::TranslationContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Built-in backend families. The registry is keyed by [`ProviderKind::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Anthropic,
    ClaudeSubscription,
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
    GoogleFree,
    #[serde(rename = "chatgpt-subscription")]
    ChatGptSubscription,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 6] = [
        ProviderKind::Anthropic,
        ProviderKind::ClaudeSubscription,
        ProviderKind::OpenAi,
        ProviderKind::Ollama,
        ProviderKind::GoogleFree,
        ProviderKind::ChatGptSubscription,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::ClaudeSubscription => "claude-subscription",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
            ProviderKind::GoogleFree => "google-free",
            ProviderKind::ChatGptSubscription => "chatgpt-subscription",
        }
    }

    /// Local daemons get a short timeout, rate-limited remote LLMs a generous one.
    pub fn default_timeout(&self) -> std::time::Duration {
        use std::time::Duration;
        match self {
            ProviderKind::Ollama => Duration::from_secs(60),
            ProviderKind::GoogleFree => Duration::from_secs(30),
            _ => Duration::from_secs(180),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = crate::error::BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| crate::error::BridgeError::ProviderNotRegistered(s.to_string()))
    }
}

/// One chunk of work for a backend.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub cues: Vec<Cue>,
    pub source_language: String,
    pub target_language: String,
    pub context: TranslationContext,
    /// Opening cues of the next chunk, sent as look-ahead only.
    pub following: Vec<Cue>,
}

/// Reconciled backend output: one cue per requested index, in request order.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub cues: Vec<Cue>,
    pub warnings: Vec<TranslationWarning>,
    /// Name mappings the backend reported for this chunk.
    pub glossary: BTreeMap<String, String>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderProgress {
    /// In `[0, 100]`, never decreasing within one call.
    pub percentage: f32,
    pub completed_cues: usize,
    pub total_cues: usize,
}

/// Callback for streamed progress.
pub type ProgressFn<'a> = &'a (dyn Fn(ProviderProgress) + Send + Sync);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl CredentialCheck {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
            error_kind: None,
        }
    }

    pub fn failed(error: &crate::error::BridgeError) -> Self {
        Self {
            valid: false,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    /// True while the backend has asked us to back off.
    pub limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_requests: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_after_ms: Option<u64>,
    pub min_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// `None` when no pricing is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_usd: Option<f64>,
    /// Subscription and free backends are not billed per token.
    pub billed_per_token: bool,
}

/// Rough characters-per-token ratio used by all estimates.
pub const CHARS_PER_TOKEN: u64 = 4;

impl CostEstimate {
    /// Token estimate for `cue_count` cues of `avg_chars_per_cue`, with
    /// prompt overhead on the input side.
    pub fn estimate(
        cue_count: usize,
        avg_chars_per_cue: usize,
        pricing: Option<PricingConfig>,
        billed_per_token: bool,
    ) -> Self {
        let chars = (cue_count * avg_chars_per_cue) as u64;
        let text_tokens = chars.div_ceil(CHARS_PER_TOKEN);
        // Numbering and instructions add roughly a quarter plus a fixed header
        let input_tokens = text_tokens + text_tokens / 4 + 200;
        let output_tokens = text_tokens + text_tokens / 10;

        let estimated_usd = pricing.filter(|_| billed_per_token).map(|p| {
            (input_tokens as f64 * p.input_per_million + output_tokens as f64 * p.output_per_million)
                / 1_000_000.0
        });

        Self {
            input_tokens,
            output_tokens,
            estimated_usd,
            billed_per_token,
        }
    }
}

/// Uniform contract over all translation backends.
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    /// Configured id (unique per process).
    fn id(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn model(&self) -> Option<&str>;

    /// Cues per call when the backend has its own practical limit.
    fn chunk_size(&self) -> Option<usize> {
        None
    }

    /// Cheap check. Never mutates stored credentials on failure.
    async fn validate_credentials(&self) -> CredentialCheck;

    async fn translate(&self, request: &TranslationRequest) -> Result<ProviderResponse> {
        self.translate_stream(request, &|_: ProviderProgress| {}).await
    }

    /// Same result as [`translate`](Self::translate), reporting progress as
    /// the response streams in.
    async fn translate_stream(
        &self,
        request: &TranslationRequest,
        on_progress: ProgressFn<'_>,
    ) -> Result<ProviderResponse>;

    fn rate_limit_status(&self) -> RateLimitStatus;

    fn estimate_cost(&self, cue_count: usize, avg_chars_per_cue: usize) -> CostEstimate;
}

/// Serializable description of a configured provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub rate_limit: RateLimitStatus,
}

impl ProviderInfo {
    pub fn describe(provider: &dyn TranslationProvider) -> Self {
        Self {
            id: provider.id().to_string(),
            kind: provider.kind(),
            model: provider.model().map(str::to_string),
            rate_limit: provider.rate_limit_status(),
        }
    }
}

/// Record call latency, outcome and token usage for one backend call.
pub(crate) fn record_call(
    provider_id: &str,
    started: std::time::Instant,
    result: &Result<ProviderResponse>,
) {
    let elapsed = started.elapsed().as_secs_f64();
    match result {
        Ok(response) => {
            crate::metrics::record_provider_call(provider_id, "success", elapsed);
            crate::metrics::record_tokens(provider_id, response.usage);
        }
        Err(e) => crate::metrics::record_provider_call(provider_id, e.kind().as_str(), elapsed),
    }
}

/// Output token budget for a chunk: roughly the input size plus numbering.
pub(crate) fn output_budget(cues: &[Cue]) -> u32 {
    let chars: usize = cues.iter().map(|c| c.source_text.chars().count()).sum();
    let estimate = chars / 2 + cues.len() * 16 + 512;
    estimate.clamp(1024, 8192) as u32
}

/// Emits monotonically non-decreasing progress for one call.
pub struct ProgressTracker<'a> {
    total: usize,
    reported: usize,
    on_progress: ProgressFn<'a>,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(total: usize, on_progress: ProgressFn<'a>) -> Self {
        let tracker = Self {
            total,
            reported: 0,
            on_progress,
        };
        tracker.emit();
        tracker
    }

    /// Report `completed` cues; lower values than already reported are ignored.
    pub fn update(&mut self, completed: usize) {
        let completed = completed.min(self.total);
        if completed > self.reported {
            self.reported = completed;
            self.emit();
        }
    }

    pub fn finish(&mut self) {
        if self.reported < self.total {
            self.reported = self.total;
        }
        self.emit();
    }

    fn emit(&self) {
        let percentage = if self.total == 0 {
            100.0
        } else {
            (self.reported as f32 / self.total as f32 * 100.0).min(100.0)
        };
        (self.on_progress)(ProviderProgress {
            percentage,
            completed_cues: self.reported,
            total_cues: self.total,
        });
    }
}
