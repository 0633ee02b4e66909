// OpenAI-compatible chat completions backend
// Author: kelexine (https://github.com/kelexine)

use super::http::{build_client, check_status};
use super::prompt::{build_user_prompt, system_prompt, LineCounter};
use super::rate_limit::RateLimiter;
use super::reconcile::finish_completion;
use super::sse::sse_events;
use super::{
    output_budget, record_call, CostEstimate, CredentialCheck, ProgressFn, ProgressTracker,
    ProviderKind, ProviderResponse, RateLimitStatus, TranslationProvider, TranslationRequest,
};
use crate::config::{PricingConfig, ProviderConfig};
use crate::error::{BridgeError, Result};
use crate::models::TokenUsage;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: ChoiceDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChoiceDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

fn stream_error(error: ApiError) -> BridgeError {
    let code = error
        .code
        .as_ref()
        .map(|c| c.to_string().trim_matches('"').to_string())
        .unwrap_or_default();
    let kind = error.error_type.unwrap_or_default();
    let detail = format!("{} {}: {}", kind, code, error.message);

    if code == "context_length_exceeded" {
        BridgeError::ContextLengthExceeded(detail)
    } else if code == "model_not_found" {
        BridgeError::ModelNotFound(detail)
    } else if code == "rate_limit_exceeded" || kind == "rate_limit_error" {
        BridgeError::rate_limited(detail, None)
    } else if code == "invalid_api_key" || kind == "authentication_error" {
        BridgeError::AuthenticationFailed(detail)
    } else {
        BridgeError::ServiceUnavailable(detail)
    }
}

pub struct OpenAiProvider {
    id: String,
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    limiter: RateLimiter,
    chunk_size: Option<usize>,
    pricing: Option<PricingConfig>,
}

impl OpenAiProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| BridgeError::Config(format!("provider '{}' requires api_key", config.id)))?;

        Ok(Self {
            id: config.id.clone(),
            client: build_client(config.timeout_or(ProviderKind::OpenAi.default_timeout()))?,
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key,
            limiter: RateLimiter::new(Duration::from_millis(
                config.min_request_interval_ms.unwrap_or(0),
            )),
            chunk_size: config.chunk_size,
            pricing: config.pricing,
        })
    }

    async fn stream_once(
        &self,
        request: &TranslationRequest,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<ProviderResponse> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt(&request.source_language, &request.target_language)},
                {"role": "user", "content": build_user_prompt(request)},
            ],
            "max_tokens": output_budget(&request.cues),
            "temperature": 0.2,
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        self.limiter.wait().await;
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;
        self.limiter.observe_headers(response.headers());
        let response = check_status(response).await.inspect_err(|e| {
            if let BridgeError::RateLimited { retry_after, .. } = e {
                self.limiter.observe_rate_limited(*retry_after);
            }
        })?;

        let events = sse_events(response.bytes_stream());
        futures::pin_mut!(events);

        let mut text = String::new();
        let mut counter = LineCounter::new();
        let mut usage = TokenUsage::default();
        let mut finish_reason: Option<String> = None;

        while let Some(event) = events.next().await {
            let event = event?;
            if event.is_done() {
                break;
            }
            let Some(value) = event.json() else {
                continue;
            };
            let chunk: Chunk = match serde_json::from_value(value) {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("Skipping unrecognized completion chunk: {}", e);
                    continue;
                }
            };

            if let Some(error) = chunk.error {
                return Err(stream_error(error));
            }
            if let Some(u) = chunk.usage {
                usage = TokenUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                };
            }
            for choice in chunk.choices {
                if let Some(delta) = choice.delta.content {
                    text.push_str(&delta);
                    tracker.update(counter.push(&delta));
                }
                if choice.finish_reason.is_some() {
                    finish_reason = choice.finish_reason;
                }
            }
        }

        let truncation = match finish_reason.as_deref() {
            Some("length") => Some("length"),
            Some("content_filter") => Some("content_filter"),
            _ => None,
        };
        finish_completion(&request.cues, &text, usage, truncation)
    }
}

#[async_trait]
impl TranslationProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn model(&self) -> Option<&str> {
        Some(&self.model)
    }

    fn chunk_size(&self) -> Option<usize> {
        self.chunk_size
    }

    async fn validate_credentials(&self) -> CredentialCheck {
        let check = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await;

        match check {
            Ok(response) => match check_status(response).await {
                Ok(_) => CredentialCheck::ok(),
                Err(e) => CredentialCheck::failed(&e),
            },
            Err(e) => CredentialCheck::failed(&BridgeError::from(e)),
        }
    }

    async fn translate_stream(
        &self,
        request: &TranslationRequest,
        on_progress: ProgressFn<'_>,
    ) -> Result<ProviderResponse> {
        let started = Instant::now();
        let mut tracker = ProgressTracker::new(request.cues.len(), on_progress);
        let result = self.stream_once(request, &mut tracker).await;
        if result.is_ok() {
            tracker.finish();
        }
        record_call(&self.id, started, &result);
        result
    }

    fn rate_limit_status(&self) -> RateLimitStatus {
        self.limiter.status()
    }

    fn estimate_cost(&self, cue_count: usize, avg_chars_per_cue: usize) -> CostEstimate {
        CostEstimate::estimate(cue_count, avg_chars_per_cue, self.pricing, true)
    }
}
