// Free Google web translation endpoint (no credentials)
// Author: kelexine (https://github.com/kelexine)

use super::http::{build_client, check_status};
use super::rate_limit::RateLimiter;
use super::reconcile::reconcile;
use super::{
    record_call, CostEstimate, CredentialCheck, ProgressFn, ProgressTracker, ProviderKind,
    ProviderResponse, RateLimitStatus, TranslationProvider, TranslationRequest,
};
use crate::config::ProviderConfig;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use urlencoding::encode;

pub const DEFAULT_BASE_URL: &str = "https://translate.googleapis.com";

/// The endpoint throttles aggressively; keep a gap between cue requests.
const DEFAULT_MIN_INTERVAL_MS: u64 = 200;

/// Concatenate the translated segments of a `translate_a/single` response.
fn parse_segments(body: &Value) -> Result<String> {
    let segments = body
        .get(0)
        .and_then(Value::as_array)
        .ok_or_else(|| BridgeError::InvalidResponse("unexpected translate response shape".into()))?;

    let text: String = segments
        .iter()
        .filter_map(|segment| segment.get(0).and_then(Value::as_str))
        .collect();
    Ok(text)
}

pub struct GoogleFreeProvider {
    id: String,
    client: Client,
    base_url: String,
    limiter: RateLimiter,
    chunk_size: Option<usize>,
}

impl GoogleFreeProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            id: config.id.clone(),
            client: build_client(config.timeout_or(ProviderKind::GoogleFree.default_timeout()))?,
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            limiter: RateLimiter::new(Duration::from_millis(
                config
                    .min_request_interval_ms
                    .unwrap_or(DEFAULT_MIN_INTERVAL_MS),
            )),
            chunk_size: config.chunk_size,
        })
    }

    async fn translate_text(&self, text: &str, source: &str, target: &str) -> Result<String> {
        let source = if source.is_empty() { "auto" } else { source };
        let url = format!(
            "{}/translate_a/single?client=gtx&sl={}&tl={}&dt=t&q={}",
            self.base_url,
            encode(source),
            encode(target),
            encode(text)
        );

        self.limiter.wait().await;
        let response = self.client.get(url).send().await?;
        let response = check_status(response).await.inspect_err(|e| {
            if let BridgeError::RateLimited { retry_after, .. } = e {
                self.limiter.observe_rate_limited(*retry_after);
            }
        })?;

        let body: Value = response.json().await?;
        parse_segments(&body)
    }
}

#[async_trait]
impl TranslationProvider for GoogleFreeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleFree
    }

    fn model(&self) -> Option<&str> {
        None
    }

    fn chunk_size(&self) -> Option<usize> {
        self.chunk_size
    }

    async fn validate_credentials(&self) -> CredentialCheck {
        match self.translate_text("hello", "en", "fr").await {
            Ok(_) => CredentialCheck::ok(),
            Err(e) => CredentialCheck::failed(&e),
        }
    }

    async fn translate_stream(
        &self,
        request: &TranslationRequest,
        on_progress: ProgressFn<'_>,
    ) -> Result<ProviderResponse> {
        let started = Instant::now();
        let mut tracker = ProgressTracker::new(request.cues.len(), on_progress);
        let mut translations = BTreeMap::new();

        let mut outcome = Ok(());
        for (done, cue) in request.cues.iter().enumerate() {
            if cue.source_text.trim().is_empty() {
                translations.insert(cue.index, String::new());
            } else {
                match self
                    .translate_text(&cue.source_text, &request.source_language, &request.target_language)
                    .await
                {
                    Ok(text) if !text.trim().is_empty() => {
                        translations.insert(cue.index, text.trim().to_string());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
            }
            tracker.update(done + 1);
        }

        let result = outcome.map(|()| {
            tracker.finish();
            let (cues, warnings) = reconcile(&request.cues, translations);
            ProviderResponse {
                cues,
                warnings,
                ..Default::default()
            }
        });
        record_call(&self.id, started, &result);
        result
    }

    fn rate_limit_status(&self) -> RateLimitStatus {
        self.limiter.status()
    }

    fn estimate_cost(&self, cue_count: usize, avg_chars_per_cue: usize) -> CostEstimate {
        CostEstimate::estimate(cue_count, avg_chars_per_cue, None, false)
    }
}
