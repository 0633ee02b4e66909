// Anthropic Messages API backend (API key or Claude subscription session)
// Author: kelexine (https://github.com/kelexine)

use super::http::{build_client, check_status, classify_status};
use super::prompt::{build_user_prompt, system_prompt, LineCounter};
use super::rate_limit::RateLimiter;
use super::reconcile::finish_completion;
use super::sse::sse_events;
use super::{
    output_budget, record_call, CostEstimate, CredentialCheck, ProgressFn, ProgressTracker,
    ProviderEnv, ProviderKind, ProviderResponse, RateLimitStatus, TranslationProvider,
    TranslationRequest,
};
use crate::auth::{OAuthRefresher, SessionManager, TokenEncoding, CLAUDE_CLIENT_ID, CLAUDE_TOKEN_URL};
use crate::config::{PricingConfig, ProviderConfig};
use crate::error::{BridgeError, Result};
use crate::models::TokenUsage;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// Incoming SSE events. Unknown event types are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    MessageDelta {
        delta: MessageDeltaData,
        #[serde(default)]
        usage: Option<DeltaUsage>,
    },
    MessageStop,
    Error {
        error: ErrorData,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    usage: Option<StartUsage>,
}

#[derive(Debug, Deserialize)]
struct StartUsage {
    #[serde(default)]
    input_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaData {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

/// Map an error embedded in a 200 stream onto the taxonomy.
fn stream_error(error: ErrorData) -> BridgeError {
    let detail = format!("{}: {}", error.error_type, error.message);
    match error.error_type.as_str() {
        "authentication_error" => BridgeError::AuthenticationFailed(detail),
        // Same split as a bare 403: a refresh cannot grant a missing permission
        "permission_error" => classify_status(StatusCode::FORBIDDEN, &HeaderMap::new(), &error.message),
        "rate_limit_error" => BridgeError::rate_limited(detail, None),
        "not_found_error" => BridgeError::ModelNotFound(detail),
        "request_too_large" => BridgeError::ContextLengthExceeded(detail),
        "invalid_request_error" if error.message.contains("too long") => {
            BridgeError::ContextLengthExceeded(detail)
        }
        "invalid_request_error" => BridgeError::InvalidRequest(detail),
        _ => BridgeError::ServiceUnavailable(detail),
    }
}

enum Auth {
    ApiKey(String),
    Session(Arc<SessionManager>),
}

pub struct AnthropicProvider {
    id: String,
    kind: ProviderKind,
    client: Client,
    base_url: String,
    model: String,
    auth: Auth,
    limiter: RateLimiter,
    chunk_size: Option<usize>,
    pricing: Option<PricingConfig>,
}

impl AnthropicProvider {
    pub fn from_config(config: &ProviderConfig, env: &ProviderEnv) -> Result<Self> {
        let kind: ProviderKind = config.provider_type.parse()?;
        let client = build_client(config.timeout_or(kind.default_timeout()))?;

        let auth = match kind {
            ProviderKind::ClaudeSubscription => {
                let refresher = OAuthRefresher::new(
                    client.clone(),
                    config.oauth_token_url.as_deref().unwrap_or(CLAUDE_TOKEN_URL),
                    config.oauth_client_id.as_deref().unwrap_or(CLAUDE_CLIENT_ID),
                    TokenEncoding::Json,
                );
                let manager = SessionManager::load(
                    &config.id,
                    Arc::new(refresher),
                    env.credentials.clone(),
                    env.refresh_skew,
                )?;
                Auth::Session(Arc::new(manager))
            }
            ProviderKind::Anthropic => {
                let key = config
                    .api_key
                    .clone()
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| {
                        BridgeError::Config(format!("provider '{}' requires api_key", config.id))
                    })?;
                Auth::ApiKey(key)
            }
            other => {
                return Err(BridgeError::Config(format!(
                    "anthropic backend cannot serve type '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            id: config.id.clone(),
            kind,
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            auth,
            limiter: RateLimiter::new(Duration::from_millis(
                config.min_request_interval_ms.unwrap_or(0),
            )),
            chunk_size: config.chunk_size,
            pricing: config.pricing,
        })
    }

    /// Session manager for subscription-backed instances.
    pub fn session(&self) -> Option<&Arc<SessionManager>> {
        match &self.auth {
            Auth::Session(manager) => Some(manager),
            Auth::ApiKey(_) => None,
        }
    }

    fn authorize(&self, request: RequestBuilder, bearer: Option<&str>) -> RequestBuilder {
        let request = request.header("anthropic-version", ANTHROPIC_VERSION);
        match (&self.auth, bearer) {
            (Auth::ApiKey(key), _) => request.header("x-api-key", key),
            (Auth::Session(_), Some(token)) => request
                .bearer_auth(token)
                .header("anthropic-beta", OAUTH_BETA),
            (Auth::Session(_), None) => request,
        }
    }

    async fn stream_once(
        &self,
        request: &TranslationRequest,
        bearer: Option<String>,
        tracker: &Mutex<ProgressTracker<'_>>,
    ) -> Result<ProviderResponse> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": output_budget(&request.cues),
            "system": system_prompt(&request.source_language, &request.target_language),
            "messages": [{"role": "user", "content": build_user_prompt(request)}],
            "temperature": 0.2,
            "stream": true,
        });

        self.limiter.wait().await;
        let http = self.authorize(
            self.client
                .post(format!("{}/v1/messages", self.base_url))
                .header("Accept", "text/event-stream")
                .json(&body),
            bearer.as_deref(),
        );

        let response = http.send().await?;
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
        let mut stop_reason: Option<String> = None;
        let mut stopped = false;

        while let Some(event) = events.next().await {
            let event = event?;
            if event.is_done() {
                break;
            }
            let Some(value) = event.json() else {
                continue;
            };
            let parsed: StreamEvent = match serde_json::from_value(value) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("Skipping unrecognized Anthropic event: {}", e);
                    continue;
                }
            };

            match parsed {
                StreamEvent::MessageStart { message } => {
                    if let Some(start) = message.usage {
                        usage.input_tokens = start.input_tokens;
                    }
                }
                StreamEvent::ContentBlockDelta {
                    delta: Delta::TextDelta { text: delta },
                } => {
                    text.push_str(&delta);
                    let done = counter.push(&delta);
                    tracker.lock().update(done);
                }
                StreamEvent::ContentBlockDelta { .. } => {}
                StreamEvent::MessageDelta { delta, usage: delta_usage } => {
                    if delta.stop_reason.is_some() {
                        stop_reason = delta.stop_reason;
                    }
                    if let Some(u) = delta_usage {
                        usage.output_tokens = u.output_tokens;
                    }
                }
                StreamEvent::MessageStop => {
                    stopped = true;
                    break;
                }
                StreamEvent::Error { error } => return Err(stream_error(error)),
                StreamEvent::Other => {}
            }
        }

        if !stopped && text.trim().is_empty() {
            return Err(BridgeError::ServiceUnavailable(
                "stream ended before any content".to_string(),
            ));
        }
        if !stopped {
            warn!("Anthropic stream for {} ended without message_stop", self.id);
        }

        let truncation = match stop_reason.as_deref() {
            Some("max_tokens") => Some("max_tokens"),
            _ if !stopped => Some("stream interrupted"),
            _ => None,
        };
        finish_completion(&request.cues, &text, usage, truncation)
    }
}

#[async_trait]
impl TranslationProvider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn model(&self) -> Option<&str> {
        Some(&self.model)
    }

    fn chunk_size(&self) -> Option<usize> {
        self.chunk_size
    }

    async fn validate_credentials(&self) -> CredentialCheck {
        let bearer = match &self.auth {
            Auth::ApiKey(_) => None,
            Auth::Session(manager) => match manager.current().await {
                Ok(session) => Some(session.access_token.clone()),
                Err(e) => return CredentialCheck::failed(&e),
            },
        };

        let check = self.authorize(
            self.client
                .get(format!("{}/v1/models", self.base_url))
                .query(&[("limit", "1")]),
            bearer.as_deref(),
        );

        match check.send().await {
            Ok(response) if response.status().is_success() => CredentialCheck::ok(),
            // Some OAuth tokens cannot list models but can still send messages
            Ok(response)
                if response.status() == StatusCode::FORBIDDEN
                    && matches!(self.auth, Auth::Session(_)) =>
            {
                let headers = response.headers().clone();
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                match classify_status(status, &headers, &body) {
                    e @ BridgeError::AuthenticationFailed(_) => CredentialCheck::failed(&e),
                    _ => CredentialCheck::ok(),
                }
            }
            Ok(response) => {
                let headers = response.headers().clone();
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                CredentialCheck::failed(&classify_status(status, &headers, &body))
            }
            Err(e) => CredentialCheck::failed(&BridgeError::from(e)),
        }
    }

    async fn translate_stream(
        &self,
        request: &TranslationRequest,
        on_progress: ProgressFn<'_>,
    ) -> Result<ProviderResponse> {
        let started = Instant::now();
        let tracker = Mutex::new(ProgressTracker::new(request.cues.len(), on_progress));

        let result = match &self.auth {
            Auth::ApiKey(_) => self.stream_once(request, None, &tracker).await,
            Auth::Session(manager) => {
                manager
                    .execute(|session| {
                        self.stream_once(request, Some(session.access_token.clone()), &tracker)
                    })
                    .await
            }
        };

        if result.is_ok() {
            tracker.lock().finish();
        }
        record_call(&self.id, started, &result);
        result
    }

    fn rate_limit_status(&self) -> RateLimitStatus {
        self.limiter.status()
    }

    fn estimate_cost(&self, cue_count: usize, avg_chars_per_cue: usize) -> CostEstimate {
        let billed = self.kind == ProviderKind::Anthropic;
        CostEstimate::estimate(cue_count, avg_chars_per_cue, self.pricing, billed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ProviderSession;
    use crate::error::ErrorKind;
    use crate::models::Cue;
    use crate::orchestrator::TranslationContext;
    use crate::providers::ProviderProgress;

    fn request() -> TranslationRequest {
        TranslationRequest {
            cues: vec![Cue::new(0, "Hello"), Cue::new(1, "World")],
            source_language: "en".to_string(),
            target_language: "ja".to_string(),
            context: TranslationContext::default(),
            following: Vec::new(),
        }
    }

    fn sse(events: &[(&str, serde_json::Value)]) -> String {
        events
            .iter()
            .map(|(name, data)| format!("event: {}\ndata: {}\n\n", name, data))
            .collect()
    }

    fn config(base_url: &str) -> ProviderConfig {
        let mut cfg = ProviderConfig::new("claude", "anthropic");
        cfg.api_key = Some("sk-ant-test".to_string());
        cfg.base_url = Some(base_url.to_string());
        cfg
    }

    #[tokio::test]
    async fn test_streamed_translation() {
        let mut server = mockito::Server::new_async().await;
        let body = sse(&[
            ("message_start", serde_json::json!({"type":"message_start","message":{"usage":{"input_tokens":42}}})),
            ("content_block_delta", serde_json::json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"0. こんにちは\n"}})),
            ("content_block_delta", serde_json::json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"1. 世界\n"}})),
            ("message_delta", serde_json::json!({"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":9}})),
            ("message_stop", serde_json::json!({"type":"message_stop"})),
        ]);
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "sk-ant-test")
            .match_header("anthropic-version", ANTHROPIC_VERSION)
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let provider = AnthropicProvider::from_config(&config(&server.url()), &ProviderEnv::default()).unwrap();
        let seen = Mutex::new(Vec::new());
        let record = |p: ProviderProgress| seen.lock().push(p.percentage);
        let response = provider.translate_stream(&request(), &record).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.cues[1].translated_text.as_deref(), Some("世界"));
        assert_eq!(response.usage.input_tokens, 42);
        assert_eq!(response.usage.output_tokens, 9);
        assert!(response.warnings.is_empty());

        let seen = seen.lock();
        assert_eq!(seen.first(), Some(&0.0));
        assert_eq!(seen.last(), Some(&100.0));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_embedded_overload_error() {
        let mut server = mockito::Server::new_async().await;
        let body = sse(&[(
            "error",
            serde_json::json!({"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}),
        )]);
        let _mock = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let provider = AnthropicProvider::from_config(&config(&server.url()), &ProviderEnv::default()).unwrap();
        let err = provider.translate(&request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
    }

    #[test]
    fn test_permission_error_is_not_an_auth_failure() {
        let denied = stream_error(ErrorData {
            error_type: "permission_error".to_string(),
            message: "Your organization does not have access to this model".to_string(),
        });
        assert_eq!(denied.kind(), ErrorKind::ServiceUnavailable);

        let blocked = stream_error(ErrorData {
            error_type: "permission_error".to_string(),
            message: "Request blocked due to unusual activity".to_string(),
        });
        assert_eq!(blocked.kind(), ErrorKind::RateLimited);

        let expired = stream_error(ErrorData {
            error_type: "authentication_error".to_string(),
            message: "invalid x-api-key".to_string(),
        });
        assert_eq!(expired.kind(), ErrorKind::AuthenticationFailed);
    }

    #[tokio::test]
    async fn test_permission_error_skips_session_refresh() {
        let mut server = mockito::Server::new_async().await;
        let body = sse(&[(
            "error",
            serde_json::json!({"type":"error","error":{"type":"permission_error","message":"Your organization does not have access to this model"}}),
        )]);
        let messages = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body(body)
            .expect(1)
            .create_async()
            .await;
        let token = server
            .mock("POST", "/v1/oauth/token")
            .expect(0)
            .create_async()
            .await;

        let mut cfg = ProviderConfig::new("claude-pro", "claude-subscription");
        cfg.base_url = Some(server.url());
        cfg.oauth_token_url = Some(format!("{}/v1/oauth/token", server.url()));
        let provider = AnthropicProvider::from_config(&cfg, &ProviderEnv::default()).unwrap();
        provider
            .session()
            .unwrap()
            .reauthenticate(ProviderSession::new("current").with_refresh_token("rt-1"))
            .await
            .unwrap();

        let err = provider.translate(&request()).await.unwrap_err();
        assert_ne!(err.kind(), ErrorKind::AuthenticationFailed);
        messages.assert_async().await;
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_subscription_refreshes_once_on_401() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("POST", "/v1/messages")
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .with_body(r#"{"type":"error","error":{"type":"authentication_error","message":"OAuth token has expired"}}"#)
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/v1/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","refresh_token":"rt-2","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("POST", "/v1/messages")
            .match_header("authorization", "Bearer fresh")
            .match_header("anthropic-beta", OAUTH_BETA)
            .with_status(200)
            .with_body(sse(&[
                ("content_block_delta", serde_json::json!({"type":"content_block_delta","delta":{"type":"text_delta","text":"0. a\n1. b\n"}})),
                ("message_stop", serde_json::json!({"type":"message_stop"})),
            ]))
            .create_async()
            .await;

        let mut cfg = ProviderConfig::new("claude-pro", "claude-subscription");
        cfg.base_url = Some(server.url());
        cfg.oauth_token_url = Some(format!("{}/v1/oauth/token", server.url()));
        let provider = AnthropicProvider::from_config(&cfg, &ProviderEnv::default()).unwrap();
        provider
            .session()
            .unwrap()
            .reauthenticate(ProviderSession::new("stale").with_refresh_token("rt-1"))
            .await
            .unwrap();

        let response = provider.translate(&request()).await.unwrap();
        assert_eq!(response.cues[0].translated_text.as_deref(), Some("a"));
        rejected.assert_async().await;
        refresh.assert_async().await;
        accepted.assert_async().await;
    }

    #[test]
    fn test_api_key_required() {
        let cfg = ProviderConfig::new("claude", "anthropic");
        let err = AnthropicProvider::from_config(&cfg, &ProviderEnv::default()).err().unwrap();
        assert!(err.to_string().contains("api_key"));
    }
}
