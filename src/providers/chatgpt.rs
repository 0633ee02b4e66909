// ChatGPT subscription backend (Codex responses endpoint)
// Author: kelexine (https://github.com/kelexine)

//! The endpoint only streams, and it can answer HTTP 200 and still fail: the
//! failure then arrives inside the stream as an `error` event, a
//! `response.failed` / `response.incomplete` event, or a terminal
//! `response.status` other than `completed`. Those, and a stream that ends
//! without any text, are `SERVICE_UNAVAILABLE`. Request validation errors come
//! back as a plain JSON `{"detail": ...}` body instead of a stream.

use super::http::{build_client, classify_status};
use super::prompt::{build_user_prompt, system_prompt, LineCounter};
use super::rate_limit::RateLimiter;
use super::reconcile::finish_completion;
use super::sse::sse_events;
use super::{
    record_call, CostEstimate, CredentialCheck, ProgressFn, ProgressTracker, ProviderEnv,
    ProviderKind, ProviderResponse, RateLimitStatus, TranslationProvider, TranslationRequest,
};
use crate::auth::{
    OAuthRefresher, ProviderSession, SessionManager, SessionState, TokenEncoding,
    CHATGPT_CLIENT_ID, CHATGPT_TOKEN_URL,
};
use crate::config::ProviderConfig;
use crate::error::{BridgeError, Result};
use crate::models::TokenUsage;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api";
pub const DEFAULT_MODEL: &str = "gpt-5.1-codex-mini";

/// The subscription backend is shared with interactive use; pace requests.
const DEFAULT_MIN_INTERVAL_MS: u64 = 1000;

/// Classify a non-stream `{"detail": ...}` body.
fn detail_error(detail: &str) -> BridgeError {
    if detail.to_lowercase().contains("not supported") {
        BridgeError::ModelNotFound(detail.to_string())
    } else {
        BridgeError::InvalidRequest(detail.to_string())
    }
}

fn embedded_error(message: &str) -> BridgeError {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("usage limit") {
        BridgeError::rate_limited(message.to_string(), None)
    } else if lower.contains("context length") || lower.contains("context window") {
        BridgeError::ContextLengthExceeded(message.to_string())
    } else {
        BridgeError::ServiceUnavailable(message.to_string())
    }
}

/// Accumulated state of one Codex stream.
#[derive(Debug, Default)]
struct CodexStream {
    text: String,
    usage: TokenUsage,
    completed: bool,
}

impl CodexStream {
    /// Fold one event into the state. Returns the text delta, if any.
    fn apply(&mut self, event: &Value) -> Result<Option<String>> {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();

        if let Some(status) = event
            .pointer("/response/status")
            .and_then(Value::as_str)
        {
            if matches!(status, "failed" | "incomplete" | "cancelled") {
                let reason = event
                    .pointer("/response/error/message")
                    .or_else(|| event.pointer("/response/incomplete_details/reason"))
                    .and_then(Value::as_str)
                    .unwrap_or(status);
                return Err(BridgeError::ServiceUnavailable(format!(
                    "response {}: {}",
                    status, reason
                )));
            }
        }

        match event_type {
            "response.output_text.delta" => {
                let delta = event.get("delta").and_then(Value::as_str).unwrap_or_default();
                self.text.push_str(delta);
                Ok(Some(delta.to_string()))
            }
            "error" => {
                let message = event
                    .get("message")
                    .or_else(|| event.pointer("/error/message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| event.to_string());
                Err(embedded_error(&message))
            }
            "response.failed" | "response.incomplete" => Err(BridgeError::ServiceUnavailable(
                format!("stream reported {}", event_type),
            )),
            "response.completed" => {
                if let Some(usage) = event.pointer("/response/usage") {
                    let count = |field: &str| {
                        usage.get(field).and_then(Value::as_u64).unwrap_or(0) as u32
                    };
                    self.usage = TokenUsage {
                        input_tokens: count("input_tokens"),
                        output_tokens: count("output_tokens"),
                    };
                }
                self.completed = true;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn finish(self, request: &TranslationRequest) -> Result<ProviderResponse> {
        if self.text.trim().is_empty() {
            return Err(BridgeError::ServiceUnavailable(
                "Codex stream ended without content".to_string(),
            ));
        }
        let truncation = (!self.completed).then_some("stream ended before response.completed");
        finish_completion(&request.cues, &self.text, self.usage, truncation)
    }
}

pub struct ChatGptProvider {
    id: String,
    client: Client,
    base_url: String,
    model: String,
    session: Arc<SessionManager>,
    limiter: RateLimiter,
    chunk_size: Option<usize>,
}

impl ChatGptProvider {
    pub fn from_config(config: &ProviderConfig, env: &ProviderEnv) -> Result<Self> {
        let client = build_client(
            config.timeout_or(ProviderKind::ChatGptSubscription.default_timeout()),
        )?;
        let refresher = OAuthRefresher::new(
            client.clone(),
            config.oauth_token_url.as_deref().unwrap_or(CHATGPT_TOKEN_URL),
            config.oauth_client_id.as_deref().unwrap_or(CHATGPT_CLIENT_ID),
            TokenEncoding::Form,
        );
        let session = SessionManager::load(
            &config.id,
            Arc::new(refresher),
            env.credentials.clone(),
            env.refresh_skew,
        )?;

        Ok(Self {
            id: config.id.clone(),
            client,
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            session: Arc::new(session),
            limiter: RateLimiter::new(Duration::from_millis(
                config
                    .min_request_interval_ms
                    .unwrap_or(DEFAULT_MIN_INTERVAL_MS),
            )),
            chunk_size: config.chunk_size,
        })
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    async fn stream_once(
        &self,
        request: &TranslationRequest,
        session: ProviderSession,
        tracker: &Mutex<ProgressTracker<'_>>,
    ) -> Result<ProviderResponse> {
        let payload = serde_json::json!({
            "model": self.model,
            "instructions": system_prompt(&request.source_language, &request.target_language),
            "input": [{
                "type": "message",
                "role": "user",
                "content": [{"type": "input_text", "text": build_user_prompt(request)}],
            }],
            "stream": true,
            "store": false,
        });

        let mut http = self
            .client
            .post(format!("{}/codex/responses", self.base_url))
            .bearer_auth(&session.access_token)
            .header("Accept", "text/event-stream")
            .json(&payload);
        if let Some(account_id) = session.resolve_account_id() {
            http = http.header("ChatGPT-Account-Id", account_id);
        }

        self.limiter.wait().await;
        let response = http.send().await?;
        self.limiter.observe_headers(response.headers());

        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));

        if !status.is_success() || is_json {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&body).ok().and_then(|v| {
                v.get("detail").map(|d| match d.as_str() {
                    Some(s) => s.to_string(),
                    None => d.to_string(),
                })
            });

            let error = match detail {
                // Auth and throttling statuses take precedence over the detail text
                Some(detail) if !matches!(status.as_u16(), 401 | 403 | 429 | 500..=599) => {
                    detail_error(&detail)
                }
                _ if status.is_success() => BridgeError::InvalidResponse(format!(
                    "expected an event stream, got: {}",
                    crate::utils::logging::excerpt(&body, 200)
                )),
                _ => classify_status(status, &headers, &body),
            };
            if let BridgeError::RateLimited { retry_after, .. } = &error {
                self.limiter.observe_rate_limited(*retry_after);
            }
            return Err(error);
        }

        let events = sse_events(response.bytes_stream());
        futures::pin_mut!(events);

        let mut stream = CodexStream::default();
        let mut counter = LineCounter::new();
        while let Some(event) = events.next().await {
            let event = event?;
            if event.is_done() {
                break;
            }
            let Some(value) = event.json() else {
                continue;
            };
            if let Some(delta) = stream.apply(&value)? {
                let done = counter.push(&delta);
                tracker.lock().update(done);
            }
            if stream.completed {
                break;
            }
        }

        debug!(
            "Codex stream finished: {} chars, completed={}",
            stream.text.len(),
            stream.completed
        );
        stream.finish(request)
    }
}

#[async_trait]
impl TranslationProvider for ChatGptProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::ChatGptSubscription
    }

    fn model(&self) -> Option<&str> {
        Some(&self.model)
    }

    fn chunk_size(&self) -> Option<usize> {
        self.chunk_size
    }

    /// Local check only: a test request would spend subscription quota.
    async fn validate_credentials(&self) -> CredentialCheck {
        let session = match self.session.current().await {
            Ok(session) => session,
            Err(e) => return CredentialCheck::failed(&e),
        };

        let expired = session.expires_in_seconds().is_some_and(|s| s <= 0);
        if expired && !session.can_refresh() {
            return CredentialCheck::failed(&BridgeError::AuthenticationFailed(
                "session expired and has no refresh token".to_string(),
            ));
        }
        if session.resolve_account_id().is_none() {
            return CredentialCheck::failed(&BridgeError::AuthenticationFailed(
                "session has no ChatGPT account id".to_string(),
            ));
        }
        if self.session.state() == SessionState::Invalid {
            return CredentialCheck::failed(&BridgeError::AuthenticationFailed(
                "session was invalidated".to_string(),
            ));
        }
        CredentialCheck::ok()
    }

    async fn translate_stream(
        &self,
        request: &TranslationRequest,
        on_progress: ProgressFn<'_>,
    ) -> Result<ProviderResponse> {
        let started = Instant::now();
        let tracker = Mutex::new(ProgressTracker::new(request.cues.len(), on_progress));

        let result = self
            .session
            .execute(|session| self.stream_once(request, session, &tracker))
            .await;

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
        CostEstimate::estimate(cue_count, avg_chars_per_cue, None, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::Cue;
    use crate::orchestrator::TranslationContext;

    fn request() -> TranslationRequest {
        TranslationRequest {
            cues: vec![Cue::new(0, "Hello"), Cue::new(1, "Bye")],
            source_language: "en".to_string(),
            target_language: "zh-TW".to_string(),
            context: TranslationContext::default(),
            following: Vec::new(),
        }
    }

    async fn provider(server: &mockito::Server) -> ChatGptProvider {
        let mut cfg = ProviderConfig::new("chatgpt", "chatgpt-subscription");
        cfg.base_url = Some(server.url());
        cfg.min_request_interval_ms = Some(0);
        let provider = ChatGptProvider::from_config(&cfg, &ProviderEnv::default()).unwrap();
        provider
            .session()
            .reauthenticate(ProviderSession::new("at-1").with_account_id("acct-9"))
            .await
            .unwrap();
        provider
    }

    #[test]
    fn test_apply_tracks_text_and_usage() {
        let mut stream = CodexStream::default();
        let delta = stream
            .apply(&serde_json::json!({"type":"response.output_text.delta","delta":"0. 你好\n"}))
            .unwrap();
        assert_eq!(delta.as_deref(), Some("0. 你好\n"));
        stream
            .apply(&serde_json::json!({
                "type":"response.completed",
                "response":{"status":"completed","usage":{"input_tokens":50,"output_tokens":7}}
            }))
            .unwrap();
        assert!(stream.completed);
        assert_eq!(stream.usage.output_tokens, 7);
    }

    #[test]
    fn test_detail_classification() {
        assert_eq!(
            detail_error("The 'gpt-4' model is not supported when using Codex").kind(),
            ErrorKind::ModelNotFound
        );
        assert_eq!(detail_error("Instructions are required").kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_embedded_failed_status_is_service_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "event: response.created\n",
            "data: {\"type\":\"response.created\",\"response\":{\"status\":\"in_progress\"}}\n\n",
            "event: response.failed\n",
            "data: {\"type\":\"response.failed\",\"response\":{\"status\":\"failed\",\"error\":{\"message\":\"upstream error\"}}}\n\n",
        );
        let mock = server
            .mock("POST", "/codex/responses")
            .match_header("authorization", "Bearer at-1")
            .match_header("chatgpt-account-id", "acct-9")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let err = provider(&server).await.translate(&request()).await.unwrap_err();
        mock.assert_async().await;
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn test_empty_stream_is_service_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/codex/responses")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("data: [DONE]\n\n")
            .create_async()
            .await;

        let err = provider(&server).await.translate(&request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn test_detail_body_unsupported_model() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/codex/responses")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"detail":"The 'gpt-4o' model is not supported when using Codex with a ChatGPT account."}"#)
            .create_async()
            .await;

        let err = provider(&server).await.translate(&request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelNotFound);
    }

    #[tokio::test]
    async fn test_successful_stream() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"0. 你好\\n1. \"}\n\n",
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"再見\\n\"}\n\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"status\":\"completed\"}}\n\n",
        );
        let _mock = server
            .mock("POST", "/codex/responses")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let response = provider(&server).await.translate(&request()).await.unwrap();
        assert_eq!(response.cues[1].translated_text.as_deref(), Some("再見"));
        assert!(response.warnings.is_empty());
    }
}
