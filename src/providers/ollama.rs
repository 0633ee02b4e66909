// Local Ollama daemon backend (NDJSON streaming)
// Author: kelexine (https://github.com/kelexine)

use super::http::{build_client, check_status};
use super::prompt::{build_user_prompt, system_prompt, LineCounter};
use super::rate_limit::RateLimiter;
use super::reconcile::finish_completion;
use super::sse::ndjson_values;
use super::{
    output_budget, record_call, CostEstimate, CredentialCheck, ProgressFn, ProgressTracker,
    ProviderKind, ProviderResponse, RateLimitStatus, TranslationProvider, TranslationRequest,
};
use crate::config::ProviderConfig;
use crate::error::{BridgeError, Result};
use crate::models::TokenUsage;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.1";

#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

fn daemon_error(message: String) -> BridgeError {
    let lower = message.to_lowercase();
    if lower.contains("not found") || lower.contains("pull") {
        BridgeError::ModelNotFound(message)
    } else if lower.contains("context") {
        BridgeError::ContextLengthExceeded(message)
    } else {
        BridgeError::ServiceUnavailable(message)
    }
}

/// `llama3.1` matches an installed `llama3.1:latest`.
fn model_matches(installed: &str, wanted: &str) -> bool {
    installed == wanted
        || (!wanted.contains(':') && installed.strip_suffix(":latest") == Some(wanted))
}

pub struct OllamaProvider {
    id: String,
    client: Client,
    base_url: String,
    model: String,
    limiter: RateLimiter,
    chunk_size: Option<usize>,
}

impl OllamaProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            id: config.id.clone(),
            client: build_client(config.timeout_or(ProviderKind::Ollama.default_timeout()))?,
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            limiter: RateLimiter::new(Duration::from_millis(
                config.min_request_interval_ms.unwrap_or(0),
            )),
            chunk_size: config.chunk_size,
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
            "stream": true,
            "options": {
                "temperature": 0.2,
                "num_predict": output_budget(&request.cues),
            },
        });

        self.limiter.wait().await;
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let lines = ndjson_values(response.bytes_stream());
        futures::pin_mut!(lines);

        let mut text = String::new();
        let mut counter = LineCounter::new();
        let mut usage = TokenUsage::default();
        let mut done_reason: Option<String> = None;
        let mut finished = false;

        while let Some(line) = lines.next().await {
            let line: ChatLine = serde_json::from_value(line?)?;
            if let Some(error) = line.error {
                return Err(daemon_error(error));
            }
            if let Some(message) = line.message {
                text.push_str(&message.content);
                tracker.update(counter.push(&message.content));
            }
            if line.done {
                usage = TokenUsage {
                    input_tokens: line.prompt_eval_count.unwrap_or(0),
                    output_tokens: line.eval_count.unwrap_or(0),
                };
                done_reason = line.done_reason;
                finished = true;
                break;
            }
        }

        if !finished && text.trim().is_empty() {
            return Err(BridgeError::ServiceUnavailable(
                "daemon closed the stream without content".to_string(),
            ));
        }

        let truncation = match (finished, done_reason.as_deref()) {
            (false, _) => Some("stream interrupted"),
            (true, Some("length")) => Some("length"),
            _ => None,
        };
        finish_completion(&request.cues, &text, usage, truncation)
    }

    async fn check_model(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;
        let tags: TagList = check_status(response).await?.json().await?;
        if tags.models.iter().any(|m| model_matches(&m.name, &self.model)) {
            Ok(())
        } else {
            Err(BridgeError::ModelNotFound(format!(
                "model '{}' is not installed; run `ollama pull {}`",
                self.model, self.model
            )))
        }
    }
}

#[async_trait]
impl TranslationProvider for OllamaProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn model(&self) -> Option<&str> {
        Some(&self.model)
    }

    fn chunk_size(&self) -> Option<usize> {
        self.chunk_size
    }

    /// Checks the daemon is reachable and has the configured model installed.
    async fn validate_credentials(&self) -> CredentialCheck {
        match self.check_model().await {
            Ok(()) => CredentialCheck::ok(),
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
        CostEstimate::estimate(cue_count, avg_chars_per_cue, None, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::Cue;
    use crate::orchestrator::TranslationContext;

    fn provider(server: &mockito::Server, model: &str) -> OllamaProvider {
        let mut cfg = ProviderConfig::new("local", "ollama");
        cfg.base_url = Some(server.url());
        cfg.model = Some(model.to_string());
        OllamaProvider::from_config(&cfg).unwrap()
    }

    #[test]
    fn test_model_matching() {
        assert!(model_matches("llama3.1:latest", "llama3.1"));
        assert!(model_matches("qwen2.5:7b", "qwen2.5:7b"));
        assert!(!model_matches("qwen2.5:7b", "qwen2.5"));
    }

    #[tokio::test]
    async fn test_missing_model_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"llama3.1:latest"}]}"#)
            .expect(2)
            .create_async()
            .await;

        assert!(provider(&server, "llama3.1").validate_credentials().await.valid);
        let check = provider(&server, "mistral").validate_credentials().await;
        assert_eq!(check.error_kind, Some(ErrorKind::ModelNotFound));
    }

    #[tokio::test]
    async fn test_ndjson_translation() {
        let mut server = mockito::Server::new_async().await;
        let body = [
            r#"{"message":{"role":"assistant","content":"0. Hola\n"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":"1. Adiós\n"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":80,"eval_count":12}"#,
        ]
        .join("\n");
        let _mock = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let request = TranslationRequest {
            cues: vec![Cue::new(0, "Hello"), Cue::new(1, "Goodbye")],
            source_language: "en".to_string(),
            target_language: "es".to_string(),
            context: TranslationContext::default(),
            following: Vec::new(),
        };
        let response = provider(&server, "llama3.1").translate(&request).await.unwrap();
        assert_eq!(response.cues[1].translated_text.as_deref(), Some("Adiós"));
        assert_eq!(response.usage.output_tokens, 12);
        assert!(response.warnings.is_empty());
    }
}
