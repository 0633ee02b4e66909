// HTTP surface tests against a mocked local backend
// Author: kelexine (https://github.com/kelexine)

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use cuebridge::cache::CacheManager;
use cuebridge::config::{AppConfig, ProviderConfig};
use cuebridge::orchestrator::Orchestrator;
use cuebridge::providers::{ProviderEnv, ProviderRegistry};
use cuebridge::server::create_router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct Harness {
    app: Router,
    _dir: tempfile::TempDir,
}

fn harness(server: &mockito::ServerGuard) -> Harness {
    let dir = tempfile::tempdir().unwrap();

    let mut config = AppConfig::default();
    config.cache.database_path = dir.path().join("cache.db").display().to_string();
    config.orchestrator.initial_backoff_ms = 1;
    config.orchestrator.max_backoff_ms = 2;

    let mut local = ProviderConfig::new("local", "ollama");
    local.base_url = Some(server.url());
    local.model = Some("llama3.1".to_string());
    config.providers.push(local);

    let env = ProviderEnv {
        credentials: None,
        refresh_skew: Duration::from_secs(60),
    };
    let providers = ProviderRegistry::with_builtins().instantiate_all(&config.providers, &env);
    let cache = Arc::new(CacheManager::from_config(&config.cache));
    let orchestrator = Arc::new(Orchestrator::from_config(&config, cache, providers));

    Harness {
        app: create_router(config, orchestrator, CancellationToken::new()),
        _dir: dir,
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn translate_body() -> Value {
    json!({
        "track": {
            "videoId": "abc123",
            "platform": "youtube",
            "sourceLanguage": "en",
            "format": "json3",
            "cues": [
                {"index": 0, "startMs": 0, "endMs": 1200, "sourceText": "Hello"},
                {"index": 1, "startMs": 1200, "endMs": 2500, "sourceText": "Goodbye"}
            ]
        },
        "targetLanguage": "es"
    })
}

fn ndjson_reply() -> String {
    [
        r#"{"message":{"role":"assistant","content":"0. Hola\n"},"done":false}"#,
        r#"{"message":{"role":"assistant","content":"1. Adiós\n"},"done":false}"#,
        r#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":40,"eval_count":8}"#,
    ]
    .join("\n")
}

#[tokio::test]
async fn test_translate_then_serve_from_cache() {
    let mut server = mockito::Server::new_async().await;
    let chat = server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body(ndjson_reply())
        .expect(1)
        .create_async()
        .await;
    let h = harness(&server);

    let (status, first) = call(&h.app, "POST", "/v1/translate", Some(translate_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["cached"], false);
    assert_eq!(first["persisted"], true);
    assert_eq!(first["provider"], "local");
    assert_eq!(first["cues"][0]["translatedText"], "Hola");
    assert_eq!(first["cues"][1]["translatedText"], "Adiós");
    assert_eq!(first["cues"][1]["endMs"], 2500);

    let (status, second) = call(&h.app, "POST", "/v1/translate", Some(translate_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["cached"], true);
    assert_eq!(second["tier"], "L1");
    assert_eq!(second["cues"], first["cues"]);

    chat.assert_async().await;

    let (status, listed) = call(&h.app, "GET", "/v1/cache?videoId=abc123", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let (status, deleted) = call(&h.app, "DELETE", "/v1/cache/abc123", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["count"], 1);
}

#[tokio::test]
async fn test_backend_outage_maps_to_error_body() {
    let mut server = mockito::Server::new_async().await;
    let _chat = server
        .mock("POST", "/api/chat")
        .with_status(503)
        .with_body(r#"{"error":"model is loading"}"#)
        .create_async()
        .await;
    let h = harness(&server);

    let (status, body) = call(&h.app, "POST", "/v1/translate", Some(translate_body())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["type"], "SERVICE_UNAVAILABLE");

    let (_, listed) = call(&h.app, "GET", "/v1/cache", None).await;
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn test_unknown_provider_is_not_found() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server);

    let mut body = translate_body();
    body["provider"] = json!("deepl");
    let (status, error) = call(&h.app, "POST", "/v1/translate", Some(body)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["error"]["type"], "PROVIDER_NOT_REGISTERED");

    let (status, _) = call(&h.app, "POST", "/v1/providers/deepl/validate", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_cue_indices_are_rejected() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server);

    let mut body = translate_body();
    body["track"]["cues"][1]["index"] = json!(0);
    let (status, error) = call(&h.app, "POST", "/v1/translate", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"]["type"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_provider_listing_and_estimate() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server);

    let (status, providers) = call(&h.app, "GET", "/v1/providers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(providers[0]["id"], "local");

    let (status, estimate) = call(
        &h.app,
        "POST",
        "/v1/providers/local/estimate",
        Some(json!({"cueCount": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(estimate["billedPerToken"], false);
    assert!(estimate["inputTokens"].as_u64().unwrap() > 1000);
    assert!(estimate.get("estimatedUsd").is_none());
}

#[tokio::test]
async fn test_health_reports_durable_tier() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server);

    let (status, health) = call(&h.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["checks"]["durable_cache"]["status"], "ok");
}
