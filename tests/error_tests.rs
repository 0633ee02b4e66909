// Error handling tests
// Author: kelexine (https://github.com/kelexine)

use axum::http::StatusCode;
use axum::response::IntoResponse;
use cuebridge::error::{BridgeError, ErrorKind};
use serde_json::Value;
use std::time::Duration;

async fn render(error: BridgeError) -> (StatusCode, Value) {
    let response = error.into_response();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[test]
fn test_error_display_messages() {
    let errors = vec![
        BridgeError::AuthenticationFailed("token revoked".to_string()),
        BridgeError::rate_limited("quota", None),
        BridgeError::ServiceUnavailable("upstream down".to_string()),
        BridgeError::ModelNotFound("gpt-9".to_string()),
        BridgeError::ContextLengthExceeded("too long".to_string()),
        BridgeError::Network("reset".to_string()),
        BridgeError::StorageUnavailable("disk full".to_string()),
        BridgeError::MalformedKey("v0|x".to_string()),
        BridgeError::InvalidResponse("no numbered lines".to_string()),
        BridgeError::ProviderNotRegistered("deepl".to_string()),
        BridgeError::InvalidRequest("no cues".to_string()),
        BridgeError::Cancelled,
    ];

    for error in errors {
        let display = format!("{}", error);
        assert!(!display.is_empty(), "Error should have display message");
    }
}

#[test]
fn test_json_errors_classify_as_invalid_response() {
    let parse_error = serde_json::from_str::<Value>("{not json").unwrap_err();
    let error: BridgeError = parse_error.into();
    assert_eq!(error.kind(), ErrorKind::InvalidResponse);
    assert!(!error.is_retryable());
}

#[test]
fn test_io_errors_are_internal() {
    let error: BridgeError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
    assert_eq!(error.kind(), ErrorKind::Internal);
}

#[test]
fn test_kind_serializes_to_wire_name() {
    let kinds = [
        (ErrorKind::AuthenticationFailed, "AUTHENTICATION_FAILED"),
        (ErrorKind::ContextLengthExceeded, "CONTEXT_LENGTH_EXCEEDED"),
        (ErrorKind::ProviderNotRegistered, "PROVIDER_NOT_REGISTERED"),
        (ErrorKind::NetworkError, "NETWORK_ERROR"),
    ];
    for (kind, name) in kinds {
        assert_eq!(kind.to_string(), name);
        assert_eq!(serde_json::to_value(kind).unwrap(), Value::from(name));
    }
}

#[tokio::test]
async fn test_rate_limit_response_carries_retry_hint() {
    let (status, body) =
        render(BridgeError::rate_limited("slow down", Some(Duration::from_millis(1500)))).await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "RATE_LIMITED");
    assert_eq!(body["error"]["retryAfterMs"], 1500);
}

#[tokio::test]
async fn test_response_status_mapping() {
    let cases = [
        (
            BridgeError::AuthenticationFailed("x".into()),
            StatusCode::UNAUTHORIZED,
        ),
        (
            BridgeError::ProviderNotRegistered("x".into()),
            StatusCode::NOT_FOUND,
        ),
        (
            BridgeError::InvalidRequest("x".into()),
            StatusCode::BAD_REQUEST,
        ),
        (
            BridgeError::StorageUnavailable("x".into()),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        (BridgeError::Network("x".into()), StatusCode::BAD_GATEWAY),
        (BridgeError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
    ];

    for (error, expected) in cases {
        let kind = error.kind();
        let (status, body) = render(error).await;
        assert_eq!(status, expected, "{}", kind);
        assert_eq!(body["error"]["type"], kind.as_str());
        assert!(body["error"].get("retryAfterMs").is_none());
    }
}
