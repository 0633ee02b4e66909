// Error types for cuebridge
// Author: kelexine (https://github.com/kelexine)

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Malformed cache key: {0}")]
    MalformedKey(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider not registered: {0}")]
    ProviderNotRegistered(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Translation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parsing error: {0}")]
    ConfigParsing(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire-level classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthenticationFailed,
    RateLimited,
    ServiceUnavailable,
    ModelNotFound,
    ContextLengthExceeded,
    NetworkError,
    StorageUnavailable,
    MalformedKey,
    InvalidResponse,
    ProviderNotRegistered,
    InvalidRequest,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorKind::ContextLengthExceeded => "CONTEXT_LENGTH_EXCEEDED",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorKind::MalformedKey => "MALFORMED_KEY",
            ErrorKind::InvalidResponse => "INVALID_RESPONSE",
            ErrorKind::ProviderNotRegistered => "PROVIDER_NOT_REGISTERED",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BridgeError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        BridgeError::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            BridgeError::RateLimited { .. } => ErrorKind::RateLimited,
            BridgeError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            BridgeError::ModelNotFound(_) => ErrorKind::ModelNotFound,
            BridgeError::ContextLengthExceeded(_) => ErrorKind::ContextLengthExceeded,
            BridgeError::Network(_) => ErrorKind::NetworkError,
            BridgeError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            BridgeError::MalformedKey(_) => ErrorKind::MalformedKey,
            BridgeError::InvalidResponse(_) | BridgeError::Json(_) => ErrorKind::InvalidResponse,
            BridgeError::ProviderNotRegistered(_) => ErrorKind::ProviderNotRegistered,
            BridgeError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            BridgeError::Cancelled => ErrorKind::Cancelled,
            BridgeError::Config(_)
            | BridgeError::ConfigParsing(_)
            | BridgeError::Io(_)
            | BridgeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Rate limits, upstream outages and transport failures may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited | ErrorKind::ServiceUnavailable | ErrorKind::NetworkError
        )
    }

    /// Server-provided retry hint, when the backend sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BridgeError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BridgeError::Network(format!("request timed out: {}", e))
        } else if e.is_decode() {
            BridgeError::InvalidResponse(format!("failed to decode body: {}", e))
        } else {
            BridgeError::Network(e.to_string())
        }
    }
}

impl From<rusqlite::Error> for BridgeError {
    fn from(e: rusqlite::Error) -> Self {
        BridgeError::StorageUnavailable(e.to_string())
    }
}

// Convert BridgeError to HTTP responses for Axum
impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = match kind {
            ErrorKind::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ServiceUnavailable | ErrorKind::StorageUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::ModelNotFound | ErrorKind::ProviderNotRegistered => StatusCode::NOT_FOUND,
            ErrorKind::ContextLengthExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::NetworkError | ErrorKind::InvalidResponse => StatusCode::BAD_GATEWAY,
            ErrorKind::MalformedKey | ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            // 499 is not in the registry; report as a client-side abort
            ErrorKind::Cancelled => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({
            "type": "error",
            "error": {
                "type": kind.as_str(),
                "message": self.to_string(),
            }
        });

        if let Some(delay) = self.retry_after() {
            body["error"]["retryAfterMs"] = json!(delay.as_millis() as u64);
        }

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(BridgeError::rate_limited("slow down", None).is_retryable());
        assert!(BridgeError::ServiceUnavailable("down".into()).is_retryable());
        assert!(BridgeError::Network("reset".into()).is_retryable());
        assert!(!BridgeError::AuthenticationFailed("bad".into()).is_retryable());
        assert!(!BridgeError::ContextLengthExceeded("too long".into()).is_retryable());
        assert!(!BridgeError::StorageUnavailable("quota".into()).is_retryable());
    }

    #[test]
    fn test_kind_wire_names() {
        let kind = BridgeError::MalformedKey("x".into()).kind();
        assert_eq!(kind.as_str(), "MALFORMED_KEY");
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"MALFORMED_KEY\"");
        assert_eq!(
            BridgeError::Network("x".into()).kind().as_str(),
            "NETWORK_ERROR"
        );
    }

    #[test]
    fn test_retry_after_only_on_rate_limit() {
        let err = BridgeError::rate_limited("429", Some(Duration::from_secs(3)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(BridgeError::ServiceUnavailable("x".into()).retry_after(), None);
    }
}
