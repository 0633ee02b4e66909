// HTTP plumbing shared by network backends
// Author: kelexine (https://github.com/kelexine)

use crate::error::{BridgeError, Result};
use crate::utils::logging::excerpt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("cuebridge/", env!("CARGO_PKG_VERSION"));

/// Characters of an upstream error body kept in error messages.
const BODY_EXCERPT: usize = 300;

/// Build a pooled client with a finite request timeout.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .pool_max_idle_per_host(8)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| BridgeError::Internal(format!("failed to build HTTP client: {}", e)))
}

/// Known auth-failure wording across backends.
static AUTH_FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        invalid[\s_-]?(api[\s_-]?key|x-api-key|token|access[\s_-]?token|bearer|grant|authentication|credentials)
        | authentication[\s_-]?(error|failed|required)
        | unauthori[sz]ed
        | (token|session)\s+(has\s+)?(expired|been\s+revoked|is\s+expired)
        | expired[\s_-]token
        | not\s+authenticated
        | oauth\s+token
        | refresh_token_reused
        | token_expired
        | invalid_token",
    )
    .unwrap()
});

/// Wording used by abuse or traffic filters; these 403s are not auth failures.
static TRAFFIC_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)unusual\s+(traffic|activity)|too\s+many|rate\s*limit|captcha|automated\s+(queries|requests)|abuse")
        .unwrap()
});

static CONTEXT_LENGTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)context[\s_-]length|maximum context|prompt is too long|too many tokens|max_tokens|request too large")
        .unwrap()
});

static MODEL_MISSING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)model.*(not found|does not exist|not supported|unknown|not available)|(unknown|unsupported) model|model_not_found")
        .unwrap()
});

/// True when a 401/403 body describes a credential problem.
pub fn is_auth_error(body: &str) -> bool {
    AUTH_FAILURE.is_match(body)
}

/// `Retry-After` as delta-seconds or HTTP date, or `retry-after-ms`.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
    {
        return Some(Duration::from_millis(ms.max(0.0) as u64));
    }

    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<f64>() {
        return Some(Duration::from_millis((seconds.max(0.0) * 1000.0) as u64));
    }

    let at = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = at.timestamp_millis() - chrono::Utc::now().timestamp_millis();
    Some(Duration::from_millis(delta.max(0) as u64))
}

/// Map a non-success HTTP response onto the error taxonomy.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> BridgeError {
    let detail = format!("HTTP {}: {}", status.as_u16(), excerpt(body, BODY_EXCERPT));
    let retry_after = parse_retry_after(headers);

    match status.as_u16() {
        401 => BridgeError::AuthenticationFailed(detail),
        403 if is_auth_error(body) => BridgeError::AuthenticationFailed(detail),
        403 if TRAFFIC_BLOCK.is_match(body) => BridgeError::rate_limited(detail, retry_after),
        403 => BridgeError::ServiceUnavailable(detail),
        404 => BridgeError::ModelNotFound(detail),
        408 => BridgeError::Network(detail),
        413 => BridgeError::ContextLengthExceeded(detail),
        429 => BridgeError::rate_limited(detail, retry_after),
        400 | 422 if CONTEXT_LENGTH.is_match(body) => BridgeError::ContextLengthExceeded(detail),
        400 | 422 if MODEL_MISSING.is_match(body) => BridgeError::ModelNotFound(detail),
        400 | 422 => BridgeError::InvalidRequest(detail),
        500..=599 => BridgeError::ServiceUnavailable(detail),
        _ => BridgeError::InvalidResponse(detail),
    }
}

/// Pass successful responses through; turn everything else into a classified error.
pub async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), body = %excerpt(&body, BODY_EXCERPT), "Backend returned error");
    Err(classify_status(status, &headers, &body))
}
