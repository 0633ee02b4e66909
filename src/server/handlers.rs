// HTTP request handlers
// Author: kelexine (https://github.com/kelexine)

use super::routes::AppState;
use crate::cache::{CacheEntrySummary, CacheStats, KeyFilter};
use crate::error::{BridgeError, Result};
use crate::metrics::gather_metrics;
use crate::models::CaptureTrack;
use crate::orchestrator::{BatchRequest, BatchResult, TranslationContext};
use crate::providers::{CostEstimate, CredentialCheck, ProviderInfo};
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HashMap<String, HealthCheck>,
    pub cache: CacheStats,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: String,
}

impl HealthCheck {
    fn new(status: &str, message: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            message: message.into(),
        }
    }
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut checks = HashMap::new();
    let mut overall_status = HealthStatus::Healthy;
    let cache = state.orchestrator.cache();

    // Durable tier
    let durable_check = match cache.durable_len().await {
        Ok(entries) => HealthCheck::new("ok", format!("{} durable entries", entries)),
        Err(e) => {
            overall_status = HealthStatus::Degraded;
            HealthCheck::new("warning", format!("running L1 only: {}", e))
        }
    };
    checks.insert("durable_cache".to_string(), durable_check);

    // Providers
    let providers = state.orchestrator.providers();
    let provider_check = if providers.is_empty() {
        overall_status = HealthStatus::Unhealthy;
        HealthCheck::new("error", "no providers configured")
    } else {
        let limited: Vec<&str> = providers
            .iter()
            .filter(|p| p.rate_limit_status().limited)
            .map(|p| p.id())
            .collect();
        if limited.is_empty() {
            HealthCheck::new("ok", format!("{} providers", providers.len()))
        } else {
            HealthCheck::new("warning", format!("rate limited: {}", limited.join(", ")))
        }
    };
    checks.insert("providers".to_string(), provider_check);

    Json(HealthResponse {
        status: overall_status,
        checks,
        cache: cache.stats().await,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

/// Body of `POST /v1/translate`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateBody {
    pub track: CaptureTrack,
    pub target_language: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub context: Option<TranslationContext>,
}

impl From<TranslateBody> for BatchRequest {
    fn from(body: TranslateBody) -> Self {
        BatchRequest {
            video_id: body.track.video_id,
            source_language: body.track.source_language,
            target_language: body.target_language,
            cues: body.track.cues,
            provider: body.provider,
            context: body.context,
        }
    }
}

/// The batch is cancelled if the daemon shuts down. A client disconnect drops
/// this future, which aborts the in-flight backend call with it.
pub async fn translate_handler(
    State(state): State<AppState>,
    Json(body): Json<TranslateBody>,
) -> Result<Json<BatchResult>> {
    info!(
        video_id = %body.track.video_id,
        platform = %body.track.platform,
        format = %body.track.format,
        cues = body.track.cues.len(),
        target = %body.target_language,
        "Translate request"
    );

    let cancel = state.shutdown.child_token();
    let result = state
        .orchestrator
        .translate_batch(body.into(), &cancel)
        .await?;
    Ok(Json(result))
}

pub async fn list_providers_handler(State(state): State<AppState>) -> Json<Vec<ProviderInfo>> {
    Json(
        state
            .orchestrator
            .providers()
            .iter()
            .map(|p| ProviderInfo::describe(p.as_ref()))
            .collect(),
    )
}

pub async fn validate_provider_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CredentialCheck>> {
    let provider = state.orchestrator.provider(Some(&id))?;
    Ok(Json(provider.validate_credentials().await))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateBody {
    pub cue_count: usize,
    #[serde(default = "default_avg_chars")]
    pub avg_chars_per_cue: usize,
}

fn default_avg_chars() -> usize {
    40
}

pub async fn estimate_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<EstimateBody>,
) -> Result<Json<CostEstimate>> {
    let provider = state.orchestrator.provider(Some(&id))?;
    Ok(Json(
        provider.estimate_cost(body.cue_count, body.avg_chars_per_cue),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheQuery {
    pub video_id: Option<String>,
}

pub async fn list_cache_handler(
    State(state): State<AppState>,
    Query(query): Query<CacheQuery>,
) -> Result<Json<Vec<CacheEntrySummary>>> {
    let filter = query.video_id.map(KeyFilter::video).unwrap_or_default();
    let entries = state.orchestrator.cache().list(&filter).await?;
    Ok(Json(entries.iter().map(CacheEntrySummary::from).collect()))
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: usize,
}

pub async fn delete_video_cache_handler(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
) -> Result<Json<CountResponse>> {
    if video_id.trim().is_empty() {
        return Err(BridgeError::InvalidRequest("video id must not be empty".into()));
    }
    let count = state.orchestrator.cache().invalidate_video(&video_id).await?;
    Ok(Json(CountResponse { count }))
}

pub async fn evict_expired_handler(State(state): State<AppState>) -> Result<Json<CountResponse>> {
    let count = state.orchestrator.cache().evict_expired().await?;
    Ok(Json(CountResponse { count }))
}
