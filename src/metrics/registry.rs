// Prometheus metrics registry and collectors
// Author: kelexine (https://github.com/kelexine)

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec_with_registry, register_gauge_vec_with_registry,
    register_histogram_vec_with_registry, CounterVec, Encoder, GaugeVec, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tracing::warn;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // HTTP DAEMON METRICS
    // ============================================================================

    /// Total number of API requests
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec_with_registry!(
        Opts::new("cuebridge_requests_total", "Total number of API requests"),
        &["method", "endpoint", "status_code"],
        REGISTRY
    ).unwrap();

    /// Request duration histogram
    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec_with_registry!(
        prometheus::HistogramOpts::new("cuebridge_request_duration_seconds", "Request duration in seconds")
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 180.0]),
        &["method", "endpoint"],
        REGISTRY
    ).unwrap();

    // ============================================================================
    // CACHE METRICS
    // ============================================================================

    /// Cache lookups by resolving tier
    pub static ref CACHE_LOOKUPS: CounterVec = register_counter_vec_with_registry!(
        Opts::new("cuebridge_cache_lookups_total", "Cache lookups by resolving tier"),
        &["tier"], // tier: l1, l2, miss, error
        REGISTRY
    ).unwrap();

    /// Write-through outcomes
    pub static ref CACHE_WRITES: CounterVec = register_counter_vec_with_registry!(
        Opts::new("cuebridge_cache_writes_total", "Cache write-through outcomes"),
        &["outcome"], // outcome: persisted, failed
        REGISTRY
    ).unwrap();

    /// Durable entries removed by eviction
    pub static ref CACHE_EVICTIONS: CounterVec = register_counter_vec_with_registry!(
        Opts::new("cuebridge_cache_evictions_total", "Durable cache evictions"),
        &["reason"], // reason: lru, expired, invalidated
        REGISTRY
    ).unwrap();

    /// Current cache entries
    pub static ref CACHE_ENTRIES: GaugeVec = register_gauge_vec_with_registry!(
        Opts::new("cuebridge_cache_entries", "Current number of cache entries"),
        &["tier"],
        REGISTRY
    ).unwrap();

    // ============================================================================
    // PROVIDER METRICS
    // ============================================================================

    /// Provider calls by outcome
    pub static ref PROVIDER_CALLS: CounterVec = register_counter_vec_with_registry!(
        Opts::new("cuebridge_provider_calls_total", "Total translation backend calls"),
        &["provider", "outcome"], // outcome: ok or an error kind
        REGISTRY
    ).unwrap();

    /// Provider call duration
    pub static ref PROVIDER_DURATION: HistogramVec = register_histogram_vec_with_registry!(
        prometheus::HistogramOpts::new("cuebridge_provider_duration_seconds", "Translation backend call duration")
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0]),
        &["provider"],
        REGISTRY
    ).unwrap();

    /// Total tokens reported by backends
    pub static ref TOKENS_TOTAL: CounterVec = register_counter_vec_with_registry!(
        Opts::new("cuebridge_tokens_total", "Total tokens processed"),
        &["provider", "type"], // type: input, output
        REGISTRY
    ).unwrap();

    // ============================================================================
    // SESSION METRICS
    // ============================================================================

    /// OAuth session refresh events
    pub static ref SESSION_REFRESHES: CounterVec = register_counter_vec_with_registry!(
        Opts::new("cuebridge_session_refreshes_total", "Total OAuth session refreshes"),
        &["provider", "status"], // status: success, failure
        REGISTRY
    ).unwrap();

    // ============================================================================
    // ORCHESTRATOR METRICS
    // ============================================================================

    /// Chunk dispatch outcomes
    pub static ref CHUNKS_TOTAL: CounterVec = register_counter_vec_with_registry!(
        Opts::new("cuebridge_chunks_total", "Translated chunks by outcome"),
        &["outcome"], // outcome: ok, retried, failed, cancelled
        REGISTRY
    ).unwrap();
}

/// Gather all metrics and return as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
