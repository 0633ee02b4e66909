// Metrics module for Prometheus observability
// Author: kelexine (https://github.com/kelexine)

mod registry;

use crate::models::TokenUsage;

pub use registry::{
    gather_metrics, CACHE_ENTRIES, CACHE_EVICTIONS, CACHE_LOOKUPS, CACHE_WRITES, CHUNKS_TOTAL,
    PROVIDER_CALLS, PROVIDER_DURATION, REQUESTS_TOTAL, REQUEST_DURATION, SESSION_REFRESHES,
    TOKENS_TOTAL,
};

/// Helper to record request metrics
pub fn record_request(method: &str, endpoint: &str, status_code: u16, duration_secs: f64) {
    REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, &status_code.to_string()])
        .inc();

    REQUEST_DURATION
        .with_label_values(&[method, endpoint])
        .observe(duration_secs);
}

/// Helper to record which tier answered a lookup (`l1`, `l2`, `miss`, `error`)
pub fn record_cache_lookup(tier: &str) {
    CACHE_LOOKUPS.with_label_values(&[tier]).inc();
}

pub fn record_cache_write(persisted: bool) {
    let outcome = if persisted { "persisted" } else { "failed" };
    CACHE_WRITES.with_label_values(&[outcome]).inc();
}

pub fn record_cache_eviction(count: usize) {
    CACHE_EVICTIONS
        .with_label_values(&["lru"])
        .inc_by(count as f64);
}

pub fn record_cache_expired(count: usize) {
    CACHE_EVICTIONS
        .with_label_values(&["expired"])
        .inc_by(count as f64);
}

pub fn record_cache_invalidated(count: usize) {
    CACHE_EVICTIONS
        .with_label_values(&["invalidated"])
        .inc_by(count as f64);
}

pub fn update_cache_entries(tier: &str, count: usize) {
    CACHE_ENTRIES.with_label_values(&[tier]).set(count as f64);
}

/// Helper to record backend call metrics
pub fn record_provider_call(provider: &str, outcome: &str, duration_secs: f64) {
    PROVIDER_CALLS.with_label_values(&[provider, outcome]).inc();
    PROVIDER_DURATION
        .with_label_values(&[provider])
        .observe(duration_secs);
}

/// Helper to record token usage
pub fn record_tokens(provider: &str, usage: TokenUsage) {
    if usage.input_tokens > 0 {
        TOKENS_TOTAL
            .with_label_values(&[provider, "input"])
            .inc_by(usage.input_tokens as f64);
    }
    if usage.output_tokens > 0 {
        TOKENS_TOTAL
            .with_label_values(&[provider, "output"])
            .inc_by(usage.output_tokens as f64);
    }
}

pub fn record_session_refresh(provider: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    SESSION_REFRESHES.with_label_values(&[provider, status]).inc();
}

/// Helper to record chunk outcomes (`ok`, `retried`, `failed`, `cancelled`)
pub fn record_chunk(outcome: &str) {
    CHUNKS_TOTAL.with_label_values(&[outcome]).inc();
}
