//! Cache records, lookup results and statistics.

// Author: kelexine (https://github.com/kelexine)

use super::key::CacheKey;
use crate::models::TranslatedDocument;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheTier {
    L1,
    L2,
    Miss,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::L1 => "l1",
            CacheTier::L2 => "l2",
            CacheTier::Miss => "miss",
        }
    }
}

/// Result of [`CacheManager::resolve`](super::CacheManager::resolve).
#[derive(Debug, Clone)]
pub struct Resolution {
    /// `None` exactly when `tier` is [`CacheTier::Miss`].
    pub payload: Option<Arc<TranslatedDocument>>,
    pub tier: CacheTier,
}

impl Resolution {
    pub fn miss() -> Self {
        Self {
            payload: None,
            tier: CacheTier::Miss,
        }
    }

    pub fn hit(payload: Arc<TranslatedDocument>, tier: CacheTier) -> Self {
        Self {
            payload: Some(payload),
            tier,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.payload.is_some()
    }
}

/// One durable row, as returned by full scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: CacheKey,
    pub video_id: String,
    pub payload: TranslatedDocument,
    pub created_at_ms: i64,
    /// Never earlier than `created_at_ms`.
    pub last_accessed_at_ms: i64,
    pub access_count: u64,
    /// Length of the serialized payload.
    pub size_bytes: u64,
}

/// Listing view of a [`CacheEntry`] without the payload body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntrySummary {
    pub key: String,
    pub video_id: String,
    pub source_language: String,
    pub target_language: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub cue_count: usize,
    pub created_at_ms: i64,
    pub last_accessed_at_ms: i64,
    pub access_count: u64,
    pub size_bytes: u64,
}

impl From<&CacheEntry> for CacheEntrySummary {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.serialize(),
            video_id: entry.video_id.clone(),
            source_language: entry.key.source_language.clone(),
            target_language: entry.key.target_language.clone(),
            provider: entry.key.provider.clone(),
            model: entry.key.model.clone(),
            cue_count: entry.payload.cues.len(),
            created_at_ms: entry.created_at_ms,
            last_accessed_at_ms: entry.last_accessed_at_ms,
            access_count: entry.access_count,
            size_bytes: entry.size_bytes,
        }
    }
}

/// Statistics for cache operations.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Lookups answered by the in-process tier.
    pub l1_hits: u64,
    /// Lookups answered by the durable tier.
    pub l2_hits: u64,
    pub misses: u64,
    /// Durable reads or writes that failed and were degraded.
    pub l2_errors: u64,
    /// Successful write-throughs.
    pub stores: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.l1_hits + self.l2_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.l1_hits + self.l2_hits) as f64 / total as f64
        }
    }
}
