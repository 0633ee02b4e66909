// Cache manager - composes the in-process and durable tiers
// Author: kelexine (https://github.com/kelexine)

use super::durable::{DurableCache, SqliteCache};
use super::key::{CacheKey, KeyFilter};
use super::memory::MemoryCache;
use super::models::{CacheEntry, CacheStats, CacheTier, Resolution};
use crate::config::CacheConfig;
use crate::error::{BridgeError, Result};
use crate::metrics;
use crate::models::TranslatedDocument;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Two-tier translation cache.
///
/// Reads try L1 then L2 and promote L2 hits into L1. Writes go through both
/// tiers; the durable write is awaited so a caller is never told a result is
/// cached when it is not. Durable-tier failures never fail a lookup, they only
/// turn it into a miss.
pub struct CacheManager {
    l1: MemoryCache,
    /// `None` when the durable store could not be opened.
    l2: Option<Arc<dyn DurableCache>>,
    stats: Arc<RwLock<CacheStats>>,
}

impl CacheManager {
    pub fn new(l1: MemoryCache, l2: Arc<dyn DurableCache>) -> Self {
        Self {
            l1,
            l2: Some(l2),
            stats: Arc::new(RwLock::new(CacheStats::default())),
        }
    }

    /// L1-only manager. Every store reports `STORAGE_UNAVAILABLE`.
    pub fn memory_only(l1: MemoryCache) -> Self {
        Self {
            l1,
            l2: None,
            stats: Arc::new(RwLock::new(CacheStats::default())),
        }
    }

    /// Build both tiers from configuration. A durable store that fails to open
    /// degrades to an L1-only manager instead of failing startup.
    pub fn from_config(config: &CacheConfig) -> Self {
        let l1 = MemoryCache::new(config.l1_capacity, config.l1_ttl());
        let path = config.database_path();

        match SqliteCache::open(&path, config.max_entries, config.ttl()) {
            Ok(store) => Self::new(l1, Arc::new(store)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Durable cache unavailable, running L1 only");
                Self::memory_only(l1)
            }
        }
    }

    pub fn has_durable_tier(&self) -> bool {
        self.l2.is_some()
    }

    fn durable(&self) -> Result<&Arc<dyn DurableCache>> {
        self.l2
            .as_ref()
            .ok_or_else(|| BridgeError::StorageUnavailable("durable cache is not open".to_string()))
    }

    /// Look `key` up in L1, then L2.
    pub async fn resolve(&self, key: &CacheKey) -> Resolution {
        if let Some(payload) = self.l1.get(key) {
            debug!(key = %key, "L1 cache hit");
            self.stats.write().await.l1_hits += 1;
            metrics::record_cache_lookup("l1");
            return Resolution::hit(payload, CacheTier::L1);
        }

        let Some(l2) = &self.l2 else {
            self.record_miss().await;
            return Resolution::miss();
        };

        match l2.get(key).await {
            Ok(Some(document)) => {
                debug!(key = %key, "L2 cache hit, promoting to L1");
                let payload = Arc::new(document);
                self.l1.set(key, payload.clone());
                self.stats.write().await.l2_hits += 1;
                metrics::record_cache_lookup("l2");
                Resolution::hit(payload, CacheTier::L2)
            }
            Ok(None) => {
                self.record_miss().await;
                Resolution::miss()
            }
            Err(e) => {
                warn!(key = %key, error = %e, "L2 lookup failed, treating as miss");
                self.stats.write().await.l2_errors += 1;
                metrics::record_cache_lookup("error");
                Resolution::miss()
            }
        }
    }

    async fn record_miss(&self) {
        self.stats.write().await.misses += 1;
        metrics::record_cache_lookup("miss");
    }

    /// Write through both tiers.
    ///
    /// L1 is updated before the durable write starts, so the payload is served
    /// from memory even when this returns `STORAGE_UNAVAILABLE`.
    pub async fn store(&self, key: &CacheKey, payload: Arc<TranslatedDocument>) -> Result<()> {
        key.validate()?;
        self.l1.set(key, payload.clone());

        let result = match self.durable() {
            Ok(l2) => l2.set(key, &payload).await.map_err(|e| match e {
                BridgeError::StorageUnavailable(_) => e,
                other => BridgeError::StorageUnavailable(other.to_string()),
            }),
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                self.stats.write().await.stores += 1;
                metrics::record_cache_write(true);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Durable cache write failed");
                self.stats.write().await.l2_errors += 1;
                metrics::record_cache_write(false);
            }
        }
        result
    }

    pub async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let in_l1 = self.l1.delete(key);
        let in_l2 = self.durable()?.delete(key).await?;
        Ok(in_l1 || in_l2)
    }

    /// Drop every cached translation for a video from both tiers.
    /// Returns the number of durable entries removed.
    pub async fn invalidate_video(&self, video_id: &str) -> Result<usize> {
        let from_l1 = self.l1.delete_matching(&KeyFilter::video(video_id));
        let removed = self.durable()?.delete_by_video_id(video_id).await?;

        info!(video_id, removed, from_l1, "Invalidated cached translations");
        metrics::record_cache_invalidated(removed);
        Ok(removed)
    }

    /// Durable entries matching `filter`, most recently accessed first.
    pub async fn list(&self, filter: &KeyFilter) -> Result<Vec<CacheEntry>> {
        let entries = self.durable()?.get_all().await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.key.matches_partial(filter))
            .collect())
    }

    pub async fn keys(&self) -> Result<Vec<CacheKey>> {
        self.durable()?.get_keys().await
    }

    pub async fn evict_expired(&self) -> Result<usize> {
        let removed = self.durable()?.evict_expired().await?;
        metrics::record_cache_expired(removed);
        self.refresh_gauges().await;
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<()> {
        self.l1.clear();
        self.durable()?.clear().await
    }

    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    pub fn l1_len(&self) -> usize {
        self.l1.len()
    }

    pub async fn durable_len(&self) -> Result<usize> {
        self.durable()?.len().await
    }

    async fn refresh_gauges(&self) {
        metrics::update_cache_entries("l1", self.l1.len());
        if let Ok(count) = self.durable_len().await {
            metrics::update_cache_entries("l2", count);
        }
    }

    /// Run `evict_expired` every `interval` until `shutdown` fires.
    pub fn spawn_expiry_task(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately; sweep once at startup
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Cache expiry task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.evict_expired().await {
                            warn!(error = %e, "L2 cache expiry sweep failed");
                        }
                    }
                }
            }
        })
    }
}
