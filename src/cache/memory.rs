//! L1 in-process cache.
//!
//! A bounded LRU map keyed by the serialized [`CacheKey`]. It is purely an
//! optimization: entries can be dropped at any time because the durable tier
//! is authoritative.

// Author: kelexine (https://github.com/kelexine)

use super::key::{CacheKey, KeyFilter};
use crate::models::TranslatedDocument;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct L1Entry {
    key: CacheKey,
    payload: Arc<TranslatedDocument>,
    inserted_at: Instant,
}

pub struct MemoryCache {
    inner: Mutex<LruCache<String, L1Entry>>,
    ttl: Option<Duration>,
}

impl MemoryCache {
    /// A zero capacity is bumped to one entry.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<TranslatedDocument>> {
        let serialized = key.serialize();
        let mut cache = self.inner.lock();

        let expired = match cache.get(&serialized) {
            Some(entry) => match self.ttl {
                Some(ttl) if entry.inserted_at.elapsed() >= ttl => true,
                _ => return Some(entry.payload.clone()),
            },
            None => return None,
        };

        if expired {
            cache.pop(&serialized);
        }
        None
    }

    pub fn set(&self, key: &CacheKey, payload: Arc<TranslatedDocument>) {
        self.inner.lock().put(
            key.serialize(),
            L1Entry {
                key: key.clone(),
                payload,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        self.inner.lock().pop(&key.serialize()).is_some()
    }

    /// Drop every entry whose key matches `filter`. Returns the number removed.
    pub fn delete_matching(&self, filter: &KeyFilter) -> usize {
        let mut cache = self.inner.lock();
        let doomed: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| filter.matches(&entry.key))
            .map(|(k, _)| k.clone())
            .collect();

        for k in &doomed {
            cache.pop(k);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
