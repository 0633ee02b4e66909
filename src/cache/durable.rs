//! L2 durable translation cache.
//!
//! `SqliteCache` persists translated documents across restarts. It keeps a
//! secondary index on `video_id` for bulk invalidation, and indexes on
//! `last_accessed_at` / `created_at` for LRU eviction and TTL sweeps.
//!
//! All access goes through a single connection guarded by a mutex and runs on
//! the blocking pool, which makes `set` (evict-then-insert) a critical section
//! per store instance: concurrent writers can never push the table past
//! `max_entries`.

// Author: kelexine (https://github.com/kelexine)

use super::key::CacheKey;
use super::models::CacheEntry;
use crate::error::{BridgeError, Result};
use crate::models::TranslatedDocument;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Schema / key format version stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

/// Millisecond wall clock. Injectable so eviction order can be tested deterministically.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// Persistent cache tier.
///
/// Implementations report backing-store problems as
/// [`BridgeError::StorageUnavailable`]; callers degrade to cache-miss behavior.
#[async_trait]
pub trait DurableCache: Send + Sync {
    /// Look up a document. A hit updates `last_accessed_at` and `access_count`
    /// in the same transaction as the read.
    async fn get(&self, key: &CacheKey) -> Result<Option<TranslatedDocument>>;

    /// Insert or replace. When the store is full, the least recently accessed
    /// entry (oldest `created_at` on ties) is evicted first.
    async fn set(&self, key: &CacheKey, payload: &TranslatedDocument) -> Result<()>;

    async fn delete(&self, key: &CacheKey) -> Result<bool>;

    async fn delete_by_video_id(&self, video_id: &str) -> Result<usize>;

    /// Remove entries created before `now - ttl`.
    async fn evict_expired(&self) -> Result<usize>;

    async fn get_all(&self) -> Result<Vec<CacheEntry>>;

    async fn get_keys(&self) -> Result<Vec<CacheKey>>;

    async fn len(&self) -> Result<usize>;

    async fn clear(&self) -> Result<()>;
}

/// SQLite-backed L2 cache.
pub struct SqliteCache {
    conn: Arc<Mutex<Connection>>,
    max_entries: usize,
    ttl: Option<Duration>,
    clock: Clock,
}

impl SqliteCache {
    /// Open (or create) the cache database at `path`.
    pub fn open(path: &Path, max_entries: usize, ttl: Option<Duration>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| BridgeError::StorageUnavailable(format!("failed to open cache: {}", e)))?;

        // WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::init_schema(&conn)?;
        info!(path = %path.display(), max_entries, "Durable cache opened");

        Ok(Self::from_connection(conn, max_entries, ttl))
    }

    pub fn open_in_memory(max_entries: usize, ttl: Option<Duration>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self::from_connection(conn, max_entries, ttl))
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn from_connection(conn: Connection, max_entries: usize, ttl: Option<Duration>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            max_entries: max_entries.max(1),
            ttl,
            clock: system_clock(),
        }
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(BridgeError::StorageUnavailable(format!(
                "cache schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            )));
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                cache_key TEXT PRIMARY KEY,
                video_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                size_bytes INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_video ON cache_entries(video_id);
            CREATE INDEX IF NOT EXISTS idx_cache_accessed ON cache_entries(last_accessed_at);
            CREATE INDEX IF NOT EXISTS idx_cache_created ON cache_entries(created_at);",
        )?;

        if version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(())
    }

    /// Run `f` on the blocking pool with exclusive access to the connection.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, i64) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let clock = self.clock.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            let now = clock();
            f(&mut guard, now)
        })
        .await
        .map_err(|e| BridgeError::StorageUnavailable(format!("cache worker failed: {}", e)))?
    }
}

/// Entries created before the returned instant are expired.
fn expiry_cutoff(ttl: Option<Duration>, now: i64) -> Option<i64> {
    ttl.map(|ttl| now - ttl.as_millis() as i64)
}

fn delete_row(conn: &Connection, serialized: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM cache_entries WHERE cache_key = ?1",
        params![serialized],
    )
}

#[async_trait]
impl DurableCache for SqliteCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<TranslatedDocument>> {
        let serialized = key.serialize();
        let ttl = self.ttl;

        self.with_conn(move |conn, now| {
            let tx = conn.transaction()?;

            let row: Option<(String, i64)> = tx
                .query_row(
                    "SELECT payload, created_at FROM cache_entries WHERE cache_key = ?1",
                    params![serialized],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((payload, created_at)) = row else {
                return Ok(None);
            };

            if expiry_cutoff(ttl, now).is_some_and(|cutoff| created_at < cutoff) {
                debug!(key = %serialized, "L2 entry expired on read");
                delete_row(&tx, &serialized)?;
                tx.commit()?;
                return Ok(None);
            }

            match serde_json::from_str::<TranslatedDocument>(&payload) {
                Ok(document) => {
                    tx.execute(
                        "UPDATE cache_entries
                         SET last_accessed_at = MAX(?2, created_at),
                             access_count = access_count + 1
                         WHERE cache_key = ?1",
                        params![serialized, now],
                    )?;
                    tx.commit()?;
                    Ok(Some(document))
                }
                Err(e) => {
                    warn!(key = %serialized, error = %e, "Dropping unreadable L2 entry");
                    delete_row(&tx, &serialized)?;
                    tx.commit()?;
                    Ok(None)
                }
            }
        })
        .await
    }

    async fn set(&self, key: &CacheKey, payload: &TranslatedDocument) -> Result<()> {
        let serialized = key.serialize();
        let video_id = key.video_id.clone();
        let body = serde_json::to_string(payload)?;
        let size_bytes = body.len() as i64;
        let max_entries = self.max_entries;

        let evicted = self
            .with_conn(move |conn, now| {
                let tx = conn.transaction()?;

                let exists = tx
                    .query_row(
                        "SELECT 1 FROM cache_entries WHERE cache_key = ?1",
                        params![serialized],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();

                let mut evicted = 0usize;
                if !exists {
                    loop {
                        let count: i64 =
                            tx.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
                        if (count as usize) < max_entries {
                            break;
                        }

                        let victim: Option<String> = tx
                            .query_row(
                                "SELECT cache_key FROM cache_entries
                                 ORDER BY last_accessed_at ASC, created_at ASC
                                 LIMIT 1",
                                [],
                                |row| row.get(0),
                            )
                            .optional()?;

                        match victim {
                            Some(victim) => {
                                debug!(key = %victim, "Evicting least recently accessed L2 entry");
                                delete_row(&tx, &victim)?;
                                evicted += 1;
                            }
                            None => break,
                        }
                    }
                }

                tx.execute(
                    "INSERT OR REPLACE INTO cache_entries
                     (cache_key, video_id, payload, created_at, last_accessed_at, access_count, size_bytes)
                     VALUES (?1, ?2, ?3, ?4, ?4, 0, ?5)",
                    params![serialized, video_id, body, now, size_bytes],
                )?;
                tx.commit()?;
                Ok(evicted)
            })
            .await?;

        if evicted > 0 {
            crate::metrics::record_cache_eviction(evicted);
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let serialized = key.serialize();
        self.with_conn(move |conn, _| Ok(delete_row(conn, &serialized)? > 0))
            .await
    }

    async fn delete_by_video_id(&self, video_id: &str) -> Result<usize> {
        let video_id = video_id.to_string();
        self.with_conn(move |conn, _| {
            Ok(conn.execute(
                "DELETE FROM cache_entries WHERE video_id = ?1",
                params![video_id],
            )?)
        })
        .await
    }

    async fn evict_expired(&self) -> Result<usize> {
        let ttl = self.ttl;
        if ttl.is_none() {
            return Ok(0);
        }

        let removed = self
            .with_conn(move |conn, now| {
                let Some(cutoff) = expiry_cutoff(ttl, now) else {
                    return Ok(0);
                };
                Ok(conn.execute(
                    "DELETE FROM cache_entries WHERE created_at < ?1",
                    params![cutoff],
                )?)
            })
            .await?;

        if removed > 0 {
            info!(removed, "L2 cache expiry sweep");
        }
        Ok(removed)
    }

    async fn get_all(&self) -> Result<Vec<CacheEntry>> {
        self.with_conn(|conn, _| {
            let mut stmt = conn.prepare(
                "SELECT cache_key, video_id, payload, created_at, last_accessed_at, access_count, size_bytes
                 FROM cache_entries ORDER BY last_accessed_at DESC",
            )?;

            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (raw_key, video_id, payload, created_at, last_accessed_at, access_count, size_bytes) =
                    row?;

                let key = match CacheKey::parse(&raw_key) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(key = %raw_key, error = %e, "Skipping L2 row with malformed key");
                        continue;
                    }
                };
                let payload = match serde_json::from_str(&payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(key = %raw_key, error = %e, "Skipping unreadable L2 row");
                        continue;
                    }
                };

                entries.push(CacheEntry {
                    key,
                    video_id,
                    payload,
                    created_at_ms: created_at,
                    last_accessed_at_ms: last_accessed_at,
                    access_count: access_count.max(0) as u64,
                    size_bytes: size_bytes.max(0) as u64,
                });
            }
            Ok(entries)
        })
        .await
    }

    async fn get_keys(&self) -> Result<Vec<CacheKey>> {
        self.with_conn(|conn, _| {
            let mut stmt = conn.prepare("SELECT cache_key FROM cache_entries")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .filter_map(|raw| raw.ok())
                .filter_map(|raw| CacheKey::parse(&raw).ok())
                .collect();
            Ok(keys)
        })
        .await
    }

    async fn len(&self) -> Result<usize> {
        self.with_conn(|conn, _| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.with_conn(|conn, _| {
            conn.execute("DELETE FROM cache_entries", [])?;
            Ok(())
        })
        .await
    }
}
