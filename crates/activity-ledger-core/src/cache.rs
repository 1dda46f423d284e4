//! Read-through cache for computed counts.
//!
//! Lives in its own database file: wiping it loses nothing durable. Entries
//! are keyed by the exact query shape (community, user, lookback window and
//! exclusion fingerprint) and are always replaced wholesale.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result, StorageError};
use crate::model::{CommunityId, UserId, epoch_ms};

const CACHE_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS count_cache (
    community_id   INTEGER NOT NULL,
    user_id        INTEGER NOT NULL,
    lookback_days  INTEGER NOT NULL,
    exclusion_hash TEXT NOT NULL,
    value          INTEGER NOT NULL,
    written_at     INTEGER NOT NULL,
    PRIMARY KEY (community_id, user_id, lookback_days, exclusion_hash)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_count_cache_written ON count_cache (written_at);
";

/// Stored in place of a lookback window when the query has none.
const NO_LOOKBACK: i64 = -1;

/// Exact query shape a cached value answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub community: CommunityId,
    pub user: UserId,
    pub lookback_days: Option<u32>,
    pub exclusion_hash: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(
        community: CommunityId,
        user: UserId,
        lookback_days: Option<u32>,
        exclusion_hash: impl Into<String>,
    ) -> Self {
        Self {
            community,
            user,
            lookback_days,
            exclusion_hash: exclusion_hash.into(),
        }
    }

    fn lookback_sql(&self) -> i64 {
        self.lookback_days.map_or(NO_LOOKBACK, i64::from)
    }
}

/// Cache occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: u64,
    pub valid: u64,
    pub expired: u64,
    /// Database size, `page_count * page_size`.
    pub size_bytes: u64,
}

/// SQLite-backed count cache.
#[derive(Clone)]
pub struct CountCache {
    conn: Arc<Mutex<Connection>>,
    ttl: Option<Duration>,
}

impl std::fmt::Debug for CountCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountCache").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl CountCache {
    /// Open the cache file. A zero TTL is treated as no expiry.
    pub fn open(path: &Path, ttl: Option<Duration>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::from_connection(conn, ttl)
    }

    pub fn open_in_memory(ttl: Option<Duration>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, ttl)
    }

    fn from_connection(conn: Connection, ttl: Option<Duration>) -> Result<Self> {
        conn.execute_batch(CACHE_SCHEMA_SQL)
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl: ttl.filter(|ttl| !ttl.is_zero()),
        })
    }

    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let joined = tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| Error::Runtime(format!("count cache task: {e}")))?;
        Ok(joined?)
    }

    /// Oldest `written_at` still considered fresh, if entries expire.
    fn fresh_after(&self) -> Option<i64> {
        self.ttl
            .map(|ttl| epoch_ms() - i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
    }

    /// Cached value, or `None` on a miss or an expired entry.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<u64>> {
        let key = key.clone();
        let fresh_after = self.fresh_after();
        self.run(move |conn| {
            let row: Option<(i64, i64)> = conn
                .prepare_cached(
                    "SELECT value, written_at FROM count_cache
                     WHERE community_id = ?1 AND user_id = ?2
                     AND lookback_days = ?3 AND exclusion_hash = ?4",
                )?
                .query_row(
                    params![
                        key.community.as_sql(),
                        key.user.as_sql(),
                        key.lookback_sql(),
                        key.exclusion_hash
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(row.and_then(|(value, written_at)| {
                let fresh = fresh_after.is_none_or(|cutoff| written_at > cutoff);
                fresh.then_some(value as u64)
            }))
        })
        .await
    }

    /// Overwrite the entry for `key`.
    pub async fn set(&self, key: &CacheKey, value: u64) -> Result<()> {
        self.set_at(key, value, epoch_ms()).await
    }

    async fn set_at(&self, key: &CacheKey, value: u64, written_at: i64) -> Result<()> {
        let key = key.clone();
        self.run(move |conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO count_cache
                     (community_id, user_id, lookback_days, exclusion_hash, value, written_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?
            .execute(params![
                key.community.as_sql(),
                key.user.as_sql(),
                key.lookback_sql(),
                key.exclusion_hash,
                value as i64,
                written_at
            ])?;
            Ok(())
        })
        .await
    }

    /// Drop every entry of a community. Returns the number removed.
    pub async fn clear_community(&self, community: CommunityId) -> Result<usize> {
        let removed = self
            .run(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM count_cache WHERE community_id = ?1",
                    [community.as_sql()],
                )?)
            })
            .await?;
        debug!(community = %community, removed, "Cleared community cache");
        Ok(removed)
    }

    pub async fn clear_all(&self) -> Result<usize> {
        self.run(|conn| Ok(conn.execute("DELETE FROM count_cache", [])?))
            .await
    }

    /// Drop expired entries. Without a TTL nothing ever expires.
    pub async fn clear_expired(&self) -> Result<usize> {
        let Some(cutoff) = self.fresh_after() else {
            return Ok(0);
        };
        self.run(move |conn| {
            Ok(conn.execute(
                "DELETE FROM count_cache WHERE written_at <= ?1",
                [cutoff],
            )?)
        })
        .await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let fresh_after = self.fresh_after();
        self.run(move |conn| {
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM count_cache", [], |row| row.get(0))?;
            let expired: i64 = match fresh_after {
                Some(cutoff) => conn.query_row(
                    "SELECT COUNT(*) FROM count_cache WHERE written_at <= ?1",
                    [cutoff],
                    |row| row.get(0),
                )?,
                None => 0,
            };
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            let total = total as u64;
            let expired = expired as u64;
            Ok(CacheStats {
                total,
                valid: total - expired,
                expired,
                size_bytes: (page_count * page_size) as u64,
            })
        })
        .await
    }
}
