//! Aggregate store: durable per-(community, user, channel) message counts.
//!
//! Owns three durable tables plus audit history:
//!
//! ```text
//! message_counts   (community, user, channel) -> count, last_message_at
//! backfill_state   community -> status, started_at, completed_at, total_imported
//! members          (community, user) -> display name, joined/seen, bot flag
//! audit_runs       append-only consistency audit results
//! ```
//!
//! All SQLite work runs on the blocking pool via `spawn_blocking`; the async
//! methods are the suspension points the rest of the ledger awaits.
//!
//! # Invariants
//!
//! - A stored count is always > 0. Adjustments clamp at zero and a counter
//!   that reaches zero is deleted, never kept as a zero row.
//! - `running` is derived from persisted timestamps alone (`started_at` set,
//!   `completed_at` unset) so another process can detect a crashed backfill.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auditor::{AuditKind, AuditResult};
use crate::error::{Error, Result, StorageError};
use crate::model::{
    ChannelId, CommunityId, CountDelta, MemberSnapshot, UserId, epoch_ms, from_ms, to_ms,
};

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 2;

/// Rows per transaction when resyncing members.
const MEMBER_SYNC_CHUNK: usize = 500;

pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS message_counts (
    community_id    INTEGER NOT NULL,
    user_id         INTEGER NOT NULL,
    channel_id      INTEGER NOT NULL,
    message_count   INTEGER NOT NULL CHECK (message_count >= 0),
    last_message_at INTEGER,
    PRIMARY KEY (community_id, user_id, channel_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_message_counts_channel
    ON message_counts (community_id, channel_id);

CREATE TABLE IF NOT EXISTS backfill_state (
    community_id   INTEGER PRIMARY KEY,
    status         TEXT NOT NULL CHECK (status IN ('not_started', 'running', 'completed')),
    started_at     INTEGER,
    completed_at   INTEGER,
    total_imported INTEGER NOT NULL DEFAULT 0,
    updated_at     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS members (
    community_id INTEGER NOT NULL,
    user_id      INTEGER NOT NULL,
    display_name TEXT NOT NULL,
    joined_at    INTEGER,
    is_bot       INTEGER NOT NULL DEFAULT 0,
    last_seen_at INTEGER,
    synced_at    INTEGER NOT NULL,
    PRIMARY KEY (community_id, user_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS audit_runs (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    community_id      INTEGER NOT NULL,
    kind              TEXT NOT NULL,
    created_at        INTEGER NOT NULL,
    sample_size       INTEGER NOT NULL,
    matches           INTEGER NOT NULL,
    mismatches        INTEGER NOT NULL,
    accuracy_percent  REAL NOT NULL,
    passed            INTEGER NOT NULL,
    result_json       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_runs_community
    ON audit_runs (community_id, created_at DESC);

CREATE TABLE IF NOT EXISTS channel_scope (
    community_id INTEGER PRIMARY KEY,
    fingerprint  TEXT NOT NULL,
    updated_at   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS excluded_channels (
    community_id INTEGER NOT NULL,
    channel_id   INTEGER NOT NULL,
    PRIMARY KEY (community_id, channel_id)
) WITHOUT ROWID;
";

// =============================================================================
// Types
// =============================================================================

/// Backfill lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    NotStarted,
    Running,
    Completed,
}

impl BackfillStatus {
    fn as_db_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }

    fn from_db_str(value: &str) -> Self {
        match value {
            "running" => Self::Running,
            "completed" => Self::Completed,
            _ => Self::NotStarted,
        }
    }
}

/// Persisted backfill metadata for one community.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillState {
    pub community: CommunityId,
    pub status: BackfillStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_imported: u64,
}

impl BackfillState {
    fn not_started(community: CommunityId) -> Self {
        Self {
            community,
            status: BackfillStatus::NotStarted,
            started_at: None,
            completed_at: None,
            total_imported: 0,
        }
    }

    /// Started and not yet finished, judged from timestamps only.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.completed_at.is_none()
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == BackfillStatus::Completed && self.completed_at.is_some()
    }

    /// A `running` row older than `threshold` most likely belongs to a
    /// process that died mid-run.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match (self.is_running(), self.started_at) {
            (true, Some(started)) => {
                let age = now.signed_duration_since(started);
                age.to_std().is_ok_and(|age| age >= threshold)
            }
            _ => false,
        }
    }
}

/// Outcome of a member resync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub upserted: usize,
    pub removed: usize,
}

/// Outcome of pruning counts for vanished channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub channels_removed: usize,
    pub rows_removed: usize,
}

/// Counters for one community.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub community: CommunityId,
    pub total_messages: u64,
    pub tracked_users: u64,
    pub tracked_channels: u64,
    pub members: u64,
    pub human_members: u64,
    /// Human members with no tracked messages at all.
    pub members_without_messages: u64,
    /// Size of the ledger database file (all communities).
    pub storage_bytes: u64,
    pub backfill: BackfillState,
}

/// Per-channel counter of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelCount {
    pub channel: ChannelId,
    pub count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
}

// =============================================================================
// LedgerStore
// =============================================================================

/// Durable aggregate store backed by SQLite.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore").finish_non_exhaustive()
    }
}

impl LedgerStore {
    /// Open (creating if needed) the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> std::result::Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Runtime(format!("ledger store task: {e}")))?;
        Ok(joined?)
    }

    // ---- counters ----

    /// Adjust one counter by `delta`, clamping at zero.
    pub async fn increment_count(
        &self,
        community: CommunityId,
        user: UserId,
        channel: ChannelId,
        delta: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let change = CountDelta {
            user,
            channel,
            delta,
            last_message_at: Some(at),
        };
        self.run(move |conn| {
            let tx = conn.transaction()?;
            apply_delta_sync(&tx, community, &change)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Apply many adjustments in a single transaction (all or nothing).
    pub async fn apply_deltas(&self, community: CommunityId, deltas: Vec<CountDelta>) -> Result<usize> {
        if deltas.is_empty() {
            return Ok(0);
        }
        let applied = deltas.len();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            for change in &deltas {
                apply_delta_sync(&tx, community, change)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        debug!(community = %community, applied, "Applied count deltas");
        Ok(applied)
    }

    /// Sum of a user's counts, skipping `excluded` channels.
    pub async fn get_user_total(
        &self,
        community: CommunityId,
        user: UserId,
        excluded: &HashSet<ChannelId>,
    ) -> Result<u64> {
        let excluded = excluded.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT channel_id, message_count FROM message_counts
                 WHERE community_id = ?1 AND user_id = ?2",
            )?;
            let rows = stmt.query_map(params![community.as_sql(), user.as_sql()], |row| {
                Ok((ChannelId::from_sql(row.get(0)?), row.get::<_, i64>(1)?))
            })?;
            let mut total = 0u64;
            for row in rows {
                let (channel, count) = row?;
                if !excluded.contains(&channel) {
                    total += count as u64;
                }
            }
            Ok(total)
        })
        .await
    }

    /// Totals for every user of a community in one pass.
    pub async fn get_community_totals(
        &self,
        community: CommunityId,
        excluded: &HashSet<ChannelId>,
    ) -> Result<HashMap<UserId, u64>> {
        let excluded = excluded.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT user_id, channel_id, message_count FROM message_counts
                 WHERE community_id = ?1",
            )?;
            let rows = stmt.query_map([community.as_sql()], |row| {
                Ok((
                    UserId::from_sql(row.get(0)?),
                    ChannelId::from_sql(row.get(1)?),
                    row.get::<_, i64>(2)?,
                ))
            })?;
            let mut totals: HashMap<UserId, u64> = HashMap::new();
            for row in rows {
                let (user, channel, count) = row?;
                if !excluded.contains(&channel) {
                    *totals.entry(user).or_default() += count as u64;
                }
            }
            Ok(totals)
        })
        .await
    }

    /// Highest totals first, ties broken by user id.
    pub async fn get_top_users(
        &self,
        community: CommunityId,
        limit: usize,
        excluded: &HashSet<ChannelId>,
    ) -> Result<Vec<(UserId, u64)>> {
        let totals = self.get_community_totals(community, excluded).await?;
        let mut ranked: Vec<(UserId, u64)> = totals.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Per-channel counters of one user, largest first.
    pub async fn get_user_channel_breakdown(
        &self,
        community: CommunityId,
        user: UserId,
    ) -> Result<Vec<ChannelCount>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT channel_id, message_count, last_message_at FROM message_counts
                 WHERE community_id = ?1 AND user_id = ?2
                 ORDER BY message_count DESC, channel_id ASC",
            )?;
            let rows = stmt.query_map(params![community.as_sql(), user.as_sql()], |row| {
                Ok(ChannelCount {
                    channel: ChannelId::from_sql(row.get(0)?),
                    count: row.get::<_, i64>(1)? as u64,
                    last_message_at: row.get::<_, Option<i64>>(2)?.and_then(from_ms),
                })
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Users whose stored total (no exclusions) is at least `min_messages`.
    pub async fn users_with_min_messages(
        &self,
        community: CommunityId,
        min_messages: u64,
    ) -> Result<Vec<UserId>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT user_id FROM message_counts
                 WHERE community_id = ?1
                 GROUP BY user_id
                 HAVING SUM(message_count) >= ?2
                 ORDER BY user_id",
            )?;
            let rows = stmt.query_map(params![community.as_sql(), min_messages as i64], |row| {
                Ok(UserId::from_sql(row.get(0)?))
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Distinct channels holding counts for a community.
    pub async fn tracked_channels(&self, community: CommunityId) -> Result<Vec<ChannelId>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT channel_id FROM message_counts
                 WHERE community_id = ?1 ORDER BY channel_id",
            )?;
            let rows = stmt.query_map([community.as_sql()], |row| {
                Ok(ChannelId::from_sql(row.get(0)?))
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Drop counters for channels that are no longer resolvable.
    pub async fn prune_deleted_channels(
        &self,
        community: CommunityId,
        known: &HashSet<ChannelId>,
    ) -> Result<PruneReport> {
        let tracked = self.tracked_channels(community).await?;
        let stale: Vec<ChannelId> = tracked
            .into_iter()
            .filter(|channel| !known.contains(channel))
            .collect();
        if stale.is_empty() {
            return Ok(PruneReport::default());
        }

        let channels_removed = stale.len();
        let rows_removed = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let mut rows = 0usize;
                {
                    let mut stmt = tx.prepare_cached(
                        "DELETE FROM message_counts WHERE community_id = ?1 AND channel_id = ?2",
                    )?;
                    for channel in &stale {
                        rows += stmt.execute(params![community.as_sql(), channel.as_sql()])?;
                    }
                }
                tx.commit()?;
                Ok(rows)
            })
            .await?;

        info!(
            community = %community,
            channels_removed,
            rows_removed,
            "Pruned counts for deleted channels"
        );
        Ok(PruneReport {
            channels_removed,
            rows_removed,
        })
    }

    /// Delete all counters and members of a community (full re-import).
    pub async fn clear_community_data(&self, community: CommunityId) -> Result<(usize, usize)> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let counts = tx.execute(
                "DELETE FROM message_counts WHERE community_id = ?1",
                [community.as_sql()],
            )?;
            let members = tx.execute(
                "DELETE FROM members WHERE community_id = ?1",
                [community.as_sql()],
            )?;
            tx.execute(
                "DELETE FROM excluded_channels WHERE community_id = ?1",
                [community.as_sql()],
            )?;
            tx.execute(
                "DELETE FROM channel_scope WHERE community_id = ?1",
                [community.as_sql()],
            )?;
            tx.commit()?;
            Ok((counts, members))
        })
        .await
    }

    // ---- backfill state ----

    pub async fn backfill_state(&self, community: CommunityId) -> Result<BackfillState> {
        self.run(move |conn| load_backfill_state_sync(conn, community)).await
    }

    /// Transition to `running`. Refuses when already running or completed.
    pub async fn mark_backfill_started(&self, community: CommunityId) -> Result<BackfillState> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let state = start_backfill_sync(&tx, community)?;
            tx.commit()?;
            Ok(state)
        })
        .await
    }

    /// Start an import from a clean slate.
    ///
    /// In one transaction: the `running` transition, removal of every counter
    /// and excluded channel of the community, and the scope fingerprint the
    /// import runs under. The import re-reads everything older than its start
    /// time, so counters recorded live before it would otherwise count twice.
    pub async fn begin_backfill(&self, community: CommunityId, fingerprint: &str) -> Result<BackfillState> {
        let fingerprint = fingerprint.to_string();
        let (state, cleared) = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let state = start_backfill_sync(&tx, community)?;
                let cleared = tx.execute(
                    "DELETE FROM message_counts WHERE community_id = ?1",
                    [community.as_sql()],
                )?;
                tx.execute(
                    "DELETE FROM excluded_channels WHERE community_id = ?1",
                    [community.as_sql()],
                )?;
                tx.execute(
                    "INSERT INTO channel_scope (community_id, fingerprint, updated_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(community_id) DO UPDATE SET
                         fingerprint = excluded.fingerprint,
                         updated_at = excluded.updated_at",
                    params![community.as_sql(), fingerprint, epoch_ms()],
                )?;
                tx.commit()?;
                Ok((state, cleared))
            })
            .await?;
        if cleared > 0 {
            info!(community = %community, rows = cleared, "Dropped pre-backfill counters");
        }
        Ok(state)
    }

    /// Transition `running -> completed`, recording the imported total.
    pub async fn mark_backfill_completed(
        &self,
        community: CommunityId,
        total_imported: u64,
    ) -> Result<BackfillState> {
        self.run(move |conn| {
            let now = epoch_ms();
            let updated = conn.execute(
                "UPDATE backfill_state
                 SET status = ?2, completed_at = ?3, total_imported = ?4, updated_at = ?3
                 WHERE community_id = ?1 AND status = 'running' AND completed_at IS NULL",
                params![
                    community.as_sql(),
                    BackfillStatus::Completed.as_db_str(),
                    now,
                    total_imported as i64
                ],
            )?;
            if updated == 0 {
                return Err(StorageError::InvalidState(format!(
                    "backfill for community {community} is not running"
                )));
            }
            load_backfill_state_sync(conn, community)
        })
        .await
    }

    pub async fn is_backfill_completed(&self, community: CommunityId) -> Result<bool> {
        Ok(self.backfill_state(community).await?.is_completed())
    }

    pub async fn is_backfill_running(&self, community: CommunityId) -> Result<bool> {
        Ok(self.backfill_state(community).await?.is_running())
    }

    /// Back to `not_started`. Counters and members are left untouched.
    pub async fn reset_backfill_state(&self, community: CommunityId) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM backfill_state WHERE community_id = ?1",
                [community.as_sql()],
            )?;
            Ok(())
        })
        .await
    }

    /// Communities whose backfill completed (and is therefore not running).
    pub async fn completed_communities(&self) -> Result<Vec<CommunityId>> {
        self.run(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT community_id FROM backfill_state
                 WHERE status = 'completed' AND completed_at IS NOT NULL
                 ORDER BY community_id",
            )?;
            let rows = stmt.query_map([], |row| Ok(CommunityId::from_sql(row.get(0)?)))?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }

    // ---- channel scope ----

    /// Fingerprint of the exclusion rules the last backfill ran under.
    pub async fn scope_fingerprint(&self, community: CommunityId) -> Result<Option<String>> {
        self.run(move |conn| load_scope_fingerprint_sync(conn, community))
            .await
    }

    /// Remember channels the exclusion rules leave out.
    ///
    /// Ignored when `fingerprint` differs from the recorded backfill scope:
    /// those rules did not shape the stored counters. Returns how many
    /// channels were new.
    pub async fn merge_excluded_channels(
        &self,
        community: CommunityId,
        fingerprint: &str,
        channels: Vec<ChannelId>,
    ) -> Result<usize> {
        let fingerprint = fingerprint.to_string();
        let added = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let recorded = load_scope_fingerprint_sync(&tx, community)?;
                if recorded.is_some_and(|recorded| recorded != fingerprint) {
                    return Ok(0);
                }
                let mut added = 0usize;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT OR IGNORE INTO excluded_channels (community_id, channel_id)
                         VALUES (?1, ?2)",
                    )?;
                    for channel in &channels {
                        added += stmt.execute(params![community.as_sql(), channel.as_sql()])?;
                    }
                }
                tx.commit()?;
                Ok(added)
            })
            .await?;
        if added > 0 {
            debug!(community = %community, added, "Recorded excluded channels");
        }
        Ok(added)
    }

    /// Channels recorded as out of scope for `community`.
    pub async fn excluded_channels(&self, community: CommunityId) -> Result<HashSet<ChannelId>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT channel_id FROM excluded_channels WHERE community_id = ?1",
            )?;
            let rows = stmt.query_map([community.as_sql()], |row| {
                Ok(ChannelId::from_sql(row.get(0)?))
            })?;
            Ok(rows.collect::<std::result::Result<HashSet<_>, _>>()?)
        })
        .await
    }

    pub async fn is_channel_excluded(&self, community: CommunityId, channel: ChannelId) -> Result<bool> {
        self.run(move |conn| {
            let hit = conn
                .prepare_cached(
                    "SELECT 1 FROM excluded_channels WHERE community_id = ?1 AND channel_id = ?2",
                )?
                .query_row(params![community.as_sql(), channel.as_sql()], |_| Ok(()))
                .optional()?;
            Ok(hit.is_some())
        })
        .await
    }

    // ---- members ----

    /// Insert or update one member.
    pub async fn upsert_member(&self, community: CommunityId, member: MemberSnapshot) -> Result<()> {
        self.run(move |conn| {
            upsert_member_sync(conn, community, &member, epoch_ms())?;
            Ok(())
        })
        .await
    }

    /// Remove one member. Returns whether a row existed.
    pub async fn remove_member(&self, community: CommunityId, user: UserId) -> Result<bool> {
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM members WHERE community_id = ?1 AND user_id = ?2",
                params![community.as_sql(), user.as_sql()],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    /// Replace the member set of a community with `members`.
    ///
    /// Rows are upserted in small transactions tagged with a sync generation,
    /// then rows from older generations are deleted. Live increments and
    /// member events interleave freely between chunks.
    pub async fn resync_members(
        &self,
        community: CommunityId,
        members: Vec<MemberSnapshot>,
    ) -> Result<ResyncReport> {
        let generation = self
            .run(move |conn| {
                let previous: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(synced_at), 0) FROM members WHERE community_id = ?1",
                    [community.as_sql()],
                    |row| row.get(0),
                )?;
                Ok(epoch_ms().max(previous + 1))
            })
            .await?;

        let upserted = members.len();
        let mut remaining = members;
        while !remaining.is_empty() {
            let rest = remaining.split_off(remaining.len().min(MEMBER_SYNC_CHUNK));
            let chunk = std::mem::replace(&mut remaining, rest);
            self.run(move |conn| {
                let tx = conn.transaction()?;
                for member in &chunk {
                    upsert_member_sync(&tx, community, member, generation)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        }

        let removed = self
            .run(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM members WHERE community_id = ?1 AND synced_at < ?2",
                    params![community.as_sql(), generation],
                )?)
            })
            .await?;

        info!(community = %community, upserted, removed, "Resynced members");
        Ok(ResyncReport { upserted, removed })
    }

    pub async fn list_members(&self, community: CommunityId) -> Result<Vec<MemberSnapshot>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT user_id, display_name, joined_at, is_bot, last_seen_at FROM members
                 WHERE community_id = ?1 ORDER BY user_id",
            )?;
            let rows = stmt.query_map([community.as_sql()], |row| {
                Ok(MemberSnapshot {
                    user: UserId::from_sql(row.get(0)?),
                    display_name: row.get(1)?,
                    joined_at: row.get::<_, Option<i64>>(2)?.and_then(from_ms),
                    is_bot: row.get::<_, i64>(3)? != 0,
                    last_seen_at: row.get::<_, Option<i64>>(4)?.and_then(from_ms),
                })
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }

    // ---- stats ----

    pub async fn get_stats(&self, community: CommunityId) -> Result<LedgerStats> {
        self.run(move |conn| {
            let c = community.as_sql();
            let (total_messages, tracked_users, tracked_channels): (i64, i64, i64) = conn
                .query_row(
                    "SELECT COALESCE(SUM(message_count), 0),
                            COUNT(DISTINCT user_id),
                            COUNT(DISTINCT channel_id)
                     FROM message_counts WHERE community_id = ?1",
                    [c],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
            let (members, human_members): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_bot = 0 THEN 1 ELSE 0 END), 0)
                 FROM members WHERE community_id = ?1",
                [c],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let members_without_messages: i64 = conn.query_row(
                "SELECT COUNT(*) FROM members m
                 WHERE m.community_id = ?1 AND m.is_bot = 0
                 AND NOT EXISTS (
                     SELECT 1 FROM message_counts mc
                     WHERE mc.community_id = m.community_id AND mc.user_id = m.user_id
                 )",
                [c],
                |row| row.get(0),
            )?;
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

            Ok(LedgerStats {
                community,
                total_messages: total_messages as u64,
                tracked_users: tracked_users as u64,
                tracked_channels: tracked_channels as u64,
                members: members as u64,
                human_members: human_members as u64,
                members_without_messages: members_without_messages as u64,
                storage_bytes: (page_count * page_size) as u64,
                backfill: load_backfill_state_sync(conn, community)?,
            })
        })
        .await
    }

    // ---- audit history ----

    /// Persist one audit result. Returns its row id.
    pub async fn record_audit(&self, result: &AuditResult) -> Result<i64> {
        let json = serde_json::to_string(result)?;
        let result = result.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO audit_runs
                     (community_id, kind, created_at, sample_size, matches, mismatches,
                      accuracy_percent, passed, result_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    result.community.as_sql(),
                    result.kind.as_str(),
                    to_ms(result.created_at),
                    result.sample_size as i64,
                    result.matches as i64,
                    result.mismatches as i64,
                    result.accuracy_percent,
                    i64::from(result.passed),
                    json
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Most recent audits first.
    pub async fn recent_audits(
        &self,
        community: CommunityId,
        kind: Option<AuditKind>,
        limit: usize,
    ) -> Result<Vec<AuditResult>> {
        let rows: Vec<String> = self
            .run(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT result_json FROM audit_runs
                     WHERE community_id = ?1 AND (?2 IS NULL OR kind = ?2)
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(
                    params![community.as_sql(), kind.map(AuditKind::as_str), limit as i64],
                    |row| row.get(0),
                )?;
                Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
            })
            .await?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(Into::into))
            .collect()
    }
}

// =============================================================================
// SQLite operations (sync, run inside spawn_blocking)
// =============================================================================

fn migrate(conn: &Connection) -> std::result::Result<(), StorageError> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(StorageError::SchemaTooNew {
            current,
            supported: SCHEMA_VERSION,
        });
    }
    conn.execute_batch(SCHEMA_SQL)
        .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;
    if current < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        debug!(from = current, to = SCHEMA_VERSION, "Migrated ledger schema");
    }
    Ok(())
}

fn apply_delta_sync(
    conn: &Connection,
    community: CommunityId,
    change: &CountDelta,
) -> std::result::Result<(), StorageError> {
    if change.delta == 0 {
        return Ok(());
    }
    let at = change.last_message_at.map(to_ms);
    conn.prepare_cached(
        "INSERT INTO message_counts
             (community_id, user_id, channel_id, message_count, last_message_at)
         VALUES (?1, ?2, ?3, MAX(0, ?4), ?5)
         ON CONFLICT(community_id, user_id, channel_id) DO UPDATE SET
             message_count = MAX(0, message_count + ?4),
             last_message_at = CASE
                 WHEN ?5 IS NULL THEN last_message_at
                 WHEN last_message_at IS NULL OR ?5 > last_message_at THEN ?5
                 ELSE last_message_at
             END",
    )?
    .execute(params![
        community.as_sql(),
        change.user.as_sql(),
        change.channel.as_sql(),
        change.delta,
        at
    ])?;
    if change.delta < 0 {
        conn.prepare_cached(
            "DELETE FROM message_counts
             WHERE community_id = ?1 AND user_id = ?2 AND channel_id = ?3
             AND message_count = 0",
        )?
        .execute(params![
            community.as_sql(),
            change.user.as_sql(),
            change.channel.as_sql()
        ])?;
    }
    Ok(())
}

fn start_backfill_sync(
    conn: &Connection,
    community: CommunityId,
) -> std::result::Result<BackfillState, StorageError> {
    let current = load_backfill_state_sync(conn, community)?;
    if current.is_running() {
        return Err(StorageError::InvalidState(format!(
            "backfill for community {community} is already running"
        )));
    }
    if current.is_completed() {
        return Err(StorageError::InvalidState(format!(
            "backfill for community {community} is already completed"
        )));
    }
    conn.execute(
        "INSERT INTO backfill_state
             (community_id, status, started_at, completed_at, total_imported, updated_at)
         VALUES (?1, ?2, ?3, NULL, 0, ?3)
         ON CONFLICT(community_id) DO UPDATE SET
             status = excluded.status,
             started_at = excluded.started_at,
             completed_at = NULL,
             total_imported = 0,
             updated_at = excluded.updated_at",
        params![community.as_sql(), BackfillStatus::Running.as_db_str(), epoch_ms()],
    )?;
    load_backfill_state_sync(conn, community)
}

fn load_scope_fingerprint_sync(
    conn: &Connection,
    community: CommunityId,
) -> std::result::Result<Option<String>, StorageError> {
    Ok(conn
        .query_row(
            "SELECT fingerprint FROM channel_scope WHERE community_id = ?1",
            [community.as_sql()],
            |row| row.get(0),
        )
        .optional()?)
}

fn load_backfill_state_sync(
    conn: &Connection,
    community: CommunityId,
) -> std::result::Result<BackfillState, StorageError> {
    let row = conn
        .query_row(
            "SELECT status, started_at, completed_at, total_imported FROM backfill_state
             WHERE community_id = ?1",
            [community.as_sql()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;

    Ok(match row {
        None => BackfillState::not_started(community),
        Some((status, started_at, completed_at, total)) => BackfillState {
            community,
            status: BackfillStatus::from_db_str(&status),
            started_at: started_at.and_then(from_ms),
            completed_at: completed_at.and_then(from_ms),
            total_imported: total as u64,
        },
    })
}

fn upsert_member_sync(
    conn: &Connection,
    community: CommunityId,
    member: &MemberSnapshot,
    synced_at: i64,
) -> std::result::Result<(), StorageError> {
    conn.prepare_cached(
        "INSERT INTO members
             (community_id, user_id, display_name, joined_at, is_bot, last_seen_at, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(community_id, user_id) DO UPDATE SET
             display_name = excluded.display_name,
             joined_at = COALESCE(excluded.joined_at, members.joined_at),
             is_bot = excluded.is_bot,
             last_seen_at = COALESCE(excluded.last_seen_at, members.last_seen_at),
             synced_at = MAX(members.synced_at, excluded.synced_at)",
    )?
    .execute(params![
        community.as_sql(),
        member.user.as_sql(),
        member.display_name,
        member.joined_at.map(to_ms),
        i64::from(member.is_bot),
        member.last_seen_at.map(to_ms),
        synced_at
    ])?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const C: CommunityId = CommunityId(1);
    const U: UserId = UserId(10);

    fn store() -> LedgerStore {
        LedgerStore::open_in_memory().unwrap()
    }

    fn row_count(store: &LedgerStore) -> i64 {
        store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM message_counts", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn user_total_sums_channels() {
        let store = store();
        let now = Utc::now();
        store.increment_count(C, U, ChannelId(1), 10, now).await.unwrap();
        store.increment_count(C, U, ChannelId(3), 5, now).await.unwrap();

        let total = store.get_user_total(C, U, &HashSet::new()).await.unwrap();
        assert_eq!(total, 15);
    }

    #[tokio::test]
    async fn exclusions_are_applied() {
        let store = store();
        let now = Utc::now();
        store.increment_count(C, U, ChannelId(1), 10, now).await.unwrap();
        store.increment_count(C, U, ChannelId(2), 4, now).await.unwrap();

        let excluded: HashSet<_> = [ChannelId(2)].into_iter().collect();
        assert_eq!(store.get_user_total(C, U, &excluded).await.unwrap(), 10);
        let totals = store.get_community_totals(C, &excluded).await.unwrap();
        assert_eq!(totals.get(&U), Some(&10));
    }

    #[tokio::test]
    async fn decrement_to_zero_deletes_row() {
        let store = store();
        let now = Utc::now();
        store.increment_count(C, U, ChannelId(1), 3, now).await.unwrap();
        store.increment_count(C, U, ChannelId(1), -3, now).await.unwrap();
        assert_eq!(row_count(&store), 0);
    }

    #[tokio::test]
    async fn negative_delta_clamps_at_zero() {
        let store = store();
        let now = Utc::now();
        store.increment_count(C, U, ChannelId(1), 2, now).await.unwrap();
        store.increment_count(C, U, ChannelId(1), -10, now).await.unwrap();
        assert_eq!(row_count(&store), 0);

        // A negative delta on a missing row leaves nothing behind
        store.increment_count(C, U, ChannelId(2), -1, now).await.unwrap();
        assert_eq!(row_count(&store), 0);
    }

    #[tokio::test]
    async fn clamping_applies_per_operation() {
        let store = store();
        let now = Utc::now();
        // -5 then +3: the running value never goes below zero, so 3 remains
        // even though the plain sum is negative
        store.increment_count(C, U, ChannelId(1), -5, now).await.unwrap();
        store.increment_count(C, U, ChannelId(1), 3, now).await.unwrap();
        assert_eq!(store.get_user_total(C, U, &HashSet::new()).await.unwrap(), 3);

        // Non-negative prefixes: prefix clamping and max(0, sum) agree
        store.increment_count(C, U, ChannelId(2), 4, now).await.unwrap();
        store.increment_count(C, U, ChannelId(2), -1, now).await.unwrap();
        store.increment_count(C, U, ChannelId(2), -3, now).await.unwrap();
        store.increment_count(C, U, ChannelId(2), 2, now).await.unwrap();
        let breakdown = store.get_user_channel_breakdown(C, U).await.unwrap();
        let channel_two = breakdown.iter().find(|c| c.channel == ChannelId(2)).unwrap();
        assert_eq!(channel_two.count, 2);
    }

    #[tokio::test]
    async fn last_message_at_only_moves_forward() {
        let store = store();
        let later = Utc::now();
        let earlier = later - chrono::Duration::days(3);
        store.increment_count(C, U, ChannelId(1), 1, later).await.unwrap();
        store.increment_count(C, U, ChannelId(1), 1, earlier).await.unwrap();

        let breakdown = store.get_user_channel_breakdown(C, U).await.unwrap();
        assert_eq!(breakdown.len(), 1);
        assert_eq!(breakdown[0].count, 2);
        assert_eq!(
            breakdown[0].last_message_at.map(|t| t.timestamp_millis()),
            Some(later.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn bulk_deltas_apply_in_one_batch() {
        let store = store();
        let deltas: Vec<CountDelta> = (0..2_000u64)
            .map(|i| CountDelta {
                user: UserId(i % 40),
                channel: ChannelId(i % 7),
                delta: 1,
                last_message_at: None,
            })
            .collect();
        assert_eq!(store.apply_deltas(C, deltas).await.unwrap(), 2_000);

        let totals = store.get_community_totals(C, &HashSet::new()).await.unwrap();
        assert_eq!(totals.values().sum::<u64>(), 2_000);
        assert_eq!(totals.len(), 40);
    }

    #[tokio::test]
    async fn backfill_state_machine() {
        let store = store();
        let state = store.backfill_state(C).await.unwrap();
        assert_eq!(state.status, BackfillStatus::NotStarted);
        assert!(!state.is_running() && !state.is_completed());

        store.mark_backfill_started(C).await.unwrap();
        assert!(store.is_backfill_running(C).await.unwrap());
        assert!(!store.is_backfill_completed(C).await.unwrap());
        assert!(store.mark_backfill_started(C).await.is_err());

        let done = store.mark_backfill_completed(C, 99).await.unwrap();
        assert_eq!(done.total_imported, 99);
        assert!(!store.is_backfill_running(C).await.unwrap());
        assert!(store.is_backfill_completed(C).await.unwrap());
        assert!(store.mark_backfill_started(C).await.is_err());
        assert_eq!(store.completed_communities().await.unwrap(), vec![C]);

        store.reset_backfill_state(C).await.unwrap();
        assert_eq!(
            store.backfill_state(C).await.unwrap().status,
            BackfillStatus::NotStarted
        );
    }

    #[tokio::test]
    async fn begin_backfill_drops_live_counters_and_records_scope() {
        let store = store();
        let now = Utc::now();
        store.increment_count(C, U, ChannelId(1), 4, now).await.unwrap();
        store.increment_count(CommunityId(2), U, ChannelId(1), 6, now).await.unwrap();
        store.merge_excluded_channels(C, "old", vec![ChannelId(9)]).await.unwrap();

        let state = store.begin_backfill(C, "abc").await.unwrap();
        assert!(state.is_running());
        assert!(state.started_at.is_some());
        assert_eq!(store.get_user_total(C, U, &HashSet::new()).await.unwrap(), 0);
        assert!(store.excluded_channels(C).await.unwrap().is_empty());
        assert_eq!(store.scope_fingerprint(C).await.unwrap().as_deref(), Some("abc"));
        // Other communities are untouched
        assert_eq!(
            store.get_user_total(CommunityId(2), U, &HashSet::new()).await.unwrap(),
            6
        );

        // Refused transitions leave counters alone
        store.increment_count(C, U, ChannelId(1), 2, now).await.unwrap();
        assert!(store.begin_backfill(C, "abc").await.is_err());
        assert_eq!(store.get_user_total(C, U, &HashSet::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn excluded_channels_follow_the_backfill_fingerprint() {
        let store = store();
        store.begin_backfill(C, "abc").await.unwrap();

        let added = store
            .merge_excluded_channels(C, "abc", vec![ChannelId(5), ChannelId(6)])
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(
            store.merge_excluded_channels(C, "abc", vec![ChannelId(5)]).await.unwrap(),
            0
        );
        // Rules that did not shape the counters are ignored
        assert_eq!(
            store.merge_excluded_channels(C, "other", vec![ChannelId(7)]).await.unwrap(),
            0
        );
        assert!(store.is_channel_excluded(C, ChannelId(5)).await.unwrap());
        assert!(!store.is_channel_excluded(C, ChannelId(7)).await.unwrap());
        assert!(!store.is_channel_excluded(CommunityId(2), ChannelId(5)).await.unwrap());

        store.clear_community_data(C).await.unwrap();
        assert!(store.excluded_channels(C).await.unwrap().is_empty());
        assert_eq!(store.scope_fingerprint(C).await.unwrap(), None);
    }

    #[tokio::test]
    async fn completing_without_start_is_rejected() {
        let store = store();
        let err = store.mark_backfill_completed(C, 1).await.unwrap_err();
        assert!(err.to_string().contains("not running"));
    }

    #[test]
    fn stale_detection_uses_start_time() {
        let now = Utc::now();
        let state = BackfillState {
            community: C,
            status: BackfillStatus::Running,
            started_at: Some(now - chrono::Duration::hours(30)),
            completed_at: None,
            total_imported: 0,
        };
        assert!(state.is_stale(now, Duration::from_secs(24 * 3_600)));
        assert!(!state.is_stale(now, Duration::from_secs(48 * 3_600)));
    }

    #[tokio::test]
    async fn resync_replaces_member_set() {
        let store = store();
        store
            .resync_members(
                C,
                vec![
                    MemberSnapshot::new(UserId(1), "ada"),
                    MemberSnapshot::new(UserId(2), "bob"),
                ],
            )
            .await
            .unwrap();

        let report = store
            .resync_members(
                C,
                vec![
                    MemberSnapshot::new(UserId(2), "bobby"),
                    MemberSnapshot::new(UserId(3), "cy"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(report, ResyncReport { upserted: 2, removed: 1 });

        let members = store.list_members(C).await.unwrap();
        let names: Vec<_> = members.iter().map(|m| m.display_name.as_str()).collect();
        assert_eq!(names, vec!["bobby", "cy"]);
    }

    #[tokio::test]
    async fn resync_handles_more_than_one_chunk() {
        let store = store();
        let members: Vec<_> = (0..1_234u64)
            .map(|i| MemberSnapshot::new(UserId(i), format!("user-{i}")))
            .collect();
        let report = store.resync_members(C, members).await.unwrap();
        assert_eq!(report.upserted, 1_234);
        assert_eq!(store.list_members(C).await.unwrap().len(), 1_234);
    }

    #[tokio::test]
    async fn prune_removes_unknown_channels() {
        let store = store();
        let now = Utc::now();
        store.increment_count(C, U, ChannelId(1), 4, now).await.unwrap();
        store.increment_count(C, U, ChannelId(2), 6, now).await.unwrap();
        store.increment_count(C, UserId(11), ChannelId(2), 1, now).await.unwrap();

        let known: HashSet<_> = [ChannelId(1)].into_iter().collect();
        let report = store.prune_deleted_channels(C, &known).await.unwrap();
        assert_eq!(report.channels_removed, 1);
        assert_eq!(report.rows_removed, 2);
        assert_eq!(store.get_user_total(C, U, &HashSet::new()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn stats_count_members_without_messages() {
        let store = store();
        let now = Utc::now();
        store.increment_count(C, UserId(1), ChannelId(1), 3, now).await.unwrap();
        let mut bot = MemberSnapshot::new(UserId(9), "helper");
        bot.is_bot = true;
        store
            .resync_members(
                C,
                vec![
                    MemberSnapshot::new(UserId(1), "ada"),
                    MemberSnapshot::new(UserId(2), "lurker"),
                    bot,
                ],
            )
            .await
            .unwrap();

        let stats = store.get_stats(C).await.unwrap();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.tracked_users, 1);
        assert_eq!(stats.members, 3);
        assert_eq!(stats.human_members, 2);
        assert_eq!(stats.members_without_messages, 1);
        assert!(stats.storage_bytes > 0);
    }

    #[tokio::test]
    async fn top_users_ranked_by_total() {
        let store = store();
        let now = Utc::now();
        store.increment_count(C, UserId(1), ChannelId(1), 3, now).await.unwrap();
        store.increment_count(C, UserId(2), ChannelId(1), 9, now).await.unwrap();
        store.increment_count(C, UserId(3), ChannelId(2), 5, now).await.unwrap();

        let top = store.get_top_users(C, 2, &HashSet::new()).await.unwrap();
        assert_eq!(top, vec![(UserId(2), 9), (UserId(3), 5)]);
    }

    #[test]
    fn newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        let err = LedgerStore::from_connection(conn).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn version_one_gains_scope_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        let store = LedgerStore::from_connection(conn).unwrap();
        let guard = store.conn.lock();
        let version: i32 = guard.query_row("PRAGMA user_version", [], |row| row.get(0)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        let tables: i64 = guard
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('channel_scope', 'excluded_channels')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[tokio::test]
    async fn reopening_file_preserves_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let store = LedgerStore::open(&path).unwrap();
            store
                .increment_count(C, U, ChannelId(1), 7, Utc::now())
                .await
                .unwrap();
        }
        let store = LedgerStore::open(&path).unwrap();
        assert_eq!(store.get_user_total(C, U, &HashSet::new()).await.unwrap(), 7);
    }
}
