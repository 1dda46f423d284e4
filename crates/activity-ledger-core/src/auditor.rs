//! Sampling-based consistency audits.
//!
//! An audit picks a sample of users, recounts each from the history source
//! with the cache bypassed, and compares against the aggregate store. The
//! share of users within tolerance is the accuracy score.
//!
//! Channels that could not be recounted (permission loss, failures) are
//! excluded from the stored side too, so both totals cover the same channels.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{Instrument, debug, info, warn};

use crate::config::LedgerConfig;
use crate::counting::{CountOptions, CountingEngine};
use crate::error::{AuditError, Result};
use crate::model::{ChannelId, CommunityId, UserId};
use crate::progress::{AuditProgress, AuditProgressCallback, notify};
use crate::sampling::sample_users;
use crate::storage::LedgerStore;

/// What triggered an audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Daily,
    Weekly,
    Manual,
}

impl AuditKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown audit kind: {other}")),
        }
    }
}

/// One sampled user whose stored total differs from the recount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub user: UserId,
    pub stored: u64,
    pub fresh: u64,
    pub difference: u64,
    /// `difference / max(fresh, 1) * 100`.
    pub relative_percent: f64,
    pub within_tolerance: bool,
}

/// Result of one audit run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditResult {
    pub community: CommunityId,
    pub kind: AuditKind,
    pub created_at: DateTime<Utc>,
    pub sample_size: usize,
    pub matches: usize,
    pub mismatches: usize,
    pub accuracy_percent: f64,
    pub passed: bool,
    pub tolerance_percent: f64,
    pub max_difference: u64,
    pub avg_difference: f64,
    /// Users with any difference, within tolerance or not.
    pub discrepancies: Vec<Discrepancy>,
    /// Channels left out of both sides of the comparison.
    pub unverified_channels: Vec<ChannelId>,
    pub pruned_channels: usize,
    pub duration_ms: u64,
}

impl AuditResult {
    /// Discrepancies beyond tolerance.
    pub fn mismatched(&self) -> impl Iterator<Item = &Discrepancy> {
        self.discrepancies.iter().filter(|d| !d.within_tolerance)
    }
}

/// Audit thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditSettings {
    pub tolerance_percent: f64,
    pub pass_percent: f64,
    pub min_messages: u64,
    pub daily_sample_size: usize,
    pub weekly_sample_size: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self::from_config(&LedgerConfig::default())
    }
}

impl AuditSettings {
    #[must_use]
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            tolerance_percent: config.audit_tolerance_percent,
            pass_percent: config.audit_pass_percent,
            min_messages: config.audit_min_messages,
            daily_sample_size: config.daily_sample_size,
            weekly_sample_size: config.weekly_sample_size,
        }
    }

    #[must_use]
    pub fn sample_size(&self, kind: AuditKind) -> usize {
        match kind {
            AuditKind::Weekly => self.weekly_sample_size,
            AuditKind::Daily | AuditKind::Manual => self.daily_sample_size,
        }
    }
}

/// Percentage of `matches` out of `checked`; an empty sample is fully accurate.
#[must_use]
pub fn accuracy_percent(matches: usize, checked: usize) -> f64 {
    if checked == 0 {
        return 100.0;
    }
    matches as f64 / checked as f64 * 100.0
}

/// Relative difference in percent against the fresh value.
#[must_use]
pub fn relative_difference(stored: u64, fresh: u64) -> f64 {
    stored.abs_diff(fresh) as f64 / fresh.max(1) as f64 * 100.0
}

/// Options for a sampled audit.
#[derive(Clone, Default)]
pub struct AuditRequest {
    /// Overrides the kind's configured sample size.
    pub sample_size: Option<usize>,
    /// Fixes the sample for reproducible reruns.
    pub seed: Option<u64>,
    pub progress: Option<AuditProgressCallback>,
}

/// Compares stored aggregates against fresh recounts.
#[derive(Clone)]
pub struct ConsistencyAuditor {
    store: LedgerStore,
    engine: CountingEngine,
    settings: AuditSettings,
    run_lock: Arc<Mutex<()>>,
}

impl ConsistencyAuditor {
    #[must_use]
    pub fn new(store: LedgerStore, engine: CountingEngine, settings: AuditSettings) -> Self {
        Self {
            store,
            engine,
            settings,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &AuditSettings {
        &self.settings
    }

    /// Audit an explicit set of users now. Fails with `Busy` if another
    /// audit holds the run lock.
    pub async fn validate_sample(
        &self,
        community: CommunityId,
        users: &[UserId],
        tolerance_percent: Option<f64>,
        progress: Option<AuditProgressCallback>,
    ) -> Result<AuditResult> {
        let _lock = self.run_lock.try_lock().map_err(|_| AuditError::Busy)?;
        let tolerance = tolerance_percent.unwrap_or(self.settings.tolerance_percent);
        let result = self
            .compare(community, AuditKind::Manual, users, tolerance, 0, progress.as_ref())
            .await?;
        self.store.record_audit(&result).await?;
        Ok(result)
    }

    /// Sample eligible users of `community` and audit them.
    ///
    /// Scheduled kinds wait for the run lock; manual runs fail fast with
    /// `Busy`. Returns `None` when the community is not eligible (backfill
    /// incomplete or running) or has no user above the message minimum.
    pub async fn run_audit(
        &self,
        community: CommunityId,
        kind: AuditKind,
        request: AuditRequest,
    ) -> Result<Option<AuditResult>> {
        let _lock = match kind {
            AuditKind::Manual => self.run_lock.try_lock().map_err(|_| AuditError::Busy)?,
            AuditKind::Daily | AuditKind::Weekly => self.run_lock.lock().await,
        };
        let span = crate::ledger_span!("audit", community = community.get(), audit_kind = kind.as_str());
        self.run_locked(community, kind, request).instrument(span).await
    }

    /// Run a scheduled audit over every eligible community.
    pub async fn run_scheduled(&self, kind: AuditKind) -> Result<Vec<AuditResult>> {
        let communities = self.store.completed_communities().await?;
        let mut results = Vec::new();
        for community in communities {
            match self.run_audit(community, kind, AuditRequest::default()).await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(err) => warn!(community = %community, audit_kind = %kind, error = %err, "Audit failed"),
            }
        }
        Ok(results)
    }

    async fn run_locked(
        &self,
        community: CommunityId,
        kind: AuditKind,
        request: AuditRequest,
    ) -> Result<Option<AuditResult>> {
        let state = self.store.backfill_state(community).await?;
        if !state.is_completed() || state.is_running() {
            debug!(community = %community, status = ?state.status, "Community not eligible for audit");
            return Ok(None);
        }

        // Drift from deleted channels is not a tracking bug
        let resolved = self.engine.resolve_channels(community).await?;
        let pruned = self.store.prune_deleted_channels(community, &resolved.known).await?;

        let candidates = self
            .store
            .users_with_min_messages(community, self.settings.min_messages)
            .await?;
        if candidates.is_empty() {
            info!(community = %community, "No users eligible for audit sampling");
            return Ok(None);
        }
        let size = request.sample_size.unwrap_or_else(|| self.settings.sample_size(kind));
        let sample = sample_users(&candidates, size, request.seed);

        let result = self
            .compare(
                community,
                kind,
                &sample,
                self.settings.tolerance_percent,
                pruned.channels_removed,
                request.progress.as_ref(),
            )
            .await?;
        self.store.record_audit(&result).await?;
        Ok(Some(result))
    }

    async fn compare(
        &self,
        community: CommunityId,
        kind: AuditKind,
        users: &[UserId],
        tolerance_percent: f64,
        pruned_channels: usize,
        progress: Option<&AuditProgressCallback>,
    ) -> Result<AuditResult> {
        let clock = Instant::now();
        let fresh = self
            .engine
            .count_messages_for_users(community, users, &CountOptions::fresh())
            .await?;

        let mut unverified: Vec<ChannelId> = fresh
            .failed_channels
            .iter()
            .map(|f| f.channel)
            .chain(fresh.unreadable_channels.iter().copied())
            .collect();
        unverified.sort_unstable();
        unverified.dedup();
        let mut excluded: HashSet<ChannelId> = self.engine.excluded_channels(community).await?;
        excluded.extend(unverified.iter().copied());

        let mut unique: Vec<UserId> = users.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let mut matches = 0usize;
        let mut max_difference = 0u64;
        let mut difference_sum = 0u64;
        let mut discrepancies = Vec::new();

        for (index, user) in unique.iter().enumerate() {
            let stored = self.store.get_user_total(community, *user, &excluded).await?;
            let fresh_count = fresh.counts.get(user).copied().unwrap_or(0);
            let difference = stored.abs_diff(fresh_count);
            let relative = relative_difference(stored, fresh_count);
            let within = relative <= tolerance_percent;

            if within {
                matches += 1;
            }
            max_difference = max_difference.max(difference);
            difference_sum += difference;
            if difference > 0 {
                discrepancies.push(Discrepancy {
                    user: *user,
                    stored,
                    fresh: fresh_count,
                    difference,
                    relative_percent: relative,
                    within_tolerance: within,
                });
            }

            notify(
                progress,
                &AuditProgress {
                    processed: index + 1,
                    total: unique.len(),
                    user: *user,
                    stored,
                    fresh: fresh_count,
                },
            );
        }

        let checked = unique.len();
        let accuracy = accuracy_percent(matches, checked);
        let result = AuditResult {
            community,
            kind,
            created_at: Utc::now(),
            sample_size: checked,
            matches,
            mismatches: checked - matches,
            accuracy_percent: accuracy,
            passed: accuracy >= self.settings.pass_percent,
            tolerance_percent,
            max_difference,
            avg_difference: if checked == 0 {
                0.0
            } else {
                difference_sum as f64 / checked as f64
            },
            discrepancies,
            unverified_channels: unverified,
            pruned_channels,
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        if result.passed {
            info!(
                community = %community,
                audit_kind = %kind,
                sample_size = checked,
                accuracy = result.accuracy_percent,
                "Audit passed"
            );
        } else {
            warn!(
                community = %community,
                audit_kind = %kind,
                sample_size = checked,
                accuracy = result.accuracy_percent,
                mismatches = result.mismatches,
                max_difference = result.max_difference,
                "Audit failed accuracy threshold"
            );
        }
        Ok(result)
    }
}
