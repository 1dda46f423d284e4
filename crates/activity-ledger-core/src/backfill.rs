//! One-time bulk import of a community's message history.
//!
//! Lifecycle: `not_started -> running -> completed`, plus a manual reset back
//! to `not_started` that wipes imported counts and members for a full
//! re-import.
//!
//! Starting a run drops the community's counters: the import re-reads every
//! message older than its start time, including ones already counted live.
//!
//! Progress is made durable by flushing accumulated deltas every
//! `flush_threshold` messages. A run that dies after a flush leaves `running`
//! persisted; the rows it flushed stay in place, so recovery is always
//! reset-then-rerun.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{Instrument, debug, error, info, warn};

use crate::cache::CountCache;
use crate::error::{BackfillError, Result};
use crate::model::{ChannelFailure, ChannelId, CommunityId, CountDelta, UserId};
use crate::progress::{Progress, ProgressCallback, notify};
use crate::retry::{RetryPolicy, with_source_retry};
use crate::scope::ChannelScope;
use crate::source::{DEFAULT_PAGE_SIZE, HistoryCursor, HistorySource};
use crate::storage::LedgerStore;

/// Messages accumulated before a flush to the store.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 5_000;

/// Outcome of one import run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub community: CommunityId,
    pub run_id: String,
    pub success: bool,
    /// Messages written to the store, including ones flushed before a failure.
    pub total_messages: u64,
    pub channels_processed: usize,
    pub channels_failed: usize,
    pub failed_channels: Vec<ChannelFailure>,
    pub members_synced: usize,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// What a reset removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub counts_removed: usize,
    pub members_removed: usize,
    pub cache_entries_removed: usize,
}

/// Removes the community from the in-process run set on every exit path,
/// unwinding included.
struct RunGuard {
    running: Arc<Mutex<HashSet<CommunityId>>>,
    community: CommunityId,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.community);
    }
}

/// Per-run accumulation state.
struct ImportRun {
    community: CommunityId,
    /// Messages at or after this instant belong to the live path.
    boundary: DateTime<Utc>,
    pending: HashMap<(UserId, ChannelId), (i64, DateTime<Utc>)>,
    pending_messages: usize,
    flushed: u64,
    channels_processed: usize,
    failed_channels: Vec<ChannelFailure>,
    members_synced: usize,
}

impl ImportRun {
    fn record(&mut self, user: UserId, channel: ChannelId, at: DateTime<Utc>) {
        let entry = self.pending.entry((user, channel)).or_insert((0, at));
        entry.0 += 1;
        if at > entry.1 {
            entry.1 = at;
        }
        self.pending_messages += 1;
    }

    fn take_deltas(&mut self) -> Vec<CountDelta> {
        self.pending_messages = 0;
        self.pending
            .drain()
            .map(|((user, channel), (delta, last))| CountDelta {
                user,
                channel,
                delta,
                last_message_at: Some(last),
            })
            .collect()
    }
}

/// Imports full history into the aggregate store.
#[derive(Clone)]
pub struct BackfillPipeline {
    store: LedgerStore,
    cache: CountCache,
    source: Arc<dyn HistorySource>,
    scope: ChannelScope,
    policy: RetryPolicy,
    page_size: usize,
    flush_threshold: usize,
    running: Arc<Mutex<HashSet<CommunityId>>>,
}

impl BackfillPipeline {
    #[must_use]
    pub fn new(
        store: LedgerStore,
        cache: CountCache,
        source: Arc<dyn HistorySource>,
        scope: ChannelScope,
    ) -> Self {
        Self {
            store,
            cache,
            source,
            scope,
            policy: RetryPolicy::history(),
            page_size: DEFAULT_PAGE_SIZE,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold.max(1);
        self
    }

    /// Whether this process is importing `community` right now.
    #[must_use]
    pub fn is_running_here(&self, community: CommunityId) -> bool {
        self.running.lock().contains(&community)
    }

    fn acquire(&self, community: CommunityId) -> Result<RunGuard> {
        if !self.running.lock().insert(community) {
            return Err(BackfillError::AlreadyRunning(community.get()).into());
        }
        Ok(RunGuard {
            running: Arc::clone(&self.running),
            community,
        })
    }

    /// Import the full history of `community`.
    ///
    /// Refuses to start when the backfill is completed (reset first) or
    /// persisted as running. Once started, failures are reported in the
    /// returned [`BackfillReport`] rather than as an error.
    pub async fn import_community_history(
        &self,
        community: CommunityId,
        progress: Option<ProgressCallback>,
        after: Option<DateTime<Utc>>,
    ) -> Result<BackfillReport> {
        let _guard = self.acquire(community)?;

        let state = self.store.backfill_state(community).await?;
        if state.is_completed() {
            return Err(BackfillError::AlreadyCompleted(community.get()).into());
        }
        if state.is_running() {
            warn!(
                community = %community,
                started_at = ?state.started_at,
                "Backfill persisted as running; reset it if the previous run crashed"
            );
            return Err(BackfillError::AlreadyRunning(community.get()).into());
        }

        // 1. Claim the run before any I/O; live counters so far are re-read
        let started = self
            .store
            .begin_backfill(community, &self.scope.fingerprint())
            .await?;
        let boundary = started.started_at.unwrap_or_else(Utc::now);
        let run_id = format!("{:08x}", rand::random::<u32>());
        let span = crate::ledger_span!("backfill", community = community.get(), run_id = run_id.as_str());
        let clock = Instant::now();

        let mut run = ImportRun {
            community,
            boundary,
            pending: HashMap::new(),
            pending_messages: 0,
            flushed: 0,
            channels_processed: 0,
            failed_channels: Vec::new(),
            members_synced: 0,
        };

        // 2. Walk everything; only catastrophic failures come back as Err
        let outcome = self
            .run_import(&mut run, progress.as_ref(), after)
            .instrument(span.clone())
            .await;

        // 3. Finish the lifecycle
        let outcome = match outcome {
            Ok(()) => self.complete(&mut run).instrument(span).await,
            Err(err) => Err(err),
        };

        let mut report = BackfillReport {
            community,
            run_id,
            success: outcome.is_ok(),
            total_messages: run.flushed,
            channels_processed: run.channels_processed,
            channels_failed: run.failed_channels.len(),
            failed_channels: run.failed_channels,
            members_synced: run.members_synced,
            error: None,
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        if let Err(err) = outcome {
            error!(
                community = %community,
                run_id = %report.run_id,
                flushed = report.total_messages,
                error = %err,
                "Backfill aborted; resetting state so it can be retried"
            );
            if let Err(reset_err) = self.store.reset_backfill_state(community).await {
                error!(community = %community, error = %reset_err, "Failed to reset backfill state");
            }
            report.error = Some(err.to_string());
            return Ok(report);
        }

        info!(
            community = %community,
            run_id = %report.run_id,
            total_messages = report.total_messages,
            channels_processed = report.channels_processed,
            channels_failed = report.channels_failed,
            duration_ms = report.duration_ms,
            "Backfill completed"
        );
        Ok(report)
    }

    async fn run_import(
        &self,
        run: &mut ImportRun,
        progress: Option<&ProgressCallback>,
        after: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let resolved = self
            .scope
            .resolve(self.source.as_ref(), &self.policy, run.community)
            .await?;
        self.store
            .merge_excluded_channels(run.community, &self.scope.fingerprint(), resolved.excluded.clone())
            .await?;
        let total = resolved.included.len();
        info!(
            community = %run.community,
            channels = total,
            excluded = resolved.excluded.len(),
            "Enumerated channels for backfill"
        );

        for (index, channel) in resolved.included.iter().enumerate() {
            let mut cursor = HistoryCursor::new(self.source.as_ref(), &self.policy, channel.id)
                .page_size(self.page_size)
                .not_before(after);
            let mut channel_messages = 0u64;
            let walked = loop {
                match cursor.next_page().await {
                    Ok(Some(page)) => {
                        for message in page {
                            if message.author_bot || message.created_at >= run.boundary {
                                continue;
                            }
                            run.record(message.author_id, channel.id, message.created_at);
                            channel_messages += 1;
                        }
                        if run.pending_messages >= self.flush_threshold {
                            self.flush(run).await?;
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(err),
                }
            };

            match walked {
                Ok(()) => run.channels_processed += 1,
                Err(err) => {
                    warn!(
                        channel = %channel.id,
                        name = %channel.name,
                        error = %err,
                        "Channel failed during backfill; continuing"
                    );
                    run.failed_channels.push(ChannelFailure::new(channel, &err));
                }
            }
            debug!(channel = %channel.id, messages = channel_messages, pages = cursor.pages(), "Channel walked");

            notify(
                progress,
                &Progress {
                    label: channel.name.clone(),
                    current: index + 1,
                    total,
                },
            );
        }

        self.flush(run).await
    }

    async fn flush(&self, run: &mut ImportRun) -> Result<()> {
        let deltas = run.take_deltas();
        let messages: u64 = deltas.iter().map(|d| d.delta as u64).sum();
        if messages == 0 {
            return Ok(());
        }
        self.store.apply_deltas(run.community, deltas).await?;
        run.flushed += messages;
        info!(community = %run.community, flushed = messages, total = run.flushed, "Flushed backfill batch");
        Ok(())
    }

    /// Resync members, mark completed, drop stale cached counts.
    async fn complete(&self, run: &mut ImportRun) -> Result<()> {
        let members = with_source_retry(&self.policy, "list_members", || {
            self.source.list_members(run.community)
        })
        .await?;
        let report = self.store.resync_members(run.community, members).await?;
        run.members_synced = report.upserted;
        self.store
            .mark_backfill_completed(run.community, run.flushed)
            .await?;
        let cleared = self.cache.clear_community(run.community).await?;
        debug!(community = %run.community, members = report.upserted, cleared, "Backfill finalized");
        Ok(())
    }

    /// Wipe counts, members, cache and state so the next import starts clean.
    pub async fn reset(&self, community: CommunityId) -> Result<ResetReport> {
        let _guard = self.acquire(community)?;
        let (counts_removed, members_removed) = self.store.clear_community_data(community).await?;
        self.store.reset_backfill_state(community).await?;
        let cache_entries_removed = self.cache.clear_community(community).await?;
        info!(
            community = %community,
            counts_removed,
            members_removed,
            cache_entries_removed,
            "Backfill reset"
        );
        Ok(ResetReport {
            counts_removed,
            members_removed,
            cache_entries_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::model::{ChannelInfo, MemberSnapshot};
    use crate::source::memory::MemorySource;
    use crate::storage::BackfillStatus;

    const C: CommunityId = CommunityId(1);

    fn setup() -> (Arc<MemorySource>, LedgerStore, CountCache, BackfillPipeline) {
        let source = Arc::new(MemorySource::new());
        let store = LedgerStore::open_in_memory().unwrap();
        let cache = CountCache::open_in_memory(None).unwrap();
        let pipeline = BackfillPipeline::new(
            store.clone(),
            cache.clone(),
            source.clone(),
            ChannelScope::unrestricted(),
        )
        .with_retry_policy(RetryPolicy::immediate(Some(2)));
        (source, store, cache, pipeline)
    }

    fn seed(source: &MemorySource) {
        source.add_channel(C, ChannelInfo::text(1, "general"));
        source.add_channel(C, ChannelInfo::text(2, "memes"));
        source.add_channel(C, ChannelInfo::text(3, "help"));
        source.add_messages(ChannelId(1), UserId(7), 10);
        source.add_messages(ChannelId(3), UserId(7), 5);
        source.add_messages(ChannelId(2), UserId(8), 3);
        source.add_message(ChannelId(2), UserId(99), true, Utc::now() - chrono::Duration::minutes(5));
        source.set_members(C, vec![MemberSnapshot::new(UserId(7), "ada"), MemberSnapshot::new(UserId(8), "bo")]);
    }

    #[tokio::test]
    async fn imports_and_completes() {
        let (source, store, _, pipeline) = setup();
        seed(&source);

        let report = pipeline.import_community_history(C, None, None).await.unwrap();
        assert!(report.success, "{report:?}");
        assert_eq!(report.total_messages, 18);
        assert_eq!(report.channels_processed, 3);
        assert_eq!(report.members_synced, 2);

        assert_eq!(store.get_user_total(C, UserId(7), &HashSet::new()).await.unwrap(), 15);
        assert_eq!(store.get_user_total(C, UserId(99), &HashSet::new()).await.unwrap(), 0);
        let state = store.backfill_state(C).await.unwrap();
        assert_eq!(state.status, BackfillStatus::Completed);
        assert_eq!(state.total_imported, 18);
        assert_eq!(store.list_members(C).await.unwrap().len(), 2);
        assert!(!pipeline.is_running_here(C));
    }

    #[tokio::test]
    async fn refuses_when_completed() {
        let (source, _, _, pipeline) = setup();
        seed(&source);
        pipeline.import_community_history(C, None, None).await.unwrap();
        let err = pipeline.import_community_history(C, None, None).await.unwrap_err();
        assert!(matches!(err, Error::Backfill(BackfillError::AlreadyCompleted(1))));
    }

    #[tokio::test]
    async fn refuses_when_persisted_running() {
        let (source, store, _, pipeline) = setup();
        seed(&source);
        store.mark_backfill_started(C).await.unwrap();
        let err = pipeline.import_community_history(C, None, None).await.unwrap_err();
        assert!(matches!(err, Error::Backfill(BackfillError::AlreadyRunning(1))));
    }

    #[tokio::test]
    async fn forbidden_channel_is_partial_success() {
        let (source, store, _, pipeline) = setup();
        seed(&source);
        source.forbid(ChannelId(3));

        let report = pipeline.import_community_history(C, None, None).await.unwrap();
        assert!(report.success);
        assert_eq!(report.channels_failed, 1);
        assert_eq!(report.failed_channels[0].channel, ChannelId(3));
        assert_eq!(store.get_user_total(C, UserId(7), &HashSet::new()).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn enumeration_failure_resets_state() {
        let (source, store, _, pipeline) = setup();
        seed(&source);
        source.fail_list_channels(true);

        let report = pipeline.import_community_history(C, None, None).await.unwrap();
        assert!(!report.success);
        assert!(report.error.is_some());
        let state = store.backfill_state(C).await.unwrap();
        assert_eq!(state.status, BackfillStatus::NotStarted);
        assert!(!state.is_running());

        source.fail_list_channels(false);
        let retry = pipeline.import_community_history(C, None, None).await.unwrap();
        assert!(retry.success);
    }

    #[tokio::test]
    async fn member_sync_failure_never_claims_completed() {
        let (source, store, _, pipeline) = setup();
        seed(&source);
        source.fail_list_members(true);

        let report = pipeline.import_community_history(C, None, None).await.unwrap();
        assert!(!report.success);
        // Flushed counts are not rolled back
        assert_eq!(report.total_messages, 18);
        assert!(!store.is_backfill_completed(C).await.unwrap());
        assert!(!store.is_backfill_running(C).await.unwrap());
    }

    #[tokio::test]
    async fn flushes_at_threshold() {
        let (source, store, _, pipeline) = setup();
        let pipeline = pipeline.with_flush_threshold(50);
        source.add_channel(C, ChannelInfo::text(1, "general"));
        source.add_messages(ChannelId(1), UserId(1), 230);

        let report = pipeline.import_community_history(C, None, None).await.unwrap();
        assert_eq!(report.total_messages, 230);
        assert_eq!(store.get_user_total(C, UserId(1), &HashSet::new()).await.unwrap(), 230);
    }

    #[tokio::test]
    async fn after_bound_limits_import() {
        let (source, store, _, pipeline) = setup();
        source.add_channel(C, ChannelInfo::text(1, "general"));
        let now = Utc::now();
        for days_ago in [30, 10, 2] {
            source.add_message(ChannelId(1), UserId(1), false, now - chrono::Duration::days(days_ago));
        }
        let report = pipeline
            .import_community_history(C, None, Some(now - chrono::Duration::days(15)))
            .await
            .unwrap();
        assert_eq!(report.total_messages, 2);
        assert_eq!(store.get_user_total(C, UserId(1), &HashSet::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn messages_after_start_belong_to_live_path() {
        let (source, store, _, pipeline) = setup();
        source.add_channel(C, ChannelInfo::text(1, "general"));
        source.add_messages(ChannelId(1), UserId(1), 3);
        source.add_message(ChannelId(1), UserId(1), false, Utc::now() + chrono::Duration::minutes(1));

        let report = pipeline.import_community_history(C, None, None).await.unwrap();
        assert_eq!(report.total_messages, 3);
        assert_eq!(store.get_user_total(C, UserId(1), &HashSet::new()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let (source, store, cache, pipeline) = setup();
        seed(&source);
        pipeline.import_community_history(C, None, None).await.unwrap();
        cache
            .set(&crate::cache::CacheKey::new(C, UserId(7), Some(7), "h"), 3)
            .await
            .unwrap();

        let reset = pipeline.reset(C).await.unwrap();
        assert_eq!(reset.members_removed, 2);
        assert_eq!(reset.cache_entries_removed, 1);
        assert!(reset.counts_removed > 0);
        assert_eq!(store.get_stats(C).await.unwrap().total_messages, 0);
        assert_eq!(store.backfill_state(C).await.unwrap().status, BackfillStatus::NotStarted);

        let again = pipeline.import_community_history(C, None, None).await.unwrap();
        assert_eq!(again.total_messages, 18);
    }

    #[tokio::test]
    async fn progress_reports_every_channel() {
        let (source, _, _, pipeline) = setup();
        seed(&source);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |p: &Progress| {
            seen_clone.lock().push((p.current, p.total));
            Ok(())
        });
        pipeline.import_community_history(C, Some(callback), None).await.unwrap();
        assert_eq!(*seen.lock(), vec![(1, 3), (2, 3), (3, 3)]);
    }
}
