//! The `Ledger` facade: one explicitly constructed handle over the store,
//! cache, counting engine, backfill pipeline and auditor.
//!
//! Command handlers, schedulers and the live-event runtime talk to this type
//! only. There are no process-wide singletons; two ledgers over different
//! databases coexist freely.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::auditor::{AuditKind, AuditRequest, AuditResult, AuditSettings, ConsistencyAuditor};
use crate::backfill::{BackfillPipeline, BackfillReport, ResetReport};
use crate::cache::{CacheStats, CountCache};
use crate::config::{Config, LedgerConfig, ScheduleConfig};
use crate::counting::{BatchCountResult, CountOptions, CountingEngine, UserCount};
use crate::error::Result;
use crate::model::{ChannelId, CommunityId, MemberSnapshot, MessageEvent, UserId};
use crate::progress::{AuditProgressCallback, ProgressCallback};
use crate::retry::RetryPolicy;
use crate::scheduler::{AuditSchedule, AuditScheduler};
use crate::scope::ChannelScope;
use crate::source::HistorySource;
use crate::storage::{BackfillState, ChannelCount, LedgerStats, LedgerStore};

/// Activity ledger handle. Cheap to clone.
#[derive(Clone)]
pub struct Ledger {
    store: LedgerStore,
    cache: CountCache,
    engine: CountingEngine,
    pipeline: BackfillPipeline,
    auditor: ConsistencyAuditor,
}

impl Ledger {
    /// Assemble a ledger from already-built parts.
    #[must_use]
    pub fn new(
        store: LedgerStore,
        cache: CountCache,
        engine: CountingEngine,
        pipeline: BackfillPipeline,
        auditor: ConsistencyAuditor,
    ) -> Self {
        Self {
            store,
            cache,
            engine,
            pipeline,
            auditor,
        }
    }

    /// Open the configured databases and wire every component.
    pub fn from_config(config: &Config, source: Arc<dyn HistorySource>) -> Result<Self> {
        let store = LedgerStore::open(&config.storage.ledger_path())?;
        let cache = CountCache::open(&config.storage.cache_path(), config.ledger.cache_ttl())?;
        Ok(Self::assemble(
            store,
            cache,
            source,
            &config.ledger,
            config.retry.policy(),
            config.source.page_size,
        ))
    }

    /// In-memory databases; nothing survives the process.
    pub fn in_memory(config: &LedgerConfig, source: Arc<dyn HistorySource>) -> Result<Self> {
        let store = LedgerStore::open_in_memory()?;
        let cache = CountCache::open_in_memory(config.cache_ttl())?;
        Ok(Self::assemble(
            store,
            cache,
            source,
            config,
            RetryPolicy::history(),
            crate::source::DEFAULT_PAGE_SIZE,
        ))
    }

    /// Same wiring as [`Ledger::from_config`] with an explicit retry policy.
    #[must_use]
    pub fn assemble(
        store: LedgerStore,
        cache: CountCache,
        source: Arc<dyn HistorySource>,
        config: &LedgerConfig,
        policy: RetryPolicy,
        page_size: usize,
    ) -> Self {
        let scope = ChannelScope::from_config(config);
        let engine = CountingEngine::new(store.clone(), cache.clone(), Arc::clone(&source), scope.clone())
            .with_retry_policy(policy.clone())
            .with_page_size(page_size)
            .with_parallelism(config.parallelism);
        let pipeline = BackfillPipeline::new(store.clone(), cache.clone(), source, scope)
            .with_retry_policy(policy)
            .with_page_size(page_size)
            .with_flush_threshold(config.backfill_flush_threshold);
        let auditor = ConsistencyAuditor::new(
            store.clone(),
            engine.clone(),
            AuditSettings::from_config(config),
        );
        Self::new(store, cache, engine, pipeline, auditor)
    }

    #[must_use]
    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    #[must_use]
    pub fn cache(&self) -> &CountCache {
        &self.cache
    }

    #[must_use]
    pub fn engine(&self) -> &CountingEngine {
        &self.engine
    }

    #[must_use]
    pub fn pipeline(&self) -> &BackfillPipeline {
        &self.pipeline
    }

    #[must_use]
    pub fn auditor(&self) -> &ConsistencyAuditor {
        &self.auditor
    }

    /// Scheduler driving this ledger's auditor.
    pub fn scheduler(&self, config: &ScheduleConfig) -> Result<AuditScheduler> {
        Ok(AuditScheduler::new(
            self.auditor.clone(),
            AuditSchedule::from_config(config)?,
        ))
    }

    // =========================================================================
    // Live ingress
    // =========================================================================

    /// Count one live message. Returns whether the message was counted.
    ///
    /// Bot messages are ignored, and so are messages in channels that are
    /// excluded by id or were classified out of scope by the last channel
    /// resolution.
    pub async fn record_message(&self, event: &MessageEvent) -> Result<bool> {
        if event.author_bot {
            trace!(community = %event.community, channel = %event.channel, "Ignoring bot message");
            return Ok(false);
        }
        if self.engine.is_excluded_channel(event.community, event.channel).await? {
            trace!(community = %event.community, channel = %event.channel, "Ignoring message in excluded channel");
            return Ok(false);
        }
        self.store
            .increment_count(event.community, event.user, event.channel, 1, event.created_at)
            .await?;
        Ok(true)
    }

    /// Undo a counted message (deletion). Clamped at zero.
    pub async fn record_message_deleted(
        &self,
        community: CommunityId,
        user: UserId,
        channel: ChannelId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if self.engine.is_excluded_channel(community, channel).await? {
            return Ok(());
        }
        self.store.increment_count(community, user, channel, -1, at).await
    }

    pub async fn member_joined(&self, community: CommunityId, member: MemberSnapshot) -> Result<()> {
        debug!(community = %community, user = %member.user, "Member joined");
        self.store.upsert_member(community, member).await
    }

    pub async fn member_updated(&self, community: CommunityId, member: MemberSnapshot) -> Result<()> {
        self.store.upsert_member(community, member).await
    }

    /// Drop the member snapshot. Message counts are kept.
    pub async fn member_left(&self, community: CommunityId, user: UserId) -> Result<bool> {
        debug!(community = %community, user = %user, "Member left");
        self.store.remove_member(community, user).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn count_user_messages(
        &self,
        community: CommunityId,
        user: UserId,
        options: &CountOptions,
    ) -> Result<u64> {
        self.engine.count_user_messages(community, user, options).await
    }

    pub async fn count_user(
        &self,
        community: CommunityId,
        user: UserId,
        options: &CountOptions,
    ) -> Result<UserCount> {
        self.engine.count_user(community, user, options).await
    }

    pub async fn count_messages_for_users(
        &self,
        community: CommunityId,
        users: &[UserId],
        options: &CountOptions,
    ) -> Result<BatchCountResult> {
        self.engine.count_messages_for_users(community, users, options).await
    }

    /// Stored totals of every user, skipping excluded channels.
    pub async fn get_community_totals(&self, community: CommunityId) -> Result<HashMap<UserId, u64>> {
        let excluded = self.engine.excluded_channels(community).await?;
        self.store.get_community_totals(community, &excluded).await
    }

    pub async fn get_top_users(&self, community: CommunityId, limit: usize) -> Result<Vec<(UserId, u64)>> {
        let excluded = self.engine.excluded_channels(community).await?;
        self.store.get_top_users(community, limit, &excluded).await
    }

    pub async fn get_user_channel_breakdown(
        &self,
        community: CommunityId,
        user: UserId,
    ) -> Result<Vec<ChannelCount>> {
        self.store.get_user_channel_breakdown(community, user).await
    }

    pub async fn get_stats(&self, community: CommunityId) -> Result<LedgerStats> {
        self.store.get_stats(community).await
    }

    pub async fn backfill_state(&self, community: CommunityId) -> Result<BackfillState> {
        self.store.backfill_state(community).await
    }

    // =========================================================================
    // Backfill
    // =========================================================================

    pub async fn import_history(
        &self,
        community: CommunityId,
        progress: Option<ProgressCallback>,
        after: Option<DateTime<Utc>>,
    ) -> Result<BackfillReport> {
        self.pipeline
            .import_community_history(community, progress, after)
            .await
    }

    pub async fn reset_backfill(&self, community: CommunityId) -> Result<ResetReport> {
        self.pipeline.reset(community).await
    }

    // =========================================================================
    // Audits
    // =========================================================================

    pub async fn validate_sample(
        &self,
        community: CommunityId,
        users: &[UserId],
        tolerance_percent: Option<f64>,
        progress: Option<AuditProgressCallback>,
    ) -> Result<AuditResult> {
        self.auditor
            .validate_sample(community, users, tolerance_percent, progress)
            .await
    }

    pub async fn run_audit(
        &self,
        community: CommunityId,
        kind: AuditKind,
        request: AuditRequest,
    ) -> Result<Option<AuditResult>> {
        self.auditor.run_audit(community, kind, request).await
    }

    pub async fn recent_audits(
        &self,
        community: CommunityId,
        kind: Option<AuditKind>,
        limit: usize,
    ) -> Result<Vec<AuditResult>> {
        self.store.recent_audits(community, kind, limit).await
    }

    // =========================================================================
    // Cache maintenance
    // =========================================================================

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        self.cache.stats().await
    }

    /// Clear one community's entries, or everything.
    pub async fn clear_cache(&self, community: Option<CommunityId>) -> Result<usize> {
        match community {
            Some(community) => self.cache.clear_community(community).await,
            None => self.cache.clear_all().await,
        }
    }

    pub async fn prune_cache(&self) -> Result<usize> {
        self.cache.clear_expired().await
    }
}
