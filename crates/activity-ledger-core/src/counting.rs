//! On-demand message counting.
//!
//! Two modes share one resolution order:
//!
//! 1. **Fast path**: backfill completed, no lookback window, cache allowed.
//!    The aggregate store already holds the answer.
//! 2. **Cache**: a previous computation for the exact same query shape.
//! 3. **Recount**: walk history for every in-scope channel and thread.
//!
//! Single-user counting walks each channel once for one user. Batch counting
//! is channel-first: every channel is walked exactly once for *all* users that
//! missed the cache, with at most `parallelism` channels in flight. History
//! reads stay O(channels) no matter how many users are asked about.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CountCache};
use crate::error::{ErrorKind, Result, SourceError};
use crate::model::{ChannelFailure, ChannelId, ChannelInfo, CommunityId, UserId};
use crate::progress::{Progress, ProgressCallback, notify};
use crate::retry::RetryPolicy;
use crate::scope::{ChannelScope, ResolvedChannels};
use crate::source::{DEFAULT_PAGE_SIZE, HistoryCursor, HistorySource};
use crate::storage::LedgerStore;

/// Default number of channels walked concurrently in batch mode.
pub const DEFAULT_PARALLELISM: usize = 5;

/// Per-call counting options.
#[derive(Clone)]
pub struct CountOptions {
    /// Only count messages from the last N days.
    pub lookback_days: Option<u32>,
    /// `false` skips the fast path and the cache and always recounts.
    pub use_cache: bool,
    /// Overrides the engine's default fan-out in batch mode.
    pub parallelism: Option<usize>,
    pub progress: Option<ProgressCallback>,
}

impl Default for CountOptions {
    fn default() -> Self {
        Self {
            lookback_days: None,
            use_cache: true,
            parallelism: None,
            progress: None,
        }
    }
}

impl std::fmt::Debug for CountOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountOptions")
            .field("lookback_days", &self.lookback_days)
            .field("use_cache", &self.use_cache)
            .field("parallelism", &self.parallelism)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl CountOptions {
    /// Always recount from the source.
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            use_cache: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn lookback_days(mut self, days: Option<u32>) -> Self {
        self.lookback_days = days;
        self
    }

    #[must_use]
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    #[must_use]
    pub fn progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    fn cutoff(&self) -> Option<DateTime<Utc>> {
        self.lookback_days
            .map(|days| Utc::now() - chrono::Duration::days(i64::from(days)))
    }
}

/// Where a single-user answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountSource {
    Store,
    Cache,
    Recount,
}

/// Detailed single-user result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserCount {
    pub user: UserId,
    pub count: u64,
    pub source: CountSource,
    pub channels_scanned: usize,
    pub failed_channels: Vec<ChannelFailure>,
}

impl UserCount {
    /// Every in-scope channel was read successfully.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_channels.is_empty()
    }
}

/// Cache usage of a batch call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheUsage {
    pub hits: usize,
    pub misses: usize,
    /// Answered straight from the aggregate store.
    pub from_store: bool,
}

/// Batch result: counts for every requested user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchCountResult {
    pub counts: HashMap<UserId, u64>,
    pub cache: CacheUsage,
    pub channels_scanned: usize,
    pub failed_channels: Vec<ChannelFailure>,
    /// In-scope channels skipped for lack of history access.
    pub unreadable_channels: Vec<ChannelId>,
}

/// Computes user message counts against the store, cache and history source.
#[derive(Clone)]
pub struct CountingEngine {
    store: LedgerStore,
    cache: CountCache,
    source: Arc<dyn HistorySource>,
    scope: ChannelScope,
    policy: RetryPolicy,
    page_size: usize,
    parallelism: usize,
}

impl CountingEngine {
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
            parallelism: DEFAULT_PARALLELISM,
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
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    #[must_use]
    pub fn scope(&self) -> &ChannelScope {
        &self.scope
    }

    /// Enumerate the in-scope channels of a community. Channels the rules
    /// leave out are recorded so stored totals skip them too.
    pub async fn resolve_channels(&self, community: CommunityId) -> Result<ResolvedChannels> {
        let resolved = self
            .scope
            .resolve(self.source.as_ref(), &self.policy, community)
            .await?;
        if !resolved.excluded.is_empty() {
            self.store
                .merge_excluded_channels(community, &self.scope.fingerprint(), resolved.excluded.clone())
                .await?;
        }
        Ok(resolved)
    }

    /// Channels whose stored counters never count toward totals: configured
    /// ids plus every channel a resolution classified as out of scope.
    pub async fn excluded_channels(&self, community: CommunityId) -> Result<HashSet<ChannelId>> {
        let mut excluded = self.store.excluded_channels(community).await?;
        excluded.extend(self.scope.excluded_ids());
        Ok(excluded)
    }

    /// Whether live events in `channel` fall outside the scope.
    pub async fn is_excluded_channel(&self, community: CommunityId, channel: ChannelId) -> Result<bool> {
        if self.scope.is_excluded_id(channel) {
            return Ok(true);
        }
        self.store.is_channel_excluded(community, channel).await
    }

    fn cache_key(&self, community: CommunityId, user: UserId, lookback_days: Option<u32>) -> CacheKey {
        CacheKey::new(community, user, lookback_days, self.scope.fingerprint())
    }

    /// Fast path applies: cache allowed, no window, backfill completed under
    /// the current exclusion rules.
    async fn store_is_authoritative(&self, community: CommunityId, options: &CountOptions) -> Result<bool> {
        if !options.use_cache || options.lookback_days.is_some() {
            return Ok(false);
        }
        let state = self.store.backfill_state(community).await?;
        if !state.is_completed() || state.is_running() {
            return Ok(false);
        }
        let Some(recorded) = self.store.scope_fingerprint(community).await? else {
            return Ok(true);
        };
        if recorded != self.scope.fingerprint() {
            debug!(community = %community, "Exclusion rules changed since backfill; recounting");
            return Ok(false);
        }
        Ok(true)
    }

    // =========================================================================
    // Single-user mode
    // =========================================================================

    /// Count one user's messages.
    pub async fn count_user_messages(
        &self,
        community: CommunityId,
        user: UserId,
        options: &CountOptions,
    ) -> Result<u64> {
        Ok(self.count_user(community, user, options).await?.count)
    }

    /// Count one user's messages, reporting where the answer came from.
    pub async fn count_user(
        &self,
        community: CommunityId,
        user: UserId,
        options: &CountOptions,
    ) -> Result<UserCount> {
        if self.store_is_authoritative(community, options).await? {
            let count = self
                .store
                .get_user_total(community, user, &self.excluded_channels(community).await?)
                .await?;
            return Ok(UserCount {
                user,
                count,
                source: CountSource::Store,
                channels_scanned: 0,
                failed_channels: Vec::new(),
            });
        }

        let key = self.cache_key(community, user, options.lookback_days);
        if options.use_cache {
            if let Some(count) = self.cache.get(&key).await? {
                return Ok(UserCount {
                    user,
                    count,
                    source: CountSource::Cache,
                    channels_scanned: 0,
                    failed_channels: Vec::new(),
                });
            }
        }

        let resolved = self.resolve_channels(community).await?;
        let users: HashSet<UserId> = [user].into_iter().collect();
        let cutoff = options.cutoff();
        let total = resolved.included.len();

        let mut count = 0u64;
        let mut failed_channels = Vec::new();
        for (index, channel) in resolved.included.iter().enumerate() {
            match self.count_channel(channel, &users, cutoff).await {
                Ok(counts) => count += counts.get(&user).copied().unwrap_or(0),
                Err(err) => failed_channels.push(self.channel_failed(channel, &err)?),
            }
            notify(
                options.progress.as_ref(),
                &Progress {
                    label: channel.name.clone(),
                    current: index + 1,
                    total,
                },
            );
        }

        if failed_channels.is_empty() {
            self.cache.set(&key, count).await?;
        }
        debug!(
            community = %community,
            user = %user,
            count,
            channels = total,
            failed = failed_channels.len(),
            "Recounted user messages"
        );

        Ok(UserCount {
            user,
            count,
            source: CountSource::Recount,
            channels_scanned: total - failed_channels.len(),
            failed_channels,
        })
    }

    // =========================================================================
    // Batch mode (channel-first)
    // =========================================================================

    /// Count messages for many users, walking each channel once.
    pub async fn count_messages_for_users(
        &self,
        community: CommunityId,
        users: &[UserId],
        options: &CountOptions,
    ) -> Result<BatchCountResult> {
        let mut unique: Vec<UserId> = users.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let mut result = BatchCountResult::default();
        if unique.is_empty() {
            return Ok(result);
        }

        if self.store_is_authoritative(community, options).await? {
            let totals = self
                .store
                .get_community_totals(community, &self.excluded_channels(community).await?)
                .await?;
            result.counts = unique
                .iter()
                .map(|user| (*user, totals.get(user).copied().unwrap_or(0)))
                .collect();
            result.cache = CacheUsage {
                hits: unique.len(),
                misses: 0,
                from_store: true,
            };
            return Ok(result);
        }

        let mut misses: Vec<UserId> = Vec::new();
        for user in &unique {
            let cached = if options.use_cache {
                self.cache
                    .get(&self.cache_key(community, *user, options.lookback_days))
                    .await?
            } else {
                None
            };
            match cached {
                Some(count) => {
                    result.counts.insert(*user, count);
                }
                None => misses.push(*user),
            }
        }
        result.cache.hits = unique.len() - misses.len();
        result.cache.misses = misses.len();
        if misses.is_empty() {
            debug!(community = %community, users = unique.len(), "Batch served from cache");
            return Ok(result);
        }

        let resolved = self.resolve_channels(community).await?;
        result.unreadable_channels = resolved.unreadable.clone();
        let miss_set: HashSet<UserId> = misses.iter().copied().collect();
        let cutoff = options.cutoff();
        let parallelism = options.parallelism.unwrap_or(self.parallelism).max(1);
        let total_channels = resolved.included.len();

        info!(
            community = %community,
            users = unique.len(),
            cache_hits = result.cache.hits,
            cache_misses = misses.len(),
            channels = total_channels,
            parallelism,
            "Starting channel-first batch count"
        );

        let mut tallies: HashMap<UserId, u64> = miss_set.iter().map(|u| (*u, 0)).collect();
        let miss_set_ref = &miss_set;
        let channel_futures: Vec<_> = resolved
            .included
            .iter()
            .map(|channel| async move {
                (channel, self.count_channel(channel, miss_set_ref, cutoff).await)
            })
            .collect();
        let mut pending = stream::iter(channel_futures).buffer_unordered(parallelism);

        let mut done = 0usize;
        while let Some((channel, outcome)) = pending.next().await {
            done += 1;
            match outcome {
                Ok(counts) => {
                    result.channels_scanned += 1;
                    for (user, count) in counts {
                        *tallies.entry(user).or_default() += count;
                    }
                }
                Err(err) => result.failed_channels.push(self.channel_failed(channel, &err)?),
            }
            notify(
                options.progress.as_ref(),
                &Progress {
                    label: channel.name.clone(),
                    current: estimated_users_done(result.cache.hits, misses.len(), done, total_channels),
                    total: unique.len(),
                },
            );
        }
        drop(pending);

        if result.failed_channels.is_empty() {
            for (user, count) in &tallies {
                self.cache
                    .set(&self.cache_key(community, *user, options.lookback_days), *count)
                    .await?;
            }
        } else {
            warn!(
                community = %community,
                failed = result.failed_channels.len(),
                "Some channels failed; batch results not cached"
            );
        }
        result.counts.extend(tallies);
        Ok(result)
    }

    // =========================================================================
    // Channel traversal
    // =========================================================================

    /// Walk one channel once, tallying messages from `users`.
    async fn count_channel(
        &self,
        channel: &ChannelInfo,
        users: &HashSet<UserId>,
        cutoff: Option<DateTime<Utc>>,
    ) -> std::result::Result<HashMap<UserId, u64>, SourceError> {
        let mut cursor = HistoryCursor::new(self.source.as_ref(), &self.policy, channel.id)
            .page_size(self.page_size)
            .not_before(cutoff);
        let mut counts: HashMap<UserId, u64> = HashMap::new();
        while let Some(page) = cursor.next_page().await? {
            for message in page {
                if !message.author_bot && users.contains(&message.author_id) {
                    *counts.entry(message.author_id).or_default() += 1;
                }
            }
        }
        Ok(counts)
    }

    /// Record a per-channel failure. Fatal source errors abort the count.
    fn channel_failed(&self, channel: &ChannelInfo, err: &SourceError) -> Result<ChannelFailure> {
        if err.kind() == ErrorKind::Fatal {
            return Err(err.clone().into());
        }
        warn!(channel = %channel.id, name = %channel.name, error = %err, "Skipping channel");
        Ok(ChannelFailure::new(channel, err))
    }
}

/// Users "done" for progress: hits plus the channel fraction of misses.
/// Approximate; for UI only.
fn estimated_users_done(hits: usize, misses: usize, channels_done: usize, channels_total: usize) -> usize {
    if channels_total == 0 {
        return hits + misses;
    }
    hits + (channels_done * misses) / channels_total
}
