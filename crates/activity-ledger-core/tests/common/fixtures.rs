//! Test fixtures: ledgers over the in-memory history source, plus source
//! wrappers that simulate a process dying mid-run.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use activity_ledger_core::Ledger;
use activity_ledger_core::cache::CountCache;
use activity_ledger_core::config::LedgerConfig;
use activity_ledger_core::error::SourceError;
use activity_ledger_core::model::{
    ChannelId, ChannelInfo, CommunityId, HistoryMessage, MemberSnapshot, MessageId,
};
use activity_ledger_core::retry::RetryPolicy;
use activity_ledger_core::source::HistorySource;
use activity_ledger_core::source::memory::MemorySource;
use activity_ledger_core::storage::LedgerStore;

pub const COMMUNITY: CommunityId = CommunityId(4_242);

/// Ledger over fresh in-memory databases, retrying without sleeping.
pub fn ledger_over(source: Arc<dyn HistorySource>, config: &LedgerConfig, page_size: usize) -> Ledger {
    Ledger::assemble(
        LedgerStore::open_in_memory().unwrap(),
        CountCache::open_in_memory(config.cache_ttl()).unwrap(),
        source,
        config,
        RetryPolicy::immediate(Some(5)),
        page_size,
    )
}

/// Memory source plus a ledger reading from it.
pub fn memory_ledger(config: &LedgerConfig) -> (Arc<MemorySource>, Ledger) {
    let source = Arc::new(MemorySource::new());
    let ledger = ledger_over(source.clone(), config, 100);
    (source, ledger)
}

/// Delegates to a [`MemorySource`] and panics on the N-th history fetch,
/// the way a killed process stops mid-walk.
pub struct PanicAfter {
    inner: Arc<MemorySource>,
    fetches_allowed: usize,
    fetches: AtomicUsize,
}

impl PanicAfter {
    pub fn new(inner: Arc<MemorySource>, fetches_allowed: usize) -> Self {
        Self {
            inner,
            fetches_allowed,
            fetches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl HistorySource for PanicAfter {
    async fn list_channels(&self, community: CommunityId) -> Result<Vec<ChannelInfo>, SourceError> {
        self.inner.list_channels(community).await
    }

    async fn list_archived_threads(
        &self,
        community: CommunityId,
        parent: &ChannelInfo,
    ) -> Result<Vec<ChannelInfo>, SourceError> {
        self.inner.list_archived_threads(community, parent).await
    }

    async fn fetch_history(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, SourceError> {
        let call = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(call <= self.fetches_allowed, "simulated crash on fetch {call}");
        self.inner.fetch_history(channel, before, limit).await
    }

    async fn list_members(&self, community: CommunityId) -> Result<Vec<MemberSnapshot>, SourceError> {
        self.inner.list_members(community).await
    }
}
