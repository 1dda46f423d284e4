//! External history source: the remote, rate-limited, paginated API that
//! holds authoritative message history.
//!
//! History pages are reverse-chronological. [`HistoryCursor`] walks one
//! channel from newest to oldest, wrapping every page read in the retry
//! policy so callers only ever see permission or fatal failures (or a
//! transient one once a bounded policy gives up).

pub mod discord;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SourceError;
use crate::model::{ChannelId, ChannelInfo, CommunityId, HistoryMessage, MemberSnapshot, MessageId};
use crate::retry::{RetryPolicy, with_source_retry};

/// Largest page most sources hand out.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Read access to a community's channels, history and members.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Channels of a community, including active threads.
    async fn list_channels(&self, community: CommunityId) -> Result<Vec<ChannelInfo>, SourceError>;

    /// Archived threads (public and private) under `parent`.
    async fn list_archived_threads(
        &self,
        community: CommunityId,
        parent: &ChannelInfo,
    ) -> Result<Vec<ChannelInfo>, SourceError>;

    /// One page of history, newest first, strictly older than `before`.
    async fn fetch_history(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, SourceError>;

    /// Current members of a community.
    async fn list_members(&self, community: CommunityId) -> Result<Vec<MemberSnapshot>, SourceError>;
}

/// Walks one channel's history newest to oldest, a page at a time.
pub struct HistoryCursor<'a> {
    source: &'a dyn HistorySource,
    policy: &'a RetryPolicy,
    channel: ChannelId,
    page_size: usize,
    not_before: Option<DateTime<Utc>>,
    before: Option<MessageId>,
    pages: usize,
    done: bool,
}

impl<'a> HistoryCursor<'a> {
    #[must_use]
    pub fn new(source: &'a dyn HistorySource, policy: &'a RetryPolicy, channel: ChannelId) -> Self {
        Self {
            source,
            policy,
            channel,
            page_size: DEFAULT_PAGE_SIZE,
            not_before: None,
            before: None,
            pages: 0,
            done: false,
        }
    }

    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Stop once history older than `cutoff` is reached.
    #[must_use]
    pub fn not_before(mut self, cutoff: Option<DateTime<Utc>>) -> Self {
        self.not_before = cutoff;
        self
    }

    /// Pages fetched so far.
    #[must_use]
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Next page, filtered to the cutoff. `None` once history is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<HistoryMessage>>, SourceError> {
        if self.done {
            return Ok(None);
        }

        let (source, channel, before, limit) = (self.source, self.channel, self.before, self.page_size);
        let mut page = with_source_retry(self.policy, "fetch_history", || {
            source.fetch_history(channel, before, limit)
        })
        .await?;
        self.pages += 1;

        if page.is_empty() {
            self.done = true;
            return Ok(None);
        }
        if page.len() < self.page_size {
            self.done = true;
        }
        // Oldest id on the page becomes the next cursor
        self.before = page.iter().map(|m| m.id).min();

        if let Some(cutoff) = self.not_before {
            let reached_cutoff = page.iter().any(|m| m.created_at < cutoff);
            if reached_cutoff {
                page.retain(|m| m.created_at >= cutoff);
                self.done = true;
            }
        }
        Ok(Some(page))
    }
}
