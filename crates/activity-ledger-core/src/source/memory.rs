//! In-memory history source with fault injection.
//!
//! Used by tests and dry runs. Messages are assigned monotonically increasing
//! ids as they are added, so ids order like creation time when messages are
//! added oldest first.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::HistorySource;
use crate::error::SourceError;
use crate::model::{
    ChannelId, ChannelInfo, CommunityId, HistoryMessage, MemberSnapshot, MessageId, UserId,
};

#[derive(Default)]
struct State {
    channels: HashMap<CommunityId, Vec<ChannelInfo>>,
    archived: HashMap<ChannelId, Vec<ChannelInfo>>,
    /// Ascending by id.
    messages: HashMap<ChannelId, Vec<HistoryMessage>>,
    members: HashMap<CommunityId, Vec<MemberSnapshot>>,
    rate_limits: HashMap<ChannelId, (u32, Duration)>,
    server_errors: HashMap<ChannelId, u32>,
    forbidden: HashSet<ChannelId>,
    fail_list_channels: bool,
    fail_list_members: bool,
}

/// Scriptable [`HistorySource`] backed by plain collections.
pub struct MemorySource {
    state: Mutex<State>,
    next_id: AtomicU64,
    fetch_calls: AtomicUsize,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// Register a channel (or active thread) under a community.
    pub fn add_channel(&self, community: CommunityId, channel: ChannelInfo) {
        self.state
            .lock()
            .channels
            .entry(community)
            .or_default()
            .push(channel);
    }

    /// Register an archived thread under its parent channel.
    pub fn add_archived_thread(&self, thread: ChannelInfo) {
        let Some(parent) = thread.parent_id else {
            return;
        };
        self.state.lock().archived.entry(parent).or_default().push(thread);
    }

    /// Drop a channel from enumeration. Its history stays readable.
    pub fn remove_channel(&self, community: CommunityId, channel: ChannelId) {
        if let Some(channels) = self.state.lock().channels.get_mut(&community) {
            channels.retain(|c| c.id != channel);
        }
    }

    /// Append a message; returns its id.
    pub fn add_message(
        &self,
        channel: ChannelId,
        author: UserId,
        author_bot: bool,
        created_at: DateTime<Utc>,
    ) -> MessageId {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock();
        let messages = state.messages.entry(channel).or_default();
        messages.push(HistoryMessage {
            id,
            author_id: author,
            author_bot,
            created_at,
        });
        id
    }

    /// Append `count` messages by one author, one second apart, ending now.
    pub fn add_messages(&self, channel: ChannelId, author: UserId, count: usize) {
        let now = Utc::now() - chrono::Duration::seconds(1);
        for i in (0..count).rev() {
            let at = now - chrono::Duration::seconds(i as i64);
            self.add_message(channel, author, false, at);
        }
    }

    pub fn set_members(&self, community: CommunityId, members: Vec<MemberSnapshot>) {
        self.state.lock().members.insert(community, members);
    }

    /// Fail the next `times` history reads of `channel` with a rate limit.
    pub fn rate_limit_next(&self, channel: ChannelId, times: u32, retry_after: Duration) {
        self.state
            .lock()
            .rate_limits
            .insert(channel, (times, retry_after));
    }

    /// Fail the next `times` history reads of `channel` with a 503.
    pub fn server_error_next(&self, channel: ChannelId, times: u32) {
        self.state.lock().server_errors.insert(channel, times);
    }

    /// Every read of `channel` returns `Forbidden`.
    pub fn forbid(&self, channel: ChannelId) {
        self.state.lock().forbidden.insert(channel);
    }

    pub fn fail_list_channels(&self, fail: bool) {
        self.state.lock().fail_list_channels = fail;
    }

    pub fn fail_list_members(&self, fail: bool) {
        self.state.lock().fail_list_members = fail;
    }

    /// Number of `fetch_history` calls, failed ones included.
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn reset_fetch_calls(&self) {
        self.fetch_calls.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl HistorySource for MemorySource {
    async fn list_channels(&self, community: CommunityId) -> Result<Vec<ChannelInfo>, SourceError> {
        let state = self.state.lock();
        if state.fail_list_channels {
            return Err(SourceError::Server {
                status: 500,
                message: "channel listing unavailable".into(),
            });
        }
        Ok(state.channels.get(&community).cloned().unwrap_or_default())
    }

    async fn list_archived_threads(
        &self,
        _community: CommunityId,
        parent: &ChannelInfo,
    ) -> Result<Vec<ChannelInfo>, SourceError> {
        let state = self.state.lock();
        if state.forbidden.contains(&parent.id) {
            return Err(SourceError::Forbidden(format!("channel {}", parent.id)));
        }
        Ok(state.archived.get(&parent.id).cloned().unwrap_or_default())
    }

    async fn fetch_history(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, SourceError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();

        if state.forbidden.contains(&channel) {
            return Err(SourceError::Forbidden(format!("channel {channel}")));
        }
        if let Some((remaining, retry_after)) = state.rate_limits.get_mut(&channel) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SourceError::RateLimited {
                    retry_after: Some(*retry_after),
                    global: false,
                });
            }
        }
        if let Some(remaining) = state.server_errors.get_mut(&channel) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SourceError::Server {
                    status: 503,
                    message: "service unavailable".into(),
                });
            }
        }

        let Some(messages) = state.messages.get(&channel) else {
            return Ok(Vec::new());
        };
        let page = messages
            .iter()
            .rev()
            .filter(|m| before.is_none_or(|b| m.id < b))
            .take(limit)
            .cloned()
            .collect();
        Ok(page)
    }

    async fn list_members(&self, community: CommunityId) -> Result<Vec<MemberSnapshot>, SourceError> {
        let state = self.state.lock();
        if state.fail_list_members {
            return Err(SourceError::Network("member listing timed out".into()));
        }
        Ok(state.members.get(&community).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pages_are_newest_first() {
        let source = MemorySource::new();
        source.add_messages(ChannelId(5), UserId(1), 3);
        let page = source.fetch_history(ChannelId(5), None, 10).await.unwrap();
        assert_eq!(page.len(), 3);
        assert!(page[0].id > page[2].id);

        let older = source
            .fetch_history(ChannelId(5), Some(page[0].id), 10)
            .await
            .unwrap();
        assert_eq!(older.len(), 2);
    }

    #[tokio::test]
    async fn injected_faults_fire_then_clear() {
        let source = MemorySource::new();
        source.add_messages(ChannelId(5), UserId(1), 1);
        source.server_error_next(ChannelId(5), 1);
        assert!(source.fetch_history(ChannelId(5), None, 10).await.is_err());
        assert_eq!(source.fetch_history(ChannelId(5), None, 10).await.unwrap().len(), 1);
        assert_eq!(source.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn archived_threads_listed_by_parent() {
        let source = MemorySource::new();
        let parent = ChannelInfo::text(1, "general");
        source.add_channel(CommunityId(1), parent.clone());
        source.add_archived_thread(ChannelInfo::thread(2, "old", &parent, true));
        let threads = source
            .list_archived_threads(CommunityId(1), &parent)
            .await
            .unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].id, ChannelId(2));
    }
}
