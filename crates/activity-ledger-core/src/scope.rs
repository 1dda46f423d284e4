//! Which channels count.
//!
//! Shared by the counting engine, the backfill pipeline and the auditor so
//! every path sees the same channel set for the same configuration.

use std::collections::{BTreeSet, HashSet};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::LedgerConfig;
use crate::error::{ErrorKind, SourceError};
use crate::model::{ChannelId, ChannelInfo, CommunityId};
use crate::retry::{RetryPolicy, with_source_retry};
use crate::source::HistorySource;

/// Why a channel was left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    ById,
    ByName,
    Nsfw,
    NoHistory,
    NoPermission,
}

/// Exclusion rules for one community.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelScope {
    excluded_ids: BTreeSet<ChannelId>,
    /// Lowercased.
    name_patterns: Vec<String>,
    exclude_nsfw: bool,
}

/// Channels resolved for one run.
#[derive(Debug, Clone, Default)]
pub struct ResolvedChannels {
    /// Readable, in-scope channels and threads.
    pub included: Vec<ChannelInfo>,
    /// Every channel id the source still reports, in scope or not.
    pub known: HashSet<ChannelId>,
    /// In-scope channels skipped for lack of history access.
    pub unreadable: Vec<ChannelId>,
    /// Channels and threads left out by id, name or NSFW rules.
    pub excluded: Vec<ChannelId>,
}

impl ChannelScope {
    #[must_use]
    pub fn new(
        excluded_ids: impl IntoIterator<Item = ChannelId>,
        name_patterns: impl IntoIterator<Item = String>,
        exclude_nsfw: bool,
    ) -> Self {
        let mut name_patterns: Vec<String> = name_patterns
            .into_iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        name_patterns.sort();
        name_patterns.dedup();
        Self {
            excluded_ids: excluded_ids.into_iter().collect(),
            name_patterns,
            exclude_nsfw,
        }
    }

    #[must_use]
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(
            config.excluded_channel_ids.iter().copied().map(ChannelId),
            config.excluded_name_patterns.iter().cloned(),
            config.exclude_nsfw,
        )
    }

    /// Scope with no exclusions at all.
    #[must_use]
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// Explicitly excluded ids, for store-side total filtering.
    #[must_use]
    pub fn excluded_ids(&self) -> HashSet<ChannelId> {
        self.excluded_ids.iter().copied().collect()
    }

    #[must_use]
    pub fn is_excluded_id(&self, channel: ChannelId) -> bool {
        self.excluded_ids.contains(&channel)
    }

    /// Rule that excludes `channel`, if any. History access is not checked.
    #[must_use]
    pub fn exclusion(&self, channel: &ChannelInfo) -> Option<Exclusion> {
        let by_id = self.excluded_ids.contains(&channel.id)
            || channel
                .parent_id
                .is_some_and(|parent| self.excluded_ids.contains(&parent));
        if by_id {
            return Some(Exclusion::ById);
        }
        if self.exclude_nsfw && (channel.nsfw || channel.parent_nsfw) {
            return Some(Exclusion::Nsfw);
        }
        if !self.name_patterns.is_empty() {
            let name = channel.name.to_lowercase();
            let parent = channel.parent_name.as_deref().map(str::to_lowercase);
            let hit = self.name_patterns.iter().any(|pattern| {
                name.contains(pattern.as_str())
                    || parent.as_deref().is_some_and(|p| p.contains(pattern.as_str()))
            });
            if hit {
                return Some(Exclusion::ByName);
            }
        }
        if !channel.kind.has_history() {
            return Some(Exclusion::NoHistory);
        }
        if !channel.can_read_history {
            return Some(Exclusion::NoPermission);
        }
        None
    }

    #[must_use]
    pub fn includes(&self, channel: &ChannelInfo) -> bool {
        self.exclusion(channel).is_none()
    }

    /// Stable hash of the exclusion rules, used in cache keys.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"ids:");
        for id in &self.excluded_ids {
            hasher.update(id.get().to_le_bytes());
        }
        hasher.update(b"|names:");
        for pattern in &self.name_patterns {
            hasher.update(pattern.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(b"|nsfw:");
        hasher.update([u8::from(self.exclude_nsfw)]);
        hex::encode(hasher.finalize())
    }

    /// Enumerate in-scope channels and threads, archived threads included.
    ///
    /// Fails only when the channel list itself cannot be read. Archived
    /// thread listings that fail with a permission error are skipped.
    pub async fn resolve(
        &self,
        source: &dyn HistorySource,
        policy: &RetryPolicy,
        community: CommunityId,
    ) -> Result<ResolvedChannels, SourceError> {
        let channels = with_source_retry(policy, "list_channels", || source.list_channels(community)).await?;

        let mut resolved = ResolvedChannels::default();
        let mut seen: HashSet<ChannelId> = HashSet::new();
        let mut parents: Vec<ChannelInfo> = Vec::new();

        for channel in channels {
            resolved.known.insert(channel.id);
            // Threads of excluded parents are listed too so they get classified
            if channel.kind.can_have_threads() && self.exclusion(&channel) != Some(Exclusion::NoPermission) {
                parents.push(channel.clone());
            }
            self.admit(channel, &mut seen, &mut resolved);
        }

        for parent in &parents {
            let threads = match with_source_retry(policy, "list_archived_threads", || {
                source.list_archived_threads(community, parent)
            })
            .await
            {
                Ok(threads) => threads,
                Err(err) if err.kind() == ErrorKind::Permission => {
                    warn!(channel = %parent.id, error = %err, "Cannot list archived threads; skipping");
                    continue;
                }
                Err(err) => return Err(err),
            };
            for thread in threads {
                resolved.known.insert(thread.id);
                self.admit(thread, &mut seen, &mut resolved);
            }
        }

        debug!(
            community = %community,
            included = resolved.included.len(),
            known = resolved.known.len(),
            unreadable = resolved.unreadable.len(),
            excluded = resolved.excluded.len(),
            "Resolved channel scope"
        );
        Ok(resolved)
    }

    fn admit(&self, channel: ChannelInfo, seen: &mut HashSet<ChannelId>, resolved: &mut ResolvedChannels) {
        if !seen.insert(channel.id) {
            return;
        }
        match self.exclusion(&channel) {
            None => resolved.included.push(channel),
            Some(Exclusion::NoPermission) => {
                warn!(channel = %channel.id, name = %channel.name, "No history access; skipping channel");
                resolved.unreadable.push(channel.id);
            }
            Some(Exclusion::ById | Exclusion::ByName | Exclusion::Nsfw) => resolved.excluded.push(channel.id),
            Some(Exclusion::NoHistory) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelKind, UserId};
    use crate::source::memory::MemorySource;

    fn scope() -> ChannelScope {
        ChannelScope::new([ChannelId(99)], ["Bot-Spam".to_string()], true)
    }

    #[test]
    fn excludes_by_id_and_parent_id() {
        let scope = scope();
        assert_eq!(scope.exclusion(&ChannelInfo::text(99, "x")), Some(Exclusion::ById));
        let parent = ChannelInfo::text(99, "x");
        let thread = ChannelInfo::thread(5, "t", &parent, false);
        assert_eq!(scope.exclusion(&thread), Some(Exclusion::ById));
    }

    #[test]
    fn name_patterns_are_case_insensitive_and_check_parent() {
        let scope = scope();
        assert_eq!(
            scope.exclusion(&ChannelInfo::text(1, "the-BOT-SPAM-room")),
            Some(Exclusion::ByName)
        );
        let mut category = ChannelInfo::text(2, "Bot-Spam Zone");
        category.kind = ChannelKind::Category;
        let child = ChannelInfo::text(3, "general").with_parent(&category);
        assert_eq!(scope.exclusion(&child), Some(Exclusion::ByName));
        assert!(scope.includes(&ChannelInfo::text(4, "general")));
    }

    #[test]
    fn nsfw_checks_channel_and_parent() {
        let scope = scope();
        let mut parent = ChannelInfo::text(1, "after-dark");
        parent.nsfw = true;
        assert_eq!(scope.exclusion(&parent), Some(Exclusion::Nsfw));
        let child = ChannelInfo::text(2, "chat").with_parent(&parent);
        assert_eq!(scope.exclusion(&child), Some(Exclusion::Nsfw));
        assert!(ChannelScope::unrestricted().includes(&child));
    }

    #[test]
    fn fingerprint_ignores_order_and_case() {
        let a = ChannelScope::new([ChannelId(2), ChannelId(1)], ["Logs".into(), "spam".into()], true);
        let b = ChannelScope::new([ChannelId(1), ChannelId(2)], ["SPAM".into(), "logs".into()], true);
        let c = ChannelScope::new([ChannelId(1)], ["spam".into(), "logs".into()], true);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[tokio::test]
    async fn resolve_includes_archived_threads_and_skips_unreadable() {
        let source = MemorySource::new();
        let community = CommunityId(1);
        let general = ChannelInfo::text(1, "general");
        let mut locked = ChannelInfo::text(2, "staff");
        locked.can_read_history = false;
        let mut forum = ChannelInfo::text(3, "help");
        forum.kind = ChannelKind::Forum;
        source.add_channel(community, general.clone());
        source.add_channel(community, locked);
        source.add_channel(community, forum.clone());
        source.add_archived_thread(ChannelInfo::thread(10, "old", &general, true));
        source.add_archived_thread(ChannelInfo::thread(11, "question", &forum, true));
        source.add_messages(ChannelId(10), UserId(1), 1);

        let resolved = ChannelScope::unrestricted()
            .resolve(&source, &RetryPolicy::immediate(None), community)
            .await
            .unwrap();

        let mut ids: Vec<u64> = resolved.included.iter().map(|c| c.id.get()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 10, 11]);
        assert_eq!(resolved.unreadable, vec![ChannelId(2)]);
        assert_eq!(resolved.known.len(), 5);
    }

    #[tokio::test]
    async fn resolve_reports_rule_exclusions_with_their_threads() {
        let source = MemorySource::new();
        let community = CommunityId(1);
        let spam = ChannelInfo::text(1, "bot-spam");
        let mut lewd = ChannelInfo::text(2, "after-dark");
        lewd.nsfw = true;
        let banned = ChannelInfo::text(99, "quiet");
        let mut locked = ChannelInfo::text(4, "staff");
        locked.can_read_history = false;
        source.add_channel(community, spam.clone());
        source.add_channel(community, lewd);
        source.add_channel(community, banned.clone());
        source.add_channel(community, locked);
        source.add_channel(community, ChannelInfo::text(5, "general"));
        source.add_archived_thread(ChannelInfo::thread(20, "old", &banned, true));
        source.add_archived_thread(ChannelInfo::thread(21, "older", &spam, true));

        let resolved = scope()
            .resolve(&source, &RetryPolicy::immediate(None), community)
            .await
            .unwrap();

        let mut excluded: Vec<u64> = resolved.excluded.iter().map(|c| c.get()).collect();
        excluded.sort_unstable();
        assert_eq!(excluded, vec![1, 2, 20, 21, 99]);
        assert_eq!(resolved.unreadable, vec![ChannelId(4)]);
        assert_eq!(resolved.included.len(), 1);
        assert!(scope().is_excluded_id(ChannelId(99)));
        assert!(!scope().is_excluded_id(ChannelId(1)));
    }

    #[tokio::test]
    async fn resolve_fails_when_listing_fails() {
        let source = MemorySource::new();
        source.fail_list_channels(true);
        let result = ChannelScope::unrestricted()
            .resolve(&source, &RetryPolicy::immediate(Some(1)), CommunityId(1))
            .await;
        assert!(result.is_err());
    }
}
