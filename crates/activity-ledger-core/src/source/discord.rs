//! Discord REST API history source.
//!
//! Only the read endpoints the ledger needs: guild channels, active and
//! archived threads, channel messages and guild members. Permission bits are
//! not computed locally; a channel the bot cannot read answers 403 and is
//! skipped by the caller.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, HeaderMap};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, trace};

use super::HistorySource;
use crate::config::SourceConfig;
use crate::error::{ConfigError, Result, SourceError};
use crate::model::{
    ChannelId, ChannelInfo, ChannelKind, CommunityId, HistoryMessage, MemberSnapshot, MessageId,
    UserId,
};

/// Archived-thread listings are capped at 100 per request.
const THREAD_PAGE_SIZE: usize = 100;

// =============================================================================
// Wire types
// =============================================================================

mod snowflake {
    use serde::{Deserialize, Deserializer, de::Error};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
            let raw: Option<String> = Option::deserialize(d)?;
            raw.map(|s| s.parse().map_err(D::Error::custom)).transpose()
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    #[serde(with = "snowflake")]
    id: u64,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, with = "snowflake::option")]
    parent_id: Option<u64>,
    #[serde(default)]
    nsfw: bool,
    #[serde(default)]
    thread_metadata: Option<RawThreadMetadata>,
}

#[derive(Debug, Deserialize)]
struct RawThreadMetadata {
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    archive_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawThreadList {
    threads: Vec<RawChannel>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    #[serde(with = "snowflake")]
    id: u64,
    #[serde(default)]
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(with = "snowflake")]
    id: u64,
    author: RawUser,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawMember {
    user: RawUser,
    #[serde(default)]
    nick: Option<String>,
    #[serde(default)]
    joined_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawRateLimit {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

fn channel_kind(code: u8) -> Option<ChannelKind> {
    Some(match code {
        0 => ChannelKind::Text,
        2 => ChannelKind::Voice,
        4 => ChannelKind::Category,
        5 => ChannelKind::Announcement,
        10 => ChannelKind::AnnouncementThread,
        11 => ChannelKind::PublicThread,
        12 => ChannelKind::PrivateThread,
        13 => ChannelKind::Stage,
        15 | 16 => ChannelKind::Forum,
        _ => return None,
    })
}

/// Convert raw channels, resolving parent names and NSFW flags from `known`.
fn convert_channels(raw: Vec<RawChannel>, known: &HashMap<u64, ChannelInfo>) -> Vec<ChannelInfo> {
    raw.into_iter()
        .filter_map(|c| {
            let kind = channel_kind(c.kind)?;
            let parent = c.parent_id.and_then(|id| known.get(&id));
            Some(ChannelInfo {
                id: ChannelId(c.id),
                name: c.name.unwrap_or_default(),
                kind,
                parent_id: c.parent_id.map(ChannelId),
                parent_name: parent.map(|p| p.name.clone()),
                nsfw: c.nsfw,
                parent_nsfw: parent.is_some_and(|p| p.nsfw || p.parent_nsfw),
                can_read_history: true,
                archived: c.thread_metadata.is_some_and(|m| m.archived),
            })
        })
        .collect()
}

/// Map a non-success response to the source error taxonomy.
fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> SourceError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let parsed: Option<RawRateLimit> = serde_json::from_str(body).ok();
            let header_wait = headers
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok());
            let retry_after = parsed
                .as_ref()
                .and_then(|p| p.retry_after)
                .or(header_wait)
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64);
            SourceError::RateLimited {
                retry_after,
                global: parsed.is_some_and(|p| p.global),
            }
        }
        StatusCode::UNAUTHORIZED => SourceError::Unauthorized,
        StatusCode::FORBIDDEN => SourceError::Forbidden(truncate(body)),
        StatusCode::NOT_FOUND => SourceError::NotFound(truncate(body)),
        s if s.is_server_error() => SourceError::Server {
            status: s.as_u16(),
            message: truncate(body),
        },
        s => SourceError::Decode(format!("unexpected status {s}: {}", truncate(body))),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

// =============================================================================
// DiscordSource
// =============================================================================

/// [`HistorySource`] over the Discord REST API.
pub struct DiscordSource {
    client: Client,
    api_base: String,
    token: String,
    member_page_size: usize,
}

impl std::fmt::Debug for DiscordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordSource")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl DiscordSource {
    /// Build from config, reading the bot token from `token_env`.
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .map_err(|_| ConfigError::MissingToken(config.token_env.clone()))?;
        Self::new(config, token)
    }

    pub fn new(config: &SourceConfig, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SourceError::Network(e.to_string()))?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: token.into(),
            member_page_size: config.member_page_size,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<T, SourceError> {
        let url = format!("{}{path}", self.api_base);
        trace!(url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bot {}", self.token))
            .query(query)
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }

    async fn archived_threads(
        &self,
        parent: ChannelId,
        scope: &str,
    ) -> std::result::Result<Vec<RawChannel>, SourceError> {
        let mut threads = Vec::new();
        let mut before: Option<DateTime<Utc>> = None;
        loop {
            let mut query = vec![("limit", THREAD_PAGE_SIZE.to_string())];
            if let Some(ts) = before {
                query.push(("before", ts.to_rfc3339()));
            }
            let page: RawThreadList = self
                .get_json(&format!("/channels/{parent}/threads/archived/{scope}"), &query)
                .await?;
            let has_more = page.has_more;
            before = page
                .threads
                .iter()
                .filter_map(|t| t.thread_metadata.as_ref()?.archive_timestamp)
                .min();
            let fetched = page.threads.len();
            threads.extend(page.threads);
            if !has_more || fetched == 0 || before.is_none() {
                break;
            }
        }
        Ok(threads)
    }
}

#[async_trait]
impl HistorySource for DiscordSource {
    async fn list_channels(&self, community: CommunityId) -> std::result::Result<Vec<ChannelInfo>, SourceError> {
        let raw: Vec<RawChannel> = self
            .get_json(&format!("/guilds/{community}/channels"), &[])
            .await?;

        // Categories first so channels can resolve their parent names
        let (categories, rest): (Vec<_>, Vec<_>) = raw.into_iter().partition(|c| c.kind == 4);
        let mut known: HashMap<u64, ChannelInfo> = convert_channels(categories, &HashMap::new())
            .into_iter()
            .map(|c| (c.id.get(), c))
            .collect();
        let channels = convert_channels(rest, &known);
        for channel in &channels {
            known.insert(channel.id.get(), channel.clone());
        }

        #[derive(Deserialize)]
        struct ActiveThreads {
            threads: Vec<RawChannel>,
        }
        let active: ActiveThreads = self
            .get_json(&format!("/guilds/{community}/threads/active"), &[])
            .await?;
        let threads = convert_channels(active.threads, &known);

        let mut all: Vec<ChannelInfo> = known.into_values().filter(|c| c.kind == ChannelKind::Category).collect();
        all.extend(channels);
        all.extend(threads);
        debug!(community = %community, channels = all.len(), "Listed channels");
        Ok(all)
    }

    async fn list_archived_threads(
        &self,
        _community: CommunityId,
        parent: &ChannelInfo,
    ) -> std::result::Result<Vec<ChannelInfo>, SourceError> {
        let mut raw = self.archived_threads(parent.id, "public").await?;
        match self.archived_threads(parent.id, "private").await {
            Ok(private) => raw.extend(private),
            // Private archives need Manage Threads; public ones still count
            Err(SourceError::Forbidden(_)) => {
                debug!(channel = %parent.id, "No access to private archived threads");
            }
            Err(err) => return Err(err),
        }
        let known: HashMap<u64, ChannelInfo> = [(parent.id.get(), parent.clone())].into_iter().collect();
        Ok(convert_channels(raw, &known))
    }

    async fn fetch_history(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> std::result::Result<Vec<HistoryMessage>, SourceError> {
        let mut query = vec![("limit", limit.clamp(1, 100).to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }
        let raw: Vec<RawMessage> = self
            .get_json(&format!("/channels/{channel}/messages"), &query)
            .await?;
        Ok(raw
            .into_iter()
            .map(|m| HistoryMessage {
                id: MessageId(m.id),
                author_id: UserId(m.author.id),
                author_bot: m.author.bot,
                created_at: m.timestamp,
            })
            .collect())
    }

    async fn list_members(&self, community: CommunityId) -> std::result::Result<Vec<MemberSnapshot>, SourceError> {
        let mut members = Vec::new();
        let mut after = 0u64;
        loop {
            let query = [
                ("limit", self.member_page_size.to_string()),
                ("after", after.to_string()),
            ];
            let page: Vec<RawMember> = self
                .get_json(&format!("/guilds/{community}/members"), &query)
                .await?;
            let fetched = page.len();
            for raw in page {
                after = after.max(raw.user.id);
                let display_name = raw
                    .nick
                    .or(raw.user.global_name)
                    .unwrap_or(raw.user.username);
                members.push(MemberSnapshot {
                    user: UserId(raw.user.id),
                    display_name,
                    joined_at: raw.joined_at,
                    is_bot: raw.user.bot,
                    last_seen_at: None,
                });
            }
            if fetched < self.member_page_size {
                break;
            }
        }
        debug!(community = %community, members = members.len(), "Listed members");
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_body_wins_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "9".parse().unwrap());
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            &headers,
            r#"{"message":"You are being rate limited.","retry_after":1.5,"global":true}"#,
        );
        match err {
            SourceError::RateLimited { retry_after, global } => {
                assert_eq!(retry_after, Some(Duration::from_millis(1_500)));
                assert!(global);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rate_limit_falls_back_to_header() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "3".parse().unwrap());
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn statuses_map_to_taxonomy() {
        let headers = HeaderMap::new();
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, &headers, "Missing Access"),
            SourceError::Forbidden(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, &headers, "Unknown Channel"),
            SourceError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, &headers, ""),
            SourceError::Unauthorized
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &headers, ""),
            SourceError::Server { status: 502, .. }
        ));
    }

    #[test]
    fn channels_resolve_parent_category() {
        let raw: Vec<RawChannel> = serde_json::from_str(
            r#"[
                {"id": "10", "type": 4, "name": "Staff", "nsfw": false},
                {"id": "11", "type": 0, "name": "mod-chat", "parent_id": "10"},
                {"id": "12", "type": 2, "name": "Voice"},
                {"id": "13", "type": 99, "name": "unknown"}
            ]"#,
        )
        .unwrap();
        let (categories, rest): (Vec<_>, Vec<_>) = raw.into_iter().partition(|c| c.kind == 4);
        let known: HashMap<u64, ChannelInfo> = convert_channels(categories, &HashMap::new())
            .into_iter()
            .map(|c| (c.id.get(), c))
            .collect();
        let channels = convert_channels(rest, &known);
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].parent_name.as_deref(), Some("Staff"));
        assert_eq!(channels[1].kind, ChannelKind::Voice);
    }

    #[test]
    fn messages_decode_from_wire_format() {
        let raw: Vec<RawMessage> = serde_json::from_str(
            r#"[{"id": "1234567890123456789", "author": {"id": "42", "username": "ada", "bot": true},
                 "timestamp": "2024-03-01T12:00:00.000000+00:00", "content": "hi"}]"#,
        )
        .unwrap();
        assert_eq!(raw[0].id, 1_234_567_890_123_456_789);
        assert!(raw[0].author.bot);
        assert_eq!(raw[0].timestamp.timestamp(), 1_709_294_400);
    }
}
