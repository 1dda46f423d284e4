//! Configuration for the activity ledger (`activity-ledger.toml`).
//!
//! Every section has usable defaults, so a missing file is not an error
//! unless a path was given explicitly.
//!
//! ```toml
//! [ledger]
//! cache_ttl_secs = 3600
//! excluded_channel_ids = [123456789012345678]
//! excluded_name_patterns = ["bot-spam", "logs"]
//! parallelism = 5
//!
//! [schedule]
//! daily_time = "04:00"
//! weekly_day = "sun"
//! weekly_time = "05:00"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::logging::LogConfig;
use crate::retry::RetryPolicy;

/// Environment variable that points at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "ACTIVITY_LEDGER_CONFIG";

/// File name searched in the working directory and the platform config dir.
pub const CONFIG_FILE_NAME: &str = "activity-ledger.toml";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ledger: LedgerConfig,
    pub schedule: ScheduleConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
    pub logging: LogConfig,
    pub source: SourceConfig,
}

/// Counting, backfill and audit tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    /// Cache entry lifetime. `None` or `0` means entries never expire.
    pub cache_ttl_secs: Option<u64>,
    /// Channels never counted, by id.
    pub excluded_channel_ids: Vec<u64>,
    /// Case-insensitive substrings matched against channel and parent names.
    pub excluded_name_patterns: Vec<String>,
    /// Skip channels flagged NSFW (or whose parent is).
    pub exclude_nsfw: bool,
    /// Messages accumulated in memory before a backfill flush.
    pub backfill_flush_threshold: usize,
    /// Channels traversed concurrently by batch counting.
    pub parallelism: usize,
    /// Relative difference (percent) under which a sampled user matches.
    pub audit_tolerance_percent: f64,
    /// Accuracy (percent) an audit needs to pass.
    pub audit_pass_percent: f64,
    /// Users below this stored total are never sampled.
    pub audit_min_messages: u64,
    pub daily_sample_size: usize,
    pub weekly_sample_size: usize,
    /// Age after which a persisted `running` backfill is reported stale.
    pub backfill_stale_after_hours: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: None,
            excluded_channel_ids: Vec::new(),
            excluded_name_patterns: Vec::new(),
            exclude_nsfw: true,
            backfill_flush_threshold: 5_000,
            parallelism: 5,
            audit_tolerance_percent: 1.0,
            audit_pass_percent: 95.0,
            audit_min_messages: 10,
            daily_sample_size: 25,
            weekly_sample_size: 150,
            backfill_stale_after_hours: 24,
        }
    }
}

impl LedgerConfig {
    /// Effective cache TTL (`None` when entries never expire).
    #[must_use]
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    #[must_use]
    pub fn backfill_stale_after(&self) -> Duration {
        Duration::from_secs(self.backfill_stale_after_hours.saturating_mul(3_600))
    }
}

/// Audit cadence. Times are `HH:MM` in UTC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub daily_time: String,
    pub weekly_day: String,
    pub weekly_time: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_time: "04:00".to_string(),
            weekly_day: "sun".to_string(),
            weekly_time: "05:00".to_string(),
        }
    }
}

impl ScheduleConfig {
    pub fn daily_at(&self) -> std::result::Result<NaiveTime, ConfigError> {
        parse_time_of_day("schedule.daily_time", &self.daily_time)
    }

    pub fn weekly_at(&self) -> std::result::Result<NaiveTime, ConfigError> {
        parse_time_of_day("schedule.weekly_time", &self.weekly_time)
    }

    pub fn weekly_weekday(&self) -> std::result::Result<Weekday, ConfigError> {
        self.weekly_day.parse::<Weekday>().map_err(|_| {
            ConfigError::ValidationError(format!(
                "schedule.weekly_day: unknown weekday {:?}",
                self.weekly_day
            ))
        })
    }
}

fn parse_time_of_day(field: &str, value: &str) -> std::result::Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|e| {
        ConfigError::ValidationError(format!("{field}: expected HH:MM, got {value:?} ({e})"))
    })
}

/// Backoff settings for transient history-source failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_secs: u64,
    pub jitter_percent: f64,
    /// `None` retries transient failures until they clear.
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_secs: 300,
            jitter_percent: 0.1,
            max_attempts: None,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_secs(self.max_delay_secs),
            2.0,
            self.jitter_percent,
            self.max_attempts,
        )
    }
}

/// Where the ledger and cache databases live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
    pub ledger_file: String,
    pub cache_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            ledger_file: "ledger.db".to_string(),
            cache_file: "count_cache.db".to_string(),
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("activity-ledger")
        })
    }

    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.resolved_data_dir().join(&self.ledger_file)
    }

    #[must_use]
    pub fn cache_path(&self) -> PathBuf {
        self.resolved_data_dir().join(&self.cache_file)
    }
}

/// Remote history source (Discord REST API).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourceConfig {
    pub api_base: String,
    /// Name of the environment variable holding the bot token.
    pub token_env: String,
    /// Messages per history page (max 100).
    pub page_size: usize,
    /// Members per member-list page (max 1000).
    pub member_page_size: usize,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_base: "https://discord.com/api/v10".to_string(),
            token_env: "DISCORD_TOKEN".to_string(),
            page_size: 100,
            member_page_size: 1_000,
            user_agent: format!("DiscordBot (activity-ledger, {})", crate::VERSION),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load from the resolved path, falling back to defaults when none exists.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match resolve_config_path(None) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }

    /// Reject settings that would make the ledger misbehave.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let ledger = &self.ledger;
        if ledger.parallelism == 0 {
            return Err(ConfigError::ValidationError(
                "ledger.parallelism must be at least 1".into(),
            ));
        }
        if ledger.backfill_flush_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "ledger.backfill_flush_threshold must be at least 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&ledger.audit_tolerance_percent) {
            return Err(ConfigError::ValidationError(format!(
                "ledger.audit_tolerance_percent must be within 0..=100, got {}",
                ledger.audit_tolerance_percent
            )));
        }
        if !(0.0..=100.0).contains(&ledger.audit_pass_percent) {
            return Err(ConfigError::ValidationError(format!(
                "ledger.audit_pass_percent must be within 0..=100, got {}",
                ledger.audit_pass_percent
            )));
        }
        if ledger
            .excluded_name_patterns
            .iter()
            .any(|p| p.trim().is_empty())
        {
            return Err(ConfigError::ValidationError(
                "ledger.excluded_name_patterns must not contain empty patterns".into(),
            ));
        }
        if self.source.page_size == 0 || self.source.page_size > 100 {
            return Err(ConfigError::ValidationError(format!(
                "source.page_size must be within 1..=100, got {}",
                self.source.page_size
            )));
        }
        if self.source.member_page_size == 0 || self.source.member_page_size > 1_000 {
            return Err(ConfigError::ValidationError(format!(
                "source.member_page_size must be within 1..=1000, got {}",
                self.source.member_page_size
            )));
        }
        if self.retry.max_delay_secs == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_delay_secs must be at least 1".into(),
            ));
        }
        self.schedule.daily_at()?;
        self.schedule.weekly_at()?;
        self.schedule.weekly_weekday()?;
        Ok(())
    }
}

/// Find the config file: explicit path, then `$ACTIVITY_LEDGER_CONFIG`,
/// then `./activity-ledger.toml`, then the platform config dir.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }

    let global = dirs::config_dir()?.join("activity-ledger").join(CONFIG_FILE_NAME);
    global.exists().then_some(global)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.ledger.backfill_flush_threshold, 5_000);
        assert_eq!(config.ledger.parallelism, 5);
        assert!((config.ledger.audit_tolerance_percent - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.ledger.daily_sample_size, 25);
        assert_eq!(config.ledger.weekly_sample_size, 150);
        assert_eq!(config.ledger.cache_ttl(), None);
    }

    #[test]
    fn zero_ttl_means_no_expiry() {
        let ledger = LedgerConfig {
            cache_ttl_secs: Some(0),
            ..LedgerConfig::default()
        };
        assert_eq!(ledger.cache_ttl(), None);
    }

    #[test]
    fn parses_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [ledger]
            cache_ttl_secs = 600
            excluded_channel_ids = [42]
            excluded_name_patterns = ["Mod-Log"]
            parallelism = 3

            [schedule]
            weekly_day = "wed"
            "#,
        )
        .unwrap();
        assert_eq!(config.ledger.cache_ttl(), Some(Duration::from_secs(600)));
        assert_eq!(config.ledger.excluded_channel_ids, vec![42]);
        assert_eq!(config.ledger.parallelism, 3);
        assert_eq!(config.ledger.backfill_flush_threshold, 5_000);
        assert_eq!(config.schedule.weekly_weekday().unwrap(), Weekday::Wed);
    }

    #[test]
    fn rejects_zero_parallelism() {
        let err = Config::from_toml_str("[ledger]\nparallelism = 0\n").unwrap_err();
        assert!(err.to_string().contains("parallelism"));
    }

    #[test]
    fn rejects_bad_time_of_day() {
        let err = Config::from_toml_str("[schedule]\ndaily_time = \"25:99\"\n").unwrap_err();
        assert!(err.to_string().contains("daily_time"));
    }

    #[test]
    fn toml_roundtrip_preserves_settings() {
        let mut config = Config::default();
        config.ledger.excluded_name_patterns = vec!["spam".into()];
        config.retry.max_attempts = Some(4);
        let text = config.to_toml_string().unwrap();
        let parsed = Config::from_toml_str(&text).unwrap();
        assert_eq!(parsed.ledger, config.ledger);
        assert_eq!(parsed.retry, config.retry);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
