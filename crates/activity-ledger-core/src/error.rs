//! Error types for activity-ledger-core.
//!
//! Every error maps to an [`ErrorKind`] that drives retry, skip or abort,
//! and most carry a [`Remediation`] the CLI prints under the message.

use std::fmt::Write;
use std::time::Duration;
use thiserror::Error;

/// What to do about an error, shown under the message in the CLI.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    pub summary: String,
    /// `(label, command)` pairs.
    pub commands: Vec<(String, String)>,
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push((label.into(), command.into()));
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut out = format!("To fix:\n  {}\n", self.summary);
        if !self.commands.is_empty() {
            out.push_str("  Commands:\n");
            for (label, command) in &self.commands {
                let _ = writeln!(out, "    - {label}: {command}");
            }
        }
        if !self.alternatives.is_empty() {
            out.push_str("  Alternatives:\n");
            for alt in &self.alternatives {
                let _ = writeln!(out, "    - {alt}");
            }
        }
        out
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used to decide between retry, skip and abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rate limits, 5xx responses, network hiccups. Retried with backoff.
    Transient,
    /// Forbidden or vanished resources. Skipped and recorded, never retried.
    Permission,
    /// Everything else. Propagates past the component boundary.
    Fatal,
}

/// Main error type for activity-ledger-core
#[derive(Error, Debug)]
pub enum Error {
    /// Aggregate store / cache database errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// External history source errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Backfill lifecycle errors
    #[error("Backfill error: {0}")]
    Backfill(#[from] BackfillError),

    /// Audit errors
    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task joins, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Classify this error for retry/skip/abort decisions.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Source(err) => err.kind(),
            _ => ErrorKind::Fatal,
        }
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Storage(err) => Some(err.remediation()),
            Self::Source(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Backfill(err) => Some(err.remediation()),
            Self::Audit(_) => Some(
                Remediation::new("Wait for the running audit to finish, then retry.")
                    .command("Recent audits", "aledger audits --community <id>"),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) | Self::Runtime(_) => None,
        }
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Database schema version ({current}) is newer than supported ({supported})")]
    SchemaTooNew { current: i32, supported: i32 },

    #[error("Invalid state transition: {0}")]
    InvalidState(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::from(err))
    }
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => Remediation::new(
                "Database operation failed. Check data directory permissions and retry.",
            )
            .alternative("Ensure no other process holds an exclusive lock on the ledger file."),
            Self::MigrationFailed(_) => {
                Remediation::new("Schema migration failed. Back up the ledger file and retry.")
            }
            Self::SchemaTooNew { current, supported } => Remediation::new(format!(
                "Ledger schema version {current} is newer than supported ({supported}). Upgrade aledger."
            )),
            Self::InvalidState(_) => Remediation::new("Inspect the backfill state and reset it if needed.")
                .command("Show stats", "aledger stats --community <id>")
                .command("Reset", "aledger reset --community <id>"),
        }
    }
}

/// Errors surfaced by an external history source.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("rate limited (retry after {retry_after:?}, global: {global})")]
    RateLimited {
        retry_after: Option<Duration>,
        global: bool,
    },

    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: check the bot token")]
    Unauthorized,

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl SourceError {
    /// Classify the error per the retry taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } | Self::Server { .. } | Self::Network(_) => {
                ErrorKind::Transient
            }
            Self::Forbidden(_) | Self::NotFound(_) => ErrorKind::Permission,
            Self::Unauthorized | Self::Decode(_) => ErrorKind::Fatal,
        }
    }

    /// Suggested wait carried by a rate-limit response.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::RateLimited { .. } | Self::Server { .. } | Self::Network(_) => {
                Remediation::new("The history source is throttling or unavailable. Retry later.")
            }
            Self::Forbidden(_) | Self::NotFound(_) => Remediation::new(
                "Grant the bot View Channel and Read Message History, or exclude the channel.",
            )
            .alternative("Add the channel id to ledger.excluded_channel_ids."),
            Self::Unauthorized => Remediation::new("Set a valid bot token.")
                .command("Check config", "aledger config show")
                .alternative("Export the token in the variable named by source.token_env."),
            Self::Decode(_) => Remediation::new(
                "The history source returned an unexpected payload. Check source.api_base.",
            ),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("environment variable {0} holding the bot token is not set")]
    MissingToken(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => {
                Remediation::new(format!("Create the config file or fix the path: {path}"))
                    .alternative("Run without --config to use built-in defaults.")
            }
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Check read permissions on {path}."))
            }
            Self::ParseFailed(_) | Self::SerializeFailed(_) => {
                Remediation::new("Fix the TOML syntax and retry.")
                    .command("Validate", "aledger config check")
            }
            Self::ValidationError(_) => Remediation::new("Correct the invalid setting.")
                .command("Validate", "aledger config check"),
            Self::MissingToken(var) => Remediation::new(format!("Export the bot token as {var}."))
                .alternative("Point source.token_env at the variable that holds it."),
        }
    }
}

/// Backfill lifecycle errors
#[derive(Error, Debug)]
pub enum BackfillError {
    #[error("backfill already completed for community {0}; reset it first")]
    AlreadyCompleted(u64),

    #[error("backfill already running for community {0}")]
    AlreadyRunning(u64),
}

impl BackfillError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::AlreadyCompleted(_) => {
                Remediation::new("Reset the backfill to re-import the full history.")
                    .command("Reset", "aledger reset --community <id>")
            }
            Self::AlreadyRunning(_) => Remediation::new(
                "Wait for the running backfill. If the process that started it crashed, reset it.",
            )
            .command("Show stats", "aledger stats --community <id>")
            .command("Reset", "aledger reset --community <id>"),
        }
    }
}

/// Audit errors
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("an audit run is already in progress")]
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_errors_classify_per_taxonomy() {
        let rate = SourceError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
            global: false,
        };
        assert_eq!(rate.kind(), ErrorKind::Transient);
        assert_eq!(rate.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(
            SourceError::Server {
                status: 502,
                message: "bad gateway".into()
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            SourceError::Forbidden("channel 1".into()).kind(),
            ErrorKind::Permission
        );
        assert_eq!(SourceError::Unauthorized.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn non_source_errors_are_fatal() {
        let err = Error::Storage(StorageError::Database("disk full".into()));
        assert_eq!(err.kind(), ErrorKind::Fatal);
        let err = Error::Source(SourceError::NotFound("channel".into()));
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[test]
    fn missing_token_names_the_variable() {
        let err = Error::from(ConfigError::MissingToken("DISCORD_TOKEN".into()));
        assert!(err.to_string().contains("DISCORD_TOKEN"));
        let text = err.remediation().unwrap().render_plain();
        assert!(text.contains("Export the bot token as DISCORD_TOKEN."));
        assert!(!text.contains("Commands:"));
    }

    #[test]
    fn remediation_renders_commands() {
        let text = BackfillError::AlreadyCompleted(7).remediation().render_plain();
        assert!(text.contains("To fix:"));
        assert!(text.contains("aledger reset"));
    }
}
