//! Structured logging setup.
//!
//! Everything goes to stderr so `--format json` output on stdout stays
//! parseable. An optional file sink receives the same events without ANSI
//! colors.
//!
//! Spans and events use these field names:
//! - `community`, `user`, `channel`: snowflake ids as integers
//! - `run_id`: backfill run identifier
//! - `audit_kind`: daily, weekly or manual

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub use crate::config::LogFormat;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `activity_ledger_core::backfill=debug`.
    /// `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
    /// Append events to this file as well.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log filter {0:?}: {1}")]
    BadFilter(String, String),

    #[error("cannot open log file {0}: {1}")]
    File(String, std::io::Error),

    #[error("failed to install subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn filter(level: &str) -> Result<EnvFilter, LogError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| LogError::BadFilter(level.to_string(), e.to_string()))
}

/// Open (creating parents) the log file for appending. New files are
/// owner-only on unix since events carry user ids.
fn open_log_file(path: &Path) -> Result<File, LogError> {
    let err = |e| LogError::File(path.display().to_string(), e);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(err)?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(err)
}

fn stderr_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, file: File) -> BoxedLayer {
    match format {
        LogFormat::Pretty => fmt::layer().with_writer(file).with_ansi(false).boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_writer(file)
            .with_current_span(true)
            .flatten_event(true)
            .boxed(),
    }
}

/// Install the global subscriber. Only the first call in a process succeeds.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INSTALLED.load(Ordering::Acquire) {
        return Err(LogError::AlreadyInitialized);
    }

    let env_filter = filter(&config.level)?;
    let mut layers = vec![stderr_layer(config.format)];
    if let Some(path) = &config.file {
        layers.push(file_layer(config.format, open_log_file(path)?));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()?;
    INSTALLED.store(true, Ordering::Release);

    tracing::debug!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

/// `info_span!` with the ledger's correlation fields.
///
/// ```ignore
/// let span = activity_ledger_core::ledger_span!("backfill", community = 42u64);
/// ```
#[macro_export]
macro_rules! ledger_span {
    ($name:expr $(, $field:ident = $value:expr)* $(,)?) => {
        tracing::info_span!($name $(, $field = $value)*)
    };
}
