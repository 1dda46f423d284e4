//! Progress callbacks for long-running ledger operations.
//!
//! Callbacks feed logs and UIs only. A callback that errors or panics is
//! logged and otherwise ignored; it never aborts the operation reporting to it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::model::UserId;

/// Error type callbacks may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// `(label, current, total)` progress during backfill and counting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Channel name or user id the update refers to.
    pub label: String,
    pub current: usize,
    pub total: usize,
}

/// Per-user progress during an audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditProgress {
    pub processed: usize,
    pub total: usize,
    pub user: UserId,
    pub stored: u64,
    pub fresh: u64,
}

pub type ProgressCallback =
    Arc<dyn Fn(&Progress) -> Result<(), CallbackError> + Send + Sync>;

pub type AuditProgressCallback =
    Arc<dyn Fn(&AuditProgress) -> Result<(), CallbackError> + Send + Sync>;

/// Invoke an optional callback, swallowing errors and panics.
pub(crate) fn notify<T>(
    callback: Option<&Arc<dyn Fn(&T) -> Result<(), CallbackError> + Send + Sync>>,
    update: &T,
) where
    T: ?Sized,
{
    let Some(callback) = callback else {
        return;
    };
    match catch_unwind(AssertUnwindSafe(|| callback(update))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "Progress callback failed; continuing"),
        Err(_) => warn!("Progress callback panicked; continuing"),
    }
}
