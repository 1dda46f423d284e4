//! Retry with exponential backoff for history-source reads.
//!
//! Transient failures (rate limits, 5xx, network) are retried on an explicit
//! backoff schedule; permission and fatal errors return immediately. The
//! schedule is a small state machine ([`Backoff`]) rather than an open loop,
//! so the number of attempts and every delay are observable and testable.
//!
//! When the source supplies a suggested wait (HTTP 429 `retry_after`), the
//! schedule is seeded from it and never waits less than the suggestion.
//! Otherwise delays follow `min(initial * 2^attempt, max_delay)`.
//!
//! ```rust,ignore
//! use activity_ledger_core::retry::{RetryPolicy, with_source_retry};
//!
//! let page = with_source_retry(&RetryPolicy::history(), "fetch_history", || {
//!     source.fetch_history(channel, before, 100)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{ErrorKind, SourceError};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry when the source gives no hint (default: 1s).
    pub initial_delay: Duration,
    /// Cap on computed delays (default: 300s). A larger source hint still wins.
    pub max_delay: Duration,
    /// Multiplier applied after each retry (default: 2.0).
    pub backoff_factor: f64,
    /// Random jitter as a fraction of the delay, added on top (default: 0.1).
    pub jitter_percent: f64,
    /// Maximum number of retries. `None` retries transient failures forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::history()
    }
}

impl RetryPolicy {
    /// Create a new retry policy with the specified parameters.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Policy for paginated history reads: 1s initial, 300s cap, unbounded.
    ///
    /// Partial backfill data is worse than a slow backfill, so transient
    /// failures are never abandoned.
    #[must_use]
    pub fn history() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: None,
        }
    }

    /// Millisecond-scale policy without jitter, for tests and local sources.
    #[must_use]
    pub fn immediate(max_attempts: Option<u32>) -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts,
        }
    }

    /// Delay for a given retry number (0-indexed), optionally seeded by a
    /// source-suggested wait.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let seed_ms = hint.map_or_else(
            || u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX),
            |h| u64::try_from(h.as_millis()).unwrap_or(u64::MAX),
        );
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // 31 doublings is already far past any sane cap
        let exp = attempt.min(31) as i32;
        let base_ms = (seed_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 {
            let mut rng = rand::rng();
            rng.random_range(0.0..=base_ms * self.jitter_percent)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0) as u64;
        // Never undercut what the source asked for
        Duration::from_millis(delay_ms.max(hint.map_or(0, |_| seed_ms)))
    }
}

/// Next move of the backoff state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Sleep for the given delay, then retry.
    Retry(Duration),
    /// The attempt budget is exhausted.
    GiveUp,
}

/// Explicit retry schedule for one operation.
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    retries: u32,
}

impl<'a> Backoff<'a> {
    #[must_use]
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    /// Number of retries scheduled so far.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Advance after a transient failure.
    pub fn next_step(&mut self, hint: Option<Duration>) -> BackoffStep {
        if let Some(max) = self.policy.max_attempts {
            if self.retries >= max {
                return BackoffStep::GiveUp;
            }
        }
        let delay = self.policy.delay_for_attempt(self.retries, hint);
        self.retries = self.retries.saturating_add(1);
        BackoffStep::Retry(delay)
    }
}

/// Run a source operation, retrying transient failures per `policy`.
///
/// Permission and fatal errors are returned on first occurrence. A transient
/// error is returned only when the policy's attempt budget runs out.
pub async fn with_source_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut backoff = Backoff::new(policy);

    loop {
        match operation().await {
            Ok(value) => {
                if backoff.retries() > 0 {
                    debug!(
                        operation = operation_name,
                        retries = backoff.retries(),
                        "Operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(err) if err.kind() == ErrorKind::Transient => {
                match backoff.next_step(err.retry_after()) {
                    BackoffStep::Retry(delay) => {
                        if matches!(err, SourceError::RateLimited { .. }) {
                            debug!(
                                operation = operation_name,
                                attempt = backoff.retries(),
                                delay_ms = delay.as_millis() as u64,
                                "Rate limited, backing off"
                            );
                        } else {
                            warn!(
                                operation = operation_name,
                                attempt = backoff.retries(),
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "Transient source failure, retrying"
                            );
                        }
                        tokio::time::sleep(delay).await;
                    }
                    BackoffStep::GiveUp => {
                        warn!(
                            operation = operation_name,
                            retries = backoff.retries(),
                            error = %err,
                            "Giving up after exhausting retry budget"
                        );
                        return Err(err);
                    }
                }
            }
            Err(err) => return Err(err),
        }
    }
}
