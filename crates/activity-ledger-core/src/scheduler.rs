//! Daily and weekly audit cadence.
//!
//! Times of day are interpreted in UTC. When a daily and a weekly run fall on
//! the same instant only the weekly run fires; its larger sample covers the
//! daily one.

use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveTime, Utc, Weekday};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::auditor::{AuditKind, AuditResult, ConsistencyAuditor};
use crate::config::ScheduleConfig;
use crate::error::Result;

/// Parsed schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditSchedule {
    pub daily_at: NaiveTime,
    pub weekly_on: Weekday,
    pub weekly_at: NaiveTime,
}

impl AuditSchedule {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        Ok(Self {
            daily_at: config.daily_at()?,
            weekly_on: config.weekly_weekday()?,
            weekly_at: config.weekly_at()?,
        })
    }

    /// First daily slot strictly after `now`.
    #[must_use]
    pub fn next_daily(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.daily_at).and_utc();
        if today > now {
            today
        } else {
            today + Days::new(1)
        }
    }

    /// First weekly slot strictly after `now`.
    #[must_use]
    pub fn next_weekly(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ahead = (7 + self.weekly_on.num_days_from_monday()
            - now.weekday().num_days_from_monday())
            % 7;
        let candidate = (now.date_naive() + Days::new(u64::from(ahead)))
            .and_time(self.weekly_at)
            .and_utc();
        if candidate > now {
            candidate
        } else {
            candidate + Days::new(7)
        }
    }

    /// Next audit to run after `now` and when.
    #[must_use]
    pub fn next_run(&self, now: DateTime<Utc>) -> (AuditKind, DateTime<Utc>) {
        let daily = self.next_daily(now);
        let weekly = self.next_weekly(now);
        if weekly <= daily {
            (AuditKind::Weekly, weekly)
        } else {
            (AuditKind::Daily, daily)
        }
    }
}

/// Drives scheduled audits until shut down.
pub struct AuditScheduler {
    auditor: ConsistencyAuditor,
    schedule: AuditSchedule,
}

impl AuditScheduler {
    #[must_use]
    pub fn new(auditor: ConsistencyAuditor, schedule: AuditSchedule) -> Self {
        Self { auditor, schedule }
    }

    #[must_use]
    pub fn schedule(&self) -> &AuditSchedule {
        &self.schedule
    }

    /// Run one scheduled audit pass immediately, outside the cadence.
    pub async fn run_now(&self, kind: AuditKind) -> Result<Vec<AuditResult>> {
        self.auditor.run_scheduled(kind).await
    }

    /// Sleep until each slot and audit every eligible community. Returns when
    /// `shutdown` flips or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let now = Utc::now();
            let (kind, at) = self.schedule.next_run(now);
            let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
            info!(audit_kind = %kind, next_run = %at, "Next scheduled audit");

            tokio::select! {
                () = tokio::time::sleep(wait) => {
                    match self.run_now(kind).await {
                        Ok(results) => {
                            let failed = results.iter().filter(|r| !r.passed).count();
                            info!(
                                audit_kind = %kind,
                                communities = results.len(),
                                failed,
                                "Scheduled audit pass finished"
                            );
                        }
                        Err(err) => warn!(audit_kind = %kind, error = %err, "Scheduled audit pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Audit scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}
