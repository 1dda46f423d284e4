//! activity-ledger-core: per-community message activity accounting.
//!
//! Tracks how many messages each user has sent in each channel of a
//! community, answers count queries quickly, and keeps those answers honest.
//!
//! # Architecture
//!
//! ```text
//! live events ──► Ledger ──► LedgerStore (SQLite: counts, backfill state, members, audits)
//!                   │              ▲
//!                   ├──► BackfillPipeline ──┐
//!                   ├──► CountingEngine ────┼──► HistorySource (Discord REST / in-memory)
//!                   │        └──► CountCache (separate SQLite file)
//!                   └──► ConsistencyAuditor ◄── AuditScheduler
//! ```
//!
//! # Modules
//!
//! - `storage`: aggregate store of per-(community, user, channel) counters
//! - `cache`: read-through cache keyed by query shape
//! - `counting`: single-user and channel-first batch counting
//! - `backfill`: one-time history import with a durable lifecycle
//! - `auditor`: sampled recount vs. store comparison
//! - `scheduler`: daily/weekly audit cadence
//! - `scope`: channel exclusion rules and channel enumeration
//! - `source`: history source trait, Discord client, in-memory fixture
//! - `sampling`: reservoir sampling of audit candidates
//! - `retry`: bounded backoff for transient source failures
//! - `ledger`: the facade wiring everything together
//! - `config`, `logging`, `error`, `progress`, `model`: shared plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod auditor;
pub mod backfill;
pub mod cache;
pub mod config;
pub mod counting;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod progress;
pub mod retry;
pub mod sampling;
pub mod scheduler;
pub mod scope;
pub mod source;
pub mod storage;

pub use error::{Error, Result};
pub use ledger::Ledger;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
