//! Plain and JSON rendering of command results.

use std::fmt::Write as _;

use clap::ValueEnum;
use serde::Serialize;

use activity_ledger_core::auditor::AuditResult;
use activity_ledger_core::backfill::{BackfillReport, ResetReport};
use activity_ledger_core::cache::CacheStats;
use activity_ledger_core::counting::{BatchCountResult, UserCount};
use activity_ledger_core::model::{ChannelFailure, UserId};
use activity_ledger_core::storage::{ChannelCount, LedgerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Plain,
    /// One JSON document per result
    Json,
}

/// A result with a human-readable rendering; JSON comes from `Serialize`.
pub trait Render: Serialize {
    fn plain(&self) -> String;

    fn render(&self, format: OutputFormat) -> anyhow::Result<()> {
        match format {
            OutputFormat::Plain => print!("{}", self.plain()),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(self)?),
        }
        Ok(())
    }
}

fn failures(out: &mut String, failed: &[ChannelFailure]) {
    for failure in failed {
        let _ = writeln!(
            out,
            "  ! #{} ({}): {:?} {}",
            failure.name, failure.channel, failure.kind, failure.error
        );
    }
}

impl Render for LedgerStats {
    fn plain(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Community {}", self.community);
        let _ = writeln!(out, "  Messages:          {}", self.total_messages);
        let _ = writeln!(out, "  Active users:      {}", self.tracked_users);
        let _ = writeln!(out, "  Tracked channels:  {}", self.tracked_channels);
        let _ = writeln!(
            out,
            "  Members:           {} ({} human, {} silent)",
            self.members, self.human_members, self.members_without_messages
        );
        let _ = writeln!(out, "  Storage:           {} bytes", self.storage_bytes);
        let _ = writeln!(out, "  Backfill:          {:?}", self.backfill.status);
        if let Some(at) = self.backfill.completed_at {
            let _ = writeln!(
                out,
                "  Completed at:      {} ({} imported)",
                at.to_rfc3339(),
                self.backfill.total_imported
            );
        } else if let Some(at) = self.backfill.started_at {
            let _ = writeln!(out, "  Started at:        {}", at.to_rfc3339());
        }
        out
    }
}

impl Render for UserCount {
    fn plain(&self) -> String {
        let mut out = format!(
            "User {}: {} messages (from {:?}, {} channels scanned)\n",
            self.user, self.count, self.source, self.channels_scanned
        );
        if !self.is_complete() {
            out.push_str("  Partial count; unreadable channels:\n");
            failures(&mut out, &self.failed_channels);
        }
        out
    }
}

impl Render for BatchCountResult {
    fn plain(&self) -> String {
        let mut rows: Vec<_> = self.counts.iter().collect();
        rows.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        let mut out = String::new();
        for (user, count) in rows {
            let _ = writeln!(out, "{user:>20}  {count}");
        }
        let _ = writeln!(
            out,
            "{} channels scanned, cache {} hit / {} miss{}",
            self.channels_scanned,
            self.cache.hits,
            self.cache.misses,
            if self.cache.from_store { ", served from store" } else { "" }
        );
        if !self.unreadable_channels.is_empty() {
            let _ = writeln!(out, "  {} channels without history access", self.unreadable_channels.len());
        }
        failures(&mut out, &self.failed_channels);
        out
    }
}

impl Render for BackfillReport {
    fn plain(&self) -> String {
        let mut out = String::new();
        let verdict = if self.success { "completed" } else { "FAILED" };
        let _ = writeln!(out, "Backfill {verdict} for community {} (run {})", self.community, self.run_id);
        let _ = writeln!(out, "  Messages:   {}", self.total_messages);
        let _ = writeln!(
            out,
            "  Channels:   {} processed, {} failed",
            self.channels_processed, self.channels_failed
        );
        let _ = writeln!(out, "  Members:    {}", self.members_synced);
        let _ = writeln!(out, "  Duration:   {} ms", self.duration_ms);
        failures(&mut out, &self.failed_channels);
        if let Some(error) = &self.error {
            let _ = writeln!(out, "  Error: {error}");
        }
        out
    }
}

impl Render for ResetReport {
    fn plain(&self) -> String {
        format!(
            "Removed {} counters, {} members, {} cache entries\n",
            self.counts_removed, self.members_removed, self.cache_entries_removed
        )
    }
}

impl Render for CacheStats {
    fn plain(&self) -> String {
        format!(
            "Cache: {} entries ({} valid, {} expired), {} bytes\n",
            self.total, self.valid, self.expired, self.size_bytes
        )
    }
}

impl Render for AuditResult {
    fn plain(&self) -> String {
        let mut out = String::new();
        let verdict = if self.passed { "PASSED" } else { "FAILED" };
        let _ = writeln!(
            out,
            "{} audit {verdict} for community {} at {}",
            self.kind,
            self.community,
            self.created_at.to_rfc3339()
        );
        let _ = writeln!(
            out,
            "  Accuracy:   {:.1}% ({}/{} within {:.1}%)",
            self.accuracy_percent, self.matches, self.sample_size, self.tolerance_percent
        );
        let _ = writeln!(
            out,
            "  Difference: max {}, avg {:.2}",
            self.max_difference, self.avg_difference
        );
        if self.pruned_channels > 0 {
            let _ = writeln!(out, "  Pruned {} deleted channels", self.pruned_channels);
        }
        if !self.unverified_channels.is_empty() {
            let _ = writeln!(out, "  {} channels could not be verified", self.unverified_channels.len());
        }
        for d in self.mismatched() {
            let _ = writeln!(
                out,
                "  ! user {}: stored {}, fresh {} ({:+}, {:.1}%)",
                d.user, d.stored, d.fresh, d.difference, d.relative_percent
            );
        }
        out
    }
}

#[derive(Serialize)]
struct TopRow {
    rank: usize,
    user: UserId,
    count: u64,
}

pub fn render_top(top: &[(UserId, u64)], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            let rows: Vec<TopRow> = top
                .iter()
                .enumerate()
                .map(|(i, (user, count))| TopRow {
                    rank: i + 1,
                    user: *user,
                    count: *count,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Plain => {
            if top.is_empty() {
                println!("No counted messages yet.");
            }
            for (i, (user, count)) in top.iter().enumerate() {
                println!("{:>3}. {user:>20}  {count}", i + 1);
            }
        }
    }
    Ok(())
}

pub fn render_breakdown(user: UserId, rows: &[ChannelCount], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            let doc = serde_json::json!({ "user": user, "channels": rows });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Plain => {
            println!("Stored per-channel counts for user {user}:");
            for row in rows {
                let last = row
                    .last_message_at
                    .map_or_else(|| "-".to_string(), |at| at.to_rfc3339());
                println!("  {:>20}  {:>8}  last {last}", row.channel, row.count);
            }
        }
    }
    Ok(())
}

pub fn render_audits(audits: &[AuditResult], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(audits)?),
        OutputFormat::Plain => {
            if audits.is_empty() {
                println!("No audits recorded.");
            }
            for audit in audits {
                print!("{}", audit.plain());
            }
        }
    }
    Ok(())
}

pub fn render_removed(what: &str, removed: usize, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "removed": removed })),
        OutputFormat::Plain => println!("Removed {removed} {what}"),
    }
    Ok(())
}
