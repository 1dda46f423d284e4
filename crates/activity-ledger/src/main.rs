//! aledger: inspect, backfill and audit an activity ledger from the shell.
//!
//! Every command opens the configured ledger and cache databases. Commands
//! that read history (count, backfill, audit, schedule) also need the bot
//! token named by `source.token_env`.

mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use activity_ledger_core::Ledger;
use activity_ledger_core::auditor::{AuditKind, AuditRequest};
use activity_ledger_core::config::{Config, resolve_config_path};
use activity_ledger_core::counting::CountOptions;
use activity_ledger_core::logging::init_logging;
use activity_ledger_core::model::{CommunityId, UserId};
use activity_ledger_core::progress::{Progress, ProgressCallback};
use activity_ledger_core::source::discord::DiscordSource;

use output::{OutputFormat, Render};

#[derive(Parser)]
#[command(name = "aledger", version, about = "Per-user message counts: inspect, backfill, audit")]
struct Cli {
    /// Path to activity-ledger.toml
    #[arg(long, short = 'c', global = true, env = "ACTIVITY_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,

    /// Log at debug level (RUST_LOG still wins)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Totals, members and backfill status of a community
    Stats {
        #[arg(long)]
        community: u64,
    },

    /// Count messages for one or more users
    Count {
        #[arg(long)]
        community: u64,
        /// User ids
        #[arg(required = true, num_args = 1..)]
        users: Vec<u64>,
        /// Only count the last N days
        #[arg(long)]
        days: Option<u32>,
        /// Bypass the store and cache and recount from history
        #[arg(long)]
        fresh: bool,
        /// Channels walked concurrently in batch mode
        #[arg(long)]
        parallelism: Option<usize>,
        /// Also print per-channel stored counters
        #[arg(long)]
        breakdown: bool,
    },

    /// Leaderboard from stored totals
    Top {
        #[arg(long)]
        community: u64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Import the full message history of a community
    Backfill {
        #[arg(long)]
        community: u64,
        /// Ignore history older than this RFC 3339 timestamp
        #[arg(long)]
        after: Option<DateTime<Utc>>,
    },

    /// Wipe imported counts, members, cache and backfill state
    Reset {
        #[arg(long)]
        community: u64,
    },

    /// Run a consistency audit now
    Audit {
        #[arg(long)]
        community: u64,
        /// daily, weekly or manual (sets the default sample size)
        #[arg(long, default_value = "manual")]
        kind: AuditKind,
        #[arg(long)]
        sample_size: Option<usize>,
        /// Fix the sample for a reproducible rerun
        #[arg(long)]
        seed: Option<u64>,
        /// Audit exactly these users instead of sampling
        #[arg(long, num_args = 1..)]
        users: Vec<u64>,
        /// Relative difference (percent) still counted as a match
        #[arg(long)]
        tolerance: Option<f64>,
    },

    /// Show persisted audit results
    Audits {
        #[arg(long)]
        community: u64,
        #[arg(long)]
        kind: Option<AuditKind>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Run daily and weekly audits on the configured schedule until Ctrl-C
    Schedule {
        /// Run one pass of this kind immediately and exit
        #[arg(long)]
        once: Option<AuditKind>,
    },

    /// Count cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Configuration inspection
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Entry counts and estimated size
    Stats,
    /// Drop cached counts (one community, or all)
    Clear {
        #[arg(long)]
        community: Option<u64>,
    },
    /// Drop expired entries
    Prune,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Validate the configuration file
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<activity_ledger_core::Error>()
                .and_then(activity_ledger_core::Error::remediation)
            {
                eprintln!();
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::load_or_default(cli.config.as_deref()).context("Failed to load config")?;

    let mut log_config = config.logging.clone();
    if cli.verbose {
        log_config.level = "debug".to_string();
    }
    init_logging(&log_config).context("Failed to initialize logging")?;

    let format = cli.format;
    match cli.command {
        Commands::Config { command } => run_config(command, &config, cli.config.as_deref(), format),
        Commands::Stats { community } => {
            let ledger = open_ledger(&config, false)?;
            let stats = ledger.get_stats(CommunityId(community)).await?;
            stats.render(format)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Count {
            community,
            users,
            days,
            fresh,
            parallelism,
            breakdown,
        } => {
            let ledger = open_ledger(&config, true)?;
            let community = CommunityId(community);
            let users: Vec<UserId> = users.into_iter().map(UserId).collect();
            let mut options = if fresh { CountOptions::fresh() } else { CountOptions::default() }
                .lookback_days(days);
            if let Some(parallelism) = parallelism {
                options = options.parallelism(parallelism);
            }
            if format == OutputFormat::Plain {
                options = options.progress(stderr_progress());
            }

            if let [user] = users.as_slice() {
                let count = ledger.count_user(community, *user, &options).await?;
                count.render(format)?;
            } else {
                let result = ledger.count_messages_for_users(community, &users, &options).await?;
                result.render(format)?;
            }
            if breakdown {
                for user in &users {
                    let rows = ledger.get_user_channel_breakdown(community, *user).await?;
                    output::render_breakdown(*user, &rows, format)?;
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Top { community, limit } => {
            let ledger = open_ledger(&config, false)?;
            let top = ledger.get_top_users(CommunityId(community), limit).await?;
            output::render_top(&top, format)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backfill { community, after } => {
            let ledger = open_ledger(&config, true)?;
            let progress = (format == OutputFormat::Plain).then(stderr_progress);
            let report = ledger
                .import_history(CommunityId(community), progress, after)
                .await?;
            report.render(format)?;
            Ok(if report.success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::Reset { community } => {
            let ledger = open_ledger(&config, false)?;
            let report = ledger.reset_backfill(CommunityId(community)).await?;
            report.render(format)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Audit {
            community,
            kind,
            sample_size,
            seed,
            users,
            tolerance,
        } => {
            let ledger = open_ledger(&config, true)?;
            let community = CommunityId(community);
            let result = if users.is_empty() {
                if tolerance.is_some() {
                    bail!("--tolerance applies to --users audits; set ledger.audit_tolerance_percent instead");
                }
                let request = AuditRequest {
                    sample_size,
                    seed,
                    progress: None,
                };
                let Some(result) = ledger.run_audit(community, kind, request).await? else {
                    println!("Community {community} is not eligible for auditing (backfill incomplete or no active users).");
                    return Ok(ExitCode::SUCCESS);
                };
                result
            } else {
                let users: Vec<UserId> = users.into_iter().map(UserId).collect();
                ledger.validate_sample(community, &users, tolerance, None).await?
            };
            result.render(format)?;
            Ok(if result.passed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::Audits { community, kind, limit } => {
            let ledger = open_ledger(&config, false)?;
            let audits = ledger.recent_audits(CommunityId(community), kind, limit).await?;
            output::render_audits(&audits, format)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule { once } => {
            let ledger = open_ledger(&config, true)?;
            let scheduler = ledger.scheduler(&config.schedule)?;
            if let Some(kind) = once {
                let results = scheduler.run_now(kind).await?;
                output::render_audits(&results, format)?;
                return Ok(ExitCode::SUCCESS);
            }
            if !config.schedule.enabled {
                bail!("schedule.enabled is false in the configuration");
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received; stopping scheduler");
                    let _ = shutdown_tx.send(true);
                }
            });
            scheduler.run(shutdown_rx).await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cache { command } => {
            let ledger = open_ledger(&config, false)?;
            match command {
                CacheCommands::Stats => ledger.cache_stats().await?.render(format)?,
                CacheCommands::Clear { community } => {
                    let removed = ledger.clear_cache(community.map(CommunityId)).await?;
                    output::render_removed("cache entries", removed, format)?;
                }
                CacheCommands::Prune => {
                    let removed = ledger.prune_cache().await?;
                    output::render_removed("expired cache entries", removed, format)?;
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Open the ledger. Store-only commands never contact the history source,
/// so they run without a token.
fn open_ledger(config: &Config, needs_source: bool) -> anyhow::Result<Ledger> {
    let source = if needs_source {
        DiscordSource::from_config(&config.source)?
    } else {
        DiscordSource::new(&config.source, String::new())?
    };
    let ledger = Ledger::from_config(config, Arc::new(source)).with_context(|| {
        format!(
            "Failed to open ledger databases in {}",
            config.storage.resolved_data_dir().display()
        )
    })?;
    Ok(ledger)
}

fn stderr_progress() -> ProgressCallback {
    Arc::new(|p: &Progress| {
        eprintln!("[{}/{}] {}", p.current, p.total, p.label);
        Ok(())
    })
}

fn run_config(
    command: ConfigCommands,
    config: &Config,
    explicit: Option<&std::path::Path>,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    match command {
        ConfigCommands::Show => {
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
                OutputFormat::Plain => print!("{}", config.to_toml_string()?),
            }
            Ok(ExitCode::SUCCESS)
        }
        ConfigCommands::Check => {
            // Loading already validated; report where it came from
            match resolve_config_path(explicit) {
                Some(path) => println!("Config OK: {}", path.display()),
                None => println!("Config OK: no file found, using defaults"),
            }
            println!("Ledger database: {}", config.storage.ledger_path().display());
            println!("Cache database:  {}", config.storage.cache_path().display());
            Ok(ExitCode::SUCCESS)
        }
    }
}
