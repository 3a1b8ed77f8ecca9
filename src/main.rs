//! # Window Digest CLI (`wdigest`)
//!
//! The `wdigest` binary runs the digest pipeline for timezone-anchored
//! windows and inspects their state.
//!
//! ## Usage
//!
//! ```bash
//! wdigest --config ./config/wdigest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `wdigest init` | Create the SQLite database and run schema migrations |
//! | `wdigest run` | Run the pipeline for the last closed window (or `--at` / `--date`) |
//! | `wdigest status` | Show recent windows, their stage and counts |
//! | `wdigest dups` | Report exact-duplicate groups for a window |
//! | `wdigest reset <window>` | Force a window back to an earlier stage |
//! | `wdigest schedule` | Run the last closed window every day at the configured time |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! wdigest init --config ./config/wdigest.toml
//!
//! # Process the window that closed today at the anchor time
//! wdigest run --date 2026-02-07
//!
//! # Re-run clustering only, replacing the existing clusters
//! wdigest run --date 2026-02-07 --stages dedup --force
//! ```

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use window_digest::config::{self, Config};
use window_digest::db;
use window_digest::exact_dedup::ExactDedupIndex;
use window_digest::migrate;
use window_digest::models::{Stage, Step, Window};
use window_digest::pipeline::{PipelineOrchestrator, RunReport, StageOutcome};
use window_digest::state::WindowStateStore;
use window_digest::stats;
use window_digest::store;
use window_digest::window;

/// Window Digest CLI: ingest, deduplicate and publish one digest per
/// time window.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/wdigest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "wdigest",
    about = "Window Digest: a resumable, window-based digest pipeline",
    version,
    long_about = "Window Digest collects feed items for a timezone-anchored daily window, \
    summarizes and embeds them, removes exact and near duplicates, and publishes exactly one \
    digest per window. Every stage is committed to SQLite, so interrupted runs resume."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/wdigest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Safe to run repeatedly.
    Init,

    /// Run pipeline stages for one window.
    ///
    /// Without `--at` or `--date`, the most recently closed window is used.
    Run {
        /// Any instant inside the window (RFC 3339).
        #[arg(long, conflicts_with = "date")]
        at: Option<String>,

        /// Local date on which the window closes (YYYY-MM-DD).
        #[arg(long)]
        date: Option<String>,

        /// Comma-separated stages to run (default: all).
        /// Values: ingest, summarize, embed, dedup, publish.
        #[arg(long, value_delimiter = ',')]
        stages: Option<Vec<String>>,

        /// Re-run stages that are already completed, including publish.
        #[arg(long)]
        force: bool,
    },

    /// Show recent windows and their progress.
    Status {
        /// Number of windows to show.
        #[arg(long, default_value = "10")]
        limit: i64,
    },

    /// Report exact-duplicate groups for a window. Read-only.
    Dups {
        /// Any instant inside the window (RFC 3339).
        #[arg(long, conflicts_with = "date")]
        at: Option<String>,

        /// Local date on which the window closes (YYYY-MM-DD).
        #[arg(long)]
        date: Option<String>,
    },

    /// Force a window back to an earlier stage.
    Reset {
        /// Window id as shown by `wdigest status`.
        window_id: String,

        /// Stage to reset to.
        #[arg(long, default_value = "pending")]
        stage: String,
    },

    /// Run the last closed window every day at `window.run_at_hour:run_at_minute`.
    Schedule,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("window_digest=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Run {
            at,
            date,
            stages,
            force,
        } => {
            let steps = match stages {
                Some(names) => names
                    .iter()
                    .map(|s| s.parse::<Step>())
                    .collect::<Result<Vec<_>, _>>()?,
                None => Step::ALL.to_vec(),
            };
            let target = resolve_window(&cfg, at.as_deref(), date.as_deref())?;

            let pool = db::connect(&cfg).await?;
            let orchestrator = PipelineOrchestrator::from_config(&cfg, pool.clone())?;
            let report = orchestrator.run(&target, &steps, force).await?;
            print_report(&report);
            pool.close().await;
        }
        Commands::Status { limit } => {
            stats::run_status(&cfg, limit).await?;
        }
        Commands::Dups { at, date } => {
            let target = resolve_window(&cfg, at.as_deref(), date.as_deref())?;
            let pool = db::connect(&cfg).await?;
            let items = store::items_in_window(&pool, &target.id).await?;
            let groups = ExactDedupIndex::group(&items);

            println!("exact duplicates {}", target.id);
            println!("  items: {}", items.len());
            println!("  groups: {}", groups.len());
            for group in &groups {
                let channels: Vec<&str> = group.channel_set.iter().map(|c| c.as_str()).collect();
                println!(
                    "  {}  x{}  [{}]  {}",
                    &group.content_hash[..12.min(group.content_hash.len())],
                    group.item_ids.len(),
                    channels.join(", "),
                    group.item_ids.join(" ")
                );
            }
            pool.close().await;
        }
        Commands::Reset { window_id, stage } => {
            let stage: Stage = stage.parse()?;
            let pool = db::connect(&cfg).await?;
            WindowStateStore::new(pool.clone()).reset(&window_id, stage).await?;
            println!("Window {} reset to {}.", window_id, stage);
            pool.close().await;
        }
        Commands::Schedule => {
            run_schedule(&cfg).await?;
        }
    }

    Ok(())
}

/// Window selected by `--at` / `--date`, or the last closed one.
fn resolve_window(cfg: &Config, at: Option<&str>, date: Option<&str>) -> anyhow::Result<Window> {
    let tz = window::parse_timezone(&cfg.window.timezone)?;
    let (hour, minute) = (cfg.window.anchor_hour, cfg.window.anchor_minute);

    if let Some(date) = date {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .with_context(|| format!("invalid --date '{date}', expected YYYY-MM-DD"))?;
        return Ok(window::for_closing_date(date, hour, minute, tz)?);
    }

    if let Some(at) = at {
        let reference = DateTime::parse_from_rfc3339(at)
            .with_context(|| format!("invalid --at '{at}', expected RFC 3339"))?
            .with_timezone(&Utc);
        return Ok(window::compute(reference, hour, minute, tz)?);
    }

    let current = window::compute(Utc::now(), hour, minute, tz)?;
    Ok(window::compute(current.start - Duration::seconds(1), hour, minute, tz)?)
}

async fn run_schedule(cfg: &Config) -> anyhow::Result<()> {
    let tz = window::parse_timezone(&cfg.window.timezone)?;
    let pool = db::connect(cfg).await?;
    let orchestrator = PipelineOrchestrator::from_config(cfg, pool.clone())?;

    loop {
        let now = Utc::now();
        let next = window::next_occurrence(now, cfg.window.run_at_hour, cfg.window.run_at_minute, tz)?;
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next_run = %next, "scheduler waiting");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("scheduler stopped");
                break;
            }
        }

        match orchestrator.run_once(Utc::now()).await {
            Ok(report) => print_report(&report),
            Err(e) => error!(error = %e, "scheduled run failed"),
        }
    }

    pool.close().await;
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("run {}", report.window.id);
    for (step, outcome) in &report.outcomes {
        match outcome {
            StageOutcome::Skipped => println!("  {:<10} skipped (already completed)", step.as_str()),
            StageOutcome::AlreadyPublished(receipt) => println!(
                "  {:<10} already published at {} ({})",
                step.as_str(),
                receipt.published_at.format("%Y-%m-%d %H:%M:%S UTC"),
                receipt.message_ids.join(", ")
            ),
            StageOutcome::Completed(stats) if stats.provider_disabled => {
                println!("  {:<10} completed (provider disabled)", step.as_str())
            }
            StageOutcome::Completed(stats) => {
                println!(
                    "  {:<10} completed: processed {}, reused {}, skipped {}",
                    step.as_str(),
                    stats.processed,
                    stats.reused,
                    stats.skipped
                );
                if let Some(dedup) = &stats.dedup {
                    println!(
                        "             clusters {}, largest {}, average {:.2}, no embedding {}",
                        dedup.clusters_created,
                        dedup.largest_cluster,
                        dedup.average_cluster_size,
                        dedup.skipped_no_embedding
                    );
                }
                if !stats.message_ids.is_empty() {
                    println!("             messages: {}", stats.message_ids.join(", "));
                }
            }
        }
    }
    println!("  stage: {}", report.completed);
    println!("  elapsed: {} ms", report.duration.as_millis());
}
