use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use ingest::checkpoint::CheckpointStore;
use ingest::config::EngramConfig;
use ingest::pipeline::{run_ingest, IngestMode, RunOptions};
use ingest::sink::HttpSink;
use ingest::stats::RunStats;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "engram",
    about = "Engram ingestion tools: archive backfill and incremental capture into a memory store"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// One-time backfill over archived transcripts.
    Backfill {
        /// Parse everything but make no network calls and mutate no state.
        #[arg(long)]
        dry_run: bool,

        /// Cap on files ingested this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Skip sessions older than this timestamp (RFC 3339, e.g. 2026-01-01T00:00:00Z).
        #[arg(long)]
        since: Option<String>,

        /// Initial inter-batch delay in milliseconds.
        #[arg(long)]
        rate_limit_ms: Option<u64>,
    },

    /// Incremental capture of messages appended since the stored cursors.
    Capture {
        /// Parse everything but make no network calls and mutate no state.
        #[arg(long)]
        dry_run: bool,

        /// Cap on files ingested this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Initial inter-batch delay in milliseconds.
        #[arg(long)]
        rate_limit_ms: Option<u64>,
    },

    /// One-off merge of a legacy state file into the current checkpoint
    /// state. Entries already present are never overwritten.
    ImportState {
        /// Path to the legacy state file.
        file: PathBuf,
    },
}

pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngramConfig::from_env()?;

    match cli.command {
        Commands::Backfill {
            dry_run,
            limit,
            since,
            rate_limit_ms,
        } => {
            let since = parse_optional_ts(since.as_deref(), "--since")?;
            let opts = RunOptions {
                dry_run,
                limit,
                rate_limit_ms,
            };
            run_mode(&config, IngestMode::Backfill { since }, &opts).await
        }
        Commands::Capture {
            dry_run,
            limit,
            rate_limit_ms,
        } => {
            let opts = RunOptions {
                dry_run,
                limit,
                rate_limit_ms,
            };
            run_mode(&config, IngestMode::Capture, &opts).await
        }
        Commands::ImportState { file } => run_import_state(&config, &file),
    }
}

async fn run_mode(config: &EngramConfig, mode: IngestMode, opts: &RunOptions) -> Result<()> {
    println!(
        "Engram {} over {} archive dir(s)...",
        mode.label(),
        config.archive_dirs.len()
    );

    let mut store = CheckpointStore::open(&config.state_path)?;
    let sink = HttpSink::new(
        &config.sink_url,
        Duration::from_secs(config.request_timeout_secs),
    )?;

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("termination requested; finishing the in-flight batch");
            flag.store(true, Ordering::Relaxed);
        }
    });

    let stats = run_ingest(config, &mut store, &sink, mode, opts, cancel).await?;
    print_stats(&stats);

    // Per-file failures are recorded in the checkpoint state and retried on
    // the next run; they do not fail the process.
    Ok(())
}

fn run_import_state(config: &EngramConfig, file: &PathBuf) -> Result<()> {
    let mut store = CheckpointStore::open(&config.state_path)?;
    let imported = store.import_legacy(file)?;
    println!(
        "Imported {} legacy entries into {}",
        imported,
        config.state_path.display()
    );
    Ok(())
}

fn print_stats(stats: &RunStats) {
    println!(
        "Run complete: seen={} processed={} skipped={} failed={} already_done={}",
        stats.files_seen,
        stats.files_processed,
        stats.files_skipped,
        stats.files_failed,
        stats.files_already_done,
    );
    println!(
        "Messages: extracted={} submitted={} batches={} retries={} rate_limit_hits={}",
        stats.messages_extracted,
        stats.messages_submitted,
        stats.batches_sent,
        stats.retries,
        stats.rate_limit_hits,
    );
}

fn parse_optional_ts(value: Option<&str>, flag_name: &str) -> Result<Option<DateTime<Utc>>> {
    match value {
        None => Ok(None),
        Some(s) => {
            let dt = s
                .parse::<DateTime<Utc>>()
                .map_err(|e| anyhow::anyhow!("invalid {flag_name} timestamp '{s}': {e}"))?;
            Ok(Some(dt))
        }
    }
}
