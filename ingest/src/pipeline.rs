use crate::checkpoint::{CheckpointStore, FileStatus};
use crate::config::EngramConfig;
use crate::discover::{enumerate_sources, SourceFile};
use crate::governor::RateGovernor;
use crate::sink::{MemorySink, SubmitOutcome};
use crate::stats::{persist_summary, RunStats, RunSummary};
use crate::transcript::{read_transcript, ExtractedMessage, ReadFilter};
use anyhow::Result;
use chrono::{DateTime, Utc};
use engram_types::{MemoryBatch, MemoryMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const SKIP_BELOW_MIN: &str = "below-min-messages";
const SKIP_BEFORE_CUTOFF: &str = "session-before-cutoff";

#[derive(Debug, Clone, Copy)]
pub enum IngestMode {
    /// One-time bounded ingestion over a full archive; `processed` and
    /// `skipped` are terminal, `failed` files are resubmitted from scratch.
    Backfill { since: Option<DateTime<Utc>> },
    /// Recurring cursor-based ingestion of newly appended content.
    Capture,
}

impl IngestMode {
    pub fn label(&self) -> &'static str {
        match self {
            IngestMode::Backfill { .. } => "backfill",
            IngestMode::Capture => "capture",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// No sink calls, no state mutation; everything else runs as usual.
    pub dry_run: bool,
    /// Cap on files that actually undergo ingestion work this run.
    pub limit: Option<usize>,
    /// Override for the governor's initial inter-batch delay.
    pub rate_limit_ms: Option<u64>,
}

/// Verdict for one file after its batch sequence ran.
enum FileVerdict {
    Processed {
        submitted: usize,
        cursor: Option<DateTime<Utc>>,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

/// Drive one full ingestion run: enumerate, parse, submit, checkpoint.
/// Strictly sequential — one file at a time, one batch at a time — so the
/// shared rate-limit budget and the checkpoint file see no interleaving.
pub async fn run_ingest<S: MemorySink>(
    config: &EngramConfig,
    store: &mut CheckpointStore,
    sink: &S,
    mode: IngestMode,
    opts: &RunOptions,
    cancel: Arc<AtomicBool>,
) -> Result<RunStats> {
    let mut stats = RunStats::new();
    let mut governor = RateGovernor::new(
        Duration::from_millis(opts.rate_limit_ms.unwrap_or(config.rate_limit_ms)),
        Duration::from_millis(config.rate_limit_ceiling_ms),
    );

    let files = enumerate_sources(&config.archive_dirs)?;
    stats.files_seen = files.len();
    info!(
        files = files.len(),
        mode = mode.label(),
        dry_run = opts.dry_run,
        "ingestion run starting"
    );

    let mut worked = 0usize;
    for (index, file) in files.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            warn!("cancellation requested; stopping before next file");
            break;
        }
        if let Some(limit) = opts.limit {
            if worked >= limit {
                info!(limit, "file limit reached");
                break;
            }
        }
        if (index + 1) % config.progress_interval == 0 {
            info!(
                scanned = index + 1,
                total = files.len(),
                processed = stats.files_processed,
                failed = stats.files_failed,
                "progress"
            );
        }

        let filter = match plan_file(store, file, mode) {
            FilePlan::AlreadyDone => {
                stats.files_already_done += 1;
                continue;
            }
            FilePlan::Ingest(filter) => filter,
        };
        worked += 1;

        if let Err(e) = ingest_file(
            config, store, sink, &mut governor, &mut stats, file, &filter, opts, &cancel,
        )
        .await
        {
            // File-level read errors are recorded and the run continues.
            warn!(file = %file.name, err = %e, "file ingestion errored");
            stats.files_failed += 1;
            if !opts.dry_run {
                store.mark_failed(&file.name, &e.to_string())?;
            }
        }
    }

    stats.final_delay_ms = governor.current_delay().as_millis() as u64;
    stats.finish();
    let summary = RunSummary {
        run_id: Uuid::new_v4(),
        mode: mode.label(),
        dry_run: opts.dry_run,
        stats: &stats,
    };
    if opts.dry_run {
        info!(summary = %serde_json::to_string(&summary)?, "dry run summary (not persisted)");
    } else {
        let path = persist_summary(&config.summary_dir(), &summary)?;
        info!(path = %path.display(), "run summary persisted");
    }
    Ok(stats)
}

enum FilePlan {
    AlreadyDone,
    Ingest(ReadFilter),
}

/// Decide whether a file needs work this run and with what filter.
fn plan_file(store: &CheckpointStore, file: &SourceFile, mode: IngestMode) -> FilePlan {
    match (store.status(&file.name), mode) {
        // Terminal in backfill; skipped files are also left alone there.
        (FileStatus::Processed(_), IngestMode::Backfill { .. }) => FilePlan::AlreadyDone,
        (FileStatus::Skipped(_), IngestMode::Backfill { .. }) => FilePlan::AlreadyDone,
        // Capture re-reads processed files past their cursor: the archives
        // are append-only, so the file may have grown. Entries without a
        // cursor (legacy imports) have no safe resume point and stay terminal.
        (FileStatus::Processed(entry), IngestMode::Capture) => match entry.cursor_timestamp {
            Some(cursor) => FilePlan::Ingest(ReadFilter {
                cursor: Some(cursor),
                cutoff: None,
            }),
            None => FilePlan::AlreadyDone,
        },
        // A skipped file can grow past the minimum threshold later.
        (FileStatus::Skipped(_), IngestMode::Capture) => FilePlan::Ingest(ReadFilter::default()),
        // Failed files are always resubmitted from scratch.
        (FileStatus::Failed(_), _) | (FileStatus::Unseen, _) => {
            FilePlan::Ingest(ReadFilter {
                cursor: None,
                cutoff: match mode {
                    IngestMode::Backfill { since } => since,
                    IngestMode::Capture => None,
                },
            })
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn ingest_file<S: MemorySink>(
    config: &EngramConfig,
    store: &mut CheckpointStore,
    sink: &S,
    governor: &mut RateGovernor,
    stats: &mut RunStats,
    file: &SourceFile,
    filter: &ReadFilter,
    opts: &RunOptions,
    cancel: &AtomicBool,
) -> Result<()> {
    let transcript = read_transcript(&file.path, &file.name, filter, config)?;
    stats.malformed_lines += transcript.malformed_lines;

    if transcript.before_cutoff {
        stats.files_skipped += 1;
        if !opts.dry_run {
            store.mark_skipped(&file.name, SKIP_BEFORE_CUTOFF)?;
        }
        return Ok(());
    }

    // The minimum applies to a file's full qualifying count; a file already
    // processed is past the bar, its post-cursor remainder may be tiny.
    let already_processed = filter.cursor.is_some();
    if !already_processed && transcript.messages.len() < config.min_messages {
        stats.files_skipped += 1;
        if !opts.dry_run {
            store.mark_skipped(&file.name, SKIP_BELOW_MIN)?;
        }
        return Ok(());
    }
    if transcript.messages.is_empty() {
        // Cursor caught up; nothing new appended since the last run.
        stats.files_already_done += 1;
        return Ok(());
    }

    stats.messages_extracted += transcript.messages.len();

    if opts.dry_run {
        info!(
            file = %file.name,
            group = %transcript.group_key,
            messages = transcript.messages.len(),
            "dry run: would submit"
        );
        stats.files_processed += 1;
        return Ok(());
    }

    let verdict = submit_file(
        sink,
        governor,
        stats,
        &transcript.group_key,
        &transcript.messages,
        config,
        cancel,
    )
    .await;

    match verdict {
        FileVerdict::Processed { submitted, cursor } => {
            let (count, cursor) = match store.status(&file.name) {
                FileStatus::Processed(prev) => (
                    prev.message_count + submitted,
                    // Cursor is monotonically non-decreasing across runs.
                    match (prev.cursor_timestamp, cursor) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        (a, b) => b.or(a),
                    },
                ),
                _ => (submitted, cursor),
            };
            store.mark_processed(&file.name, &transcript.group_key, count, cursor)?;
            stats.files_processed += 1;
            info!(file = %file.name, submitted, group = %transcript.group_key, "file processed");
        }
        FileVerdict::Failed { reason } => {
            store.mark_failed(&file.name, &reason)?;
            stats.files_failed += 1;
            warn!(file = %file.name, reason = %reason, "file failed; will retry next run");
        }
        FileVerdict::Cancelled => {
            // Leave the file unmarked: the next run resubmits it whole, which
            // the duplicate-tolerant sink absorbs.
            warn!(file = %file.name, "cancelled mid-file; outcome left unrecorded");
        }
    }
    Ok(())
}

/// Submit one file's messages as fixed-size batches. Any batch giving up
/// fails the whole file and halts its remaining batches; the file becomes
/// processed only if every batch succeeded.
async fn submit_file<S: MemorySink>(
    sink: &S,
    governor: &mut RateGovernor,
    stats: &mut RunStats,
    group_key: &str,
    messages: &[ExtractedMessage],
    config: &EngramConfig,
    cancel: &AtomicBool,
) -> FileVerdict {
    let mut submitted = 0usize;
    let mut cursor: Option<DateTime<Utc>> = None;

    for chunk in messages.chunks(config.batch_size) {
        if cancel.load(Ordering::Relaxed) {
            return FileVerdict::Cancelled;
        }

        let batch = MemoryBatch {
            group_id: group_key.to_string(),
            messages: chunk
                .iter()
                .map(|m| MemoryMessage {
                    role_type: m.role_type,
                    role: m.display_name.clone(),
                    content: m.content.clone(),
                    timestamp: m.timestamp,
                })
                .collect(),
        };

        match submit_batch(sink, governor, stats, &batch, config.max_attempts).await {
            Ok(()) => {
                submitted += chunk.len();
                if let Some(last) = chunk.last() {
                    cursor = Some(cursor.map_or(last.timestamp, |c| c.max(last.timestamp)));
                }
            }
            Err(reason) => {
                stats.batches_failed += 1;
                return FileVerdict::Failed { reason };
            }
        }
    }

    FileVerdict::Processed { submitted, cursor }
}

/// Attempt loop for a single batch:
/// `PENDING → SENDING → {SUCCESS | RATE_LIMITED | SERVER_ERROR | CLIENT_ERROR
/// | NETWORK_ERROR | TIMEOUT} → {RETRY | GIVE_UP}`.
async fn submit_batch<S: MemorySink>(
    sink: &S,
    governor: &mut RateGovernor,
    stats: &mut RunStats,
    batch: &MemoryBatch,
    max_attempts: u32,
) -> Result<(), String> {
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        governor.pause().await;

        match sink.submit(batch).await {
            SubmitOutcome::Accepted => {
                stats.batches_sent += 1;
                stats.messages_submitted += batch.messages.len();
                return Ok(());
            }
            SubmitOutcome::RateLimited => {
                governor.on_rate_limited();
                stats.rate_limit_hits += 1;
                last_error = "rate limited".to_string();
            }
            SubmitOutcome::ServerError(detail) => {
                warn!(attempt, detail = %detail, "server error; retrying at current delay");
                last_error = detail;
            }
            SubmitOutcome::Transient(detail) => {
                warn!(attempt, detail = %detail, "transient failure; retrying");
                last_error = detail;
            }
            SubmitOutcome::ClientError(detail) => {
                return Err(format!("client error (not retried): {detail}"));
            }
        }

        if attempt < max_attempts {
            stats.retries += 1;
        }
    }

    Err(format!(
        "gave up after {max_attempts} attempts: {last_error}"
    ))
}
