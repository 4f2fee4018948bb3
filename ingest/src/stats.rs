use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Run-scoped counters, threaded explicitly through the pipeline. Purely
/// observational: never consulted for control flow.
#[derive(Debug, Serialize)]
pub struct RunStats {
    pub files_seen: usize,
    pub files_processed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub files_already_done: usize,
    pub messages_extracted: usize,
    pub messages_submitted: usize,
    pub batches_sent: usize,
    pub batches_failed: usize,
    pub retries: u64,
    pub rate_limit_hits: u64,
    pub malformed_lines: usize,
    /// The governor's inter-batch delay when the run ended.
    pub final_delay_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            files_seen: 0,
            files_processed: 0,
            files_skipped: 0,
            files_failed: 0,
            files_already_done: 0,
            messages_extracted: 0,
            messages_submitted: 0,
            batches_sent: 0,
            batches_failed: 0,
            retries: 0,
            rate_limit_hits: 0,
            malformed_lines: 0,
            final_delay_ms: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Final run record persisted as JSON beside the checkpoint state.
#[derive(Debug, Serialize)]
pub struct RunSummary<'a> {
    pub run_id: Uuid,
    pub mode: &'a str,
    pub dry_run: bool,
    #[serde(flatten)]
    pub stats: &'a RunStats,
}

/// Write the summary to `<dir>/run-<timestamp>.json` and return the path.
pub fn persist_summary(dir: &Path, summary: &RunSummary<'_>) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create summary dir {}", dir.display()))?;
    let stamp = summary
        .stats
        .finished_at
        .unwrap_or_else(Utc::now)
        .format("%Y%m%dT%H%M%SZ");
    let path = dir.join(format!("run-{stamp}.json"));
    let payload = serde_json::to_vec_pretty(summary)?;
    fs::write(&path, payload).with_context(|| format!("write summary {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn summary_carries_every_outcome_category() -> Result<()> {
        let dir = tempdir().expect("tempdir");
        let mut stats = RunStats::new();
        stats.files_seen = 4;
        stats.files_processed = 2;
        stats.files_skipped = 1;
        stats.files_failed = 1;
        stats.rate_limit_hits = 3;
        stats.final_delay_ms = 4_500;
        stats.finish();

        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            mode: "backfill",
            dry_run: false,
            stats: &stats,
        };
        let path = persist_summary(dir.path(), &summary)?;

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
        assert_eq!(json["mode"], "backfill");
        assert_eq!(json["final_delay_ms"].as_u64(), Some(4_500));
        assert_eq!(json["files_processed"].as_u64(), Some(2));
        assert_eq!(json["files_skipped"].as_u64(), Some(1));
        assert_eq!(json["files_failed"].as_u64(), Some(1));
        assert_eq!(json["rate_limit_hits"].as_u64(), Some(3));
        assert!(json["finished_at"].is_string());
        Ok(())
    }
}
