use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

// ── Default path constants ──────────────────────────────────────────────

/// Archive directory relative to home.
const DEFAULT_ARCHIVE_REL: &str = ".engram/archive";

/// Checkpoint state file relative to home.
const DEFAULT_STATE_REL: &str = ".engram/state/ingest_state.json";

/// Default sink endpoint.
const DEFAULT_SINK_URL: &str = "http://127.0.0.1:8787/memory/ingest";

// ── Default tuning constants ────────────────────────────────────────────

const DEFAULT_BATCH_SIZE: usize = 5;
const DEFAULT_RATE_LIMIT_MS: u64 = 2_000;
const DEFAULT_RATE_LIMIT_CEILING_MS: u64 = 60_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_MIN_MESSAGES: usize = 2;
const DEFAULT_MIN_CONTENT_CHARS: usize = 10;
const DEFAULT_MAX_CONTENT_CHARS: usize = 4_000;
const DEFAULT_PROGRESS_INTERVAL: usize = 25;

// ── Config struct ───────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct EngramConfig {
    /// Archive directories scanned for transcripts, in priority order.
    pub archive_dirs: Vec<PathBuf>,
    /// Checkpoint state file; the run summary dir and lock file live beside it.
    pub state_path: PathBuf,
    pub sink_url: String,
    pub batch_size: usize,
    pub rate_limit_ms: u64,
    pub rate_limit_ceiling_ms: u64,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    /// Files with fewer qualifying messages than this are skipped.
    pub min_messages: usize,
    /// Trimmed content must be strictly longer than this to qualify.
    pub min_content_chars: usize,
    pub max_content_chars: usize,
    /// Emit a progress line every N files.
    pub progress_interval: usize,
    pub user_display_name: String,
    pub agent_display_name: String,
}

impl EngramConfig {
    pub fn from_env() -> Result<Self> {
        let home = dirs::home_dir().context("could not resolve home directory")?;

        Ok(Self {
            archive_dirs: env_paths(
                "ENGRAM_ARCHIVE_DIRS",
                vec![home.join(DEFAULT_ARCHIVE_REL)],
                home.as_path(),
            ),
            state_path: env_path("ENGRAM_STATE_PATH", home.join(DEFAULT_STATE_REL), &home),
            sink_url: env_string("ENGRAM_SINK_URL", DEFAULT_SINK_URL),
            batch_size: env_usize("ENGRAM_BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1),
            rate_limit_ms: env_u64("ENGRAM_RATE_LIMIT_MS", DEFAULT_RATE_LIMIT_MS),
            rate_limit_ceiling_ms: env_u64(
                "ENGRAM_RATE_LIMIT_CEILING_MS",
                DEFAULT_RATE_LIMIT_CEILING_MS,
            ),
            request_timeout_secs: env_u64(
                "ENGRAM_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            ),
            max_attempts: env_u32("ENGRAM_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS).max(1),
            min_messages: env_usize("ENGRAM_MIN_MESSAGES", DEFAULT_MIN_MESSAGES),
            min_content_chars: env_usize("ENGRAM_MIN_CONTENT_CHARS", DEFAULT_MIN_CONTENT_CHARS),
            max_content_chars: env_usize("ENGRAM_MAX_CONTENT_CHARS", DEFAULT_MAX_CONTENT_CHARS),
            progress_interval: env_usize("ENGRAM_PROGRESS_INTERVAL", DEFAULT_PROGRESS_INTERVAL)
                .max(1),
            user_display_name: env_string("ENGRAM_USER_NAME", "User"),
            agent_display_name: env_string("ENGRAM_AGENT_NAME", "Assistant"),
        })
    }

    /// Directory run summaries are written into.
    pub fn summary_dir(&self) -> PathBuf {
        self.state_path
            .parent()
            .map(|p| p.join("runs"))
            .unwrap_or_else(|| PathBuf::from("runs"))
    }
}

fn env_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(val) if !val.trim().is_empty() => val,
        _ => default.to_string(),
    }
}

fn env_path(key: &str, default: PathBuf, home: &std::path::Path) -> PathBuf {
    match env::var(key) {
        Ok(val) if !val.trim().is_empty() => expand_tilde(&val, home),
        _ => default,
    }
}

fn env_paths(key: &str, default: Vec<PathBuf>, home: &std::path::Path) -> Vec<PathBuf> {
    match env::var(key) {
        Ok(val) if !val.trim().is_empty() => val
            .split(':')
            .filter(|s| !s.trim().is_empty())
            .map(|s| expand_tilde(s, home))
            .collect(),
        _ => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    match env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn expand_tilde(input: &str, home: &std::path::Path) -> PathBuf {
    if let Some(rest) = input.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(input)
}
