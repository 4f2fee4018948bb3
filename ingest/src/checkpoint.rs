use crate::error::StartupError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const STATE_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEntry {
    pub processed_at: DateTime<Utc>,
    pub group_id: String,
    pub message_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SkippedEntry {
    pub skipped_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FailedEntry {
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    version: u32,
    processed: BTreeMap<String, ProcessedEntry>,
    skipped: BTreeMap<String, SkippedEntry>,
    failed: BTreeMap<String, FailedEntry>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StateFile {
    fn empty() -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            processed: BTreeMap::new(),
            skipped: BTreeMap::new(),
            failed: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Current standing of a file in the checkpoint state.
#[derive(Debug)]
pub enum FileStatus<'a> {
    Unseen,
    Processed(&'a ProcessedEntry),
    Skipped(&'a SkippedEntry),
    Failed(&'a FailedEntry),
}

/// Durable per-file ingestion outcomes. Every mutation persists immediately
/// through an atomic whole-file replace, so a crash can never lose or
/// duplicate a decision already taken. An exclusive advisory lock on
/// `<state>.lock` keeps a scheduled capture run and a manual backfill from
/// interleaving writes.
pub struct CheckpointStore {
    path: PathBuf,
    state: StateFile,
    // Held for the store's lifetime; dropping releases the lock.
    _lock: File,
}

impl CheckpointStore {
    pub fn open(path: &Path) -> Result<Self, StartupError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StartupError::CheckpointDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let lock_path = lock_path(path);
        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| StartupError::CheckpointDir {
                path: lock_path.clone(),
                source,
            })?;
        match lock.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return Err(StartupError::CheckpointLocked(lock_path));
            }
            Err(source) => {
                return Err(StartupError::CheckpointDir {
                    path: lock_path,
                    source,
                });
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            state: load_state(path),
            _lock: lock,
        })
    }

    pub fn status(&self, name: &str) -> FileStatus<'_> {
        if let Some(entry) = self.state.processed.get(name) {
            return FileStatus::Processed(entry);
        }
        if let Some(entry) = self.state.skipped.get(name) {
            return FileStatus::Skipped(entry);
        }
        if let Some(entry) = self.state.failed.get(name) {
            return FileStatus::Failed(entry);
        }
        FileStatus::Unseen
    }

    pub fn mark_processed(
        &mut self,
        name: &str,
        group_id: &str,
        message_count: usize,
        cursor_timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.state.skipped.remove(name);
        self.state.failed.remove(name);
        self.state.processed.insert(
            name.to_string(),
            ProcessedEntry {
                processed_at: Utc::now(),
                group_id: group_id.to_string(),
                message_count,
                cursor_timestamp,
            },
        );
        self.persist()
    }

    pub fn mark_skipped(&mut self, name: &str, reason: &str) -> Result<()> {
        self.state.processed.remove(name);
        self.state.failed.remove(name);
        self.state.skipped.insert(
            name.to_string(),
            SkippedEntry {
                skipped_at: Utc::now(),
                reason: reason.to_string(),
            },
        );
        self.persist()
    }

    pub fn mark_failed(&mut self, name: &str, reason: &str) -> Result<()> {
        self.state.processed.remove(name);
        self.state.skipped.remove(name);
        self.state.failed.insert(
            name.to_string(),
            FailedEntry {
                failed_at: Utc::now(),
                reason: reason.to_string(),
            },
        );
        self.persist()
    }

    /// One-time merge of an older state file so files already ingested under
    /// a prior scheme are not reprocessed. Entries already present in current
    /// state are never overwritten. Returns how many entries were imported.
    pub fn import_legacy(&mut self, path: &Path) -> Result<usize> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read legacy state {}", path.display()))?;
        let json: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parse legacy state {}", path.display()))?;

        let files = json
            .get("processedFiles")
            .and_then(Value::as_object)
            .context("legacy state has no processedFiles map")?;

        let mut imported = 0usize;
        for (name, entry) in files {
            if !matches!(self.status(name), FileStatus::Unseen) {
                continue;
            }
            let group_id = entry
                .get("groupId")
                .and_then(Value::as_str)
                .unwrap_or("chat-imported")
                .to_string();
            let message_count = entry
                .get("messageCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            let processed_at = entry
                .get("completedAt")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                .unwrap_or_else(Utc::now);
            self.state.processed.insert(
                name.clone(),
                ProcessedEntry {
                    processed_at,
                    group_id,
                    message_count,
                    cursor_timestamp: None,
                },
            );
            imported += 1;
        }

        if imported > 0 {
            self.persist()?;
        }
        info!(imported, path = %path.display(), "merged legacy state");
        Ok(imported)
    }

    pub fn processed_count(&self) -> usize {
        self.state.processed.len()
    }

    /// Whole-file replace via a temp file in the same directory. A crash
    /// mid-write leaves either the old state or the new one, never a torn
    /// file.
    fn persist(&mut self) -> Result<()> {
        self.state.updated_at = Utc::now();
        let tmp_path = self.path.with_extension("json.tmp");

        let payload = serde_json::to_vec_pretty(&self.state)?;
        {
            let mut tmp = File::create(&tmp_path)
                .with_context(|| format!("create {}", tmp_path.display()))?;
            tmp.write_all(&payload)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

fn lock_path(state_path: &Path) -> PathBuf {
    let mut os = state_path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

/// A missing or corrupt state file is never fatal: it is logged and treated
/// as empty initial state.
fn load_state(path: &Path) -> StateFile {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return StateFile::empty(),
        Err(e) => {
            warn!(path = %path.display(), err = %e, "checkpoint state unreadable; starting empty");
            return StateFile::empty();
        }
    };
    match serde_json::from_str::<StateFile>(&raw) {
        Ok(state) => state,
        Err(e) => {
            warn!(path = %path.display(), err = %e, "checkpoint state corrupt; starting empty");
            StateFile::empty()
        }
    }
}
