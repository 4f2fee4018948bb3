use std::path::PathBuf;

/// Conditions that abort a run before any file is touched. Everything else is
/// recorded per file and the run continues.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("no readable archive directories among {0:?}")]
    NoReadableSources(Vec<PathBuf>),

    #[error("archive directory {path} is not readable: {source}")]
    UnreadableSource {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot prepare checkpoint directory {path}: {source}")]
    CheckpointDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("another ingestion run holds the checkpoint lock at {0}")]
    CheckpointLocked(PathBuf),
}
