//! Error types for convoy-sync.

use std::path::PathBuf;

use thiserror::Error;

use convoy_core::SnapshotId;

/// All errors that can arise from backup and unit-directory operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot manifest (de)serialisation.
    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored object is missing from the backup store.
    #[error("snapshot {snapshot}: object {digest} for {file} is missing")]
    MissingObject {
        snapshot: SnapshotId,
        file: String,
        digest: String,
    },

    /// A stored object no longer matches its recorded hash.
    #[error("snapshot {snapshot}: object for {file} is corrupt (expected {expected}, found {actual})")]
    Integrity {
        snapshot: SnapshotId,
        file: String,
        expected: String,
        actual: String,
    },

    /// Manifest entry that would resolve outside the target directory.
    #[error("refusing unsafe path '{0}'")]
    UnsafePath(String),

    #[error("{path} exists but is not a directory")]
    NotADirectory { path: PathBuf },
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
