//! Error types for convoy-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{DeploymentId, DeploymentStatus, ParseStatusError};

/// All errors that can arise from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A non-terminal deployment already holds the ledger.
    #[error("deployment {open} is still {status}; refusing to begin another")]
    Conflict {
        open: DeploymentId,
        status: DeploymentStatus,
    },

    /// The record's current status does not permit the requested transition.
    #[error("deployment {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: DeploymentId,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    /// A precondition other than the status itself does not hold.
    #[error("deployment {id}: {message}")]
    Precondition { id: DeploymentId, message: String },

    #[error("deployment {0} not found")]
    NotFound(DeploymentId),

    /// Integrity check failed at open. Fatal: nothing may reconcile on top of it.
    #[error("ledger at {path} is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("failed to create ledger directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored manifest is not valid JSON: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("stored value is invalid: {0}")]
    Decode(#[from] ParseStatusError),
}

impl LedgerError {
    /// Storage corruption is the only failure the process must not survive.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::Corrupt { .. })
    }
}

/// Errors from taking the host-wide engine lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("engine lock {path} is held by {}", holder(.pid))]
    Held { path: PathBuf, pid: Option<u32> },

    #[error("failed to lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn holder(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!("pid {pid}"),
        None => "another process".to_string(),
    }
}

/// Errors from loading the configuration file.
///
/// Field-level validation problems are reported separately as
/// [`crate::config::FieldError`] lists.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration not found at {path}")]
    NotFound { path: PathBuf },

    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load; includes file path and line context from serde_yaml.
    #[error("failed to parse configuration at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`; cannot locate `~/.convoy/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}
