use std::path::PathBuf;

use thiserror::Error;

/// Failures that stop a reconciliation cycle from reaching any outcome.
///
/// Everything a collaborator can get wrong (fetch, render, activation,
/// health) is folded into a [`crate::CycleOutcome`] instead; only the ledger
/// itself can make a cycle error out.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("ledger error: {0}")]
    Ledger(#[from] convoy_core::LedgerError),
}

impl EngineError {
    /// Storage corruption: the process must not keep reconciling.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Ledger(e) => e.is_fatal(),
        }
    }
}

/// Error surface for the daemon runtime and its control socket.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger error: {0}")]
    Ledger(#[from] convoy_core::LedgerError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Another process is reconciling this host.
    #[error("{0}")]
    Locked(#[from] convoy_core::LockError),

    #[error("control message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed control exchange: {0}")]
    Protocol(String),

    /// The daemon dropped a reconcile request because a cycle was running.
    #[error("daemon busy: {0}")]
    Busy(String),

    #[error("daemon refused the request: {0}")]
    Rejected(String),

    #[error("a daemon is already listening on {socket}")]
    SocketInUse { socket: PathBuf },

    #[error("{task} task ended abnormally: {message}")]
    TaskAborted { task: &'static str, message: String },

    #[error("daemon is not running (no listener on {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
