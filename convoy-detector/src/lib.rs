//! Change detection for `convoy-detector`.
//!
//! [`ChangeDetector::detect`] fetches the configured branch and compares the
//! remote head with the last applied commit by identity only. The working
//! tree used for deployments is never touched by detection; the engine calls
//! [`GitSource::checkout`] separately once it decides to render a candidate.

use std::path::PathBuf;

use convoy_core::CommitRef;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub mod git;

pub use git::GitCli;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Outcome of one detection pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Detection {
    /// Remote head equals the last applied commit.
    NoChange { head: CommitRef },
    Change {
        new_ref: CommitRef,
        /// Paths (relative to the repository root) that differ from the last
        /// applied commit; every tracked path on first deployment.
        changed_paths: Vec<PathBuf>,
    },
}

/// A checked-out tree at a specific commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingTree {
    pub root: PathBuf,
    pub commit: CommitRef,
}

/// Errors from the Git source.
#[derive(Debug, Error)]
pub enum DetectError {
    /// Network or transport failure. Retried on the next poll tick.
    #[error("fetch of '{branch}' failed: {message}")]
    Transient { branch: String, message: String },

    #[error("git {args} failed ({status}): {stderr}")]
    Git {
        args: String,
        status: String,
        stderr: String,
    },

    #[error("could not run git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("git returned an unexpected commit id '{0}'")]
    BadCommit(String),
}

impl DetectError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DetectError::Transient { .. })
    }
}

/// Read-only view of the Git repository that holds the desired state.
pub trait GitSource: Send {
    /// Update remote-tracking state for `branch` and return its head commit.
    fn fetch(&mut self, branch: &str) -> Result<CommitRef, DetectError>;

    /// Materialise the tree at `commit`.
    fn checkout(&mut self, commit: &CommitRef) -> Result<WorkingTree, DetectError>;

    /// Paths that differ between `from` and `to`. With no `from`, or a `from`
    /// that no longer exists in the repository, every path at `to`.
    fn changed_paths(
        &self,
        from: Option<&CommitRef>,
        to: &CommitRef,
    ) -> Result<Vec<PathBuf>, DetectError>;
}

impl<S: GitSource + ?Sized> GitSource for Box<S> {
    fn fetch(&mut self, branch: &str) -> Result<CommitRef, DetectError> {
        (**self).fetch(branch)
    }

    fn checkout(&mut self, commit: &CommitRef) -> Result<WorkingTree, DetectError> {
        (**self).checkout(commit)
    }

    fn changed_paths(
        &self,
        from: Option<&CommitRef>,
        to: &CommitRef,
    ) -> Result<Vec<PathBuf>, DetectError> {
        (**self).changed_paths(from, to)
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct ChangeDetector<S> {
    source: S,
    branch: String,
}

impl<S: GitSource> ChangeDetector<S> {
    pub fn new(source: S, branch: impl Into<String>) -> Self {
        Self {
            source,
            branch: branch.into(),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Compare the remote head with `last_applied`.
    ///
    /// Any fetch failure is reported as `DetectError::Transient`.
    pub fn detect(&mut self, last_applied: Option<&CommitRef>) -> Result<Detection, DetectError> {
        let head = self.source.fetch(&self.branch).map_err(|e| match e {
            DetectError::Transient { .. } => e,
            other => DetectError::Transient {
                branch: self.branch.clone(),
                message: other.to_string(),
            },
        })?;

        if last_applied == Some(&head) {
            debug!(commit = %head.short(), "source unchanged");
            return Ok(Detection::NoChange { head });
        }

        let changed_paths = self.source.changed_paths(last_applied, &head)?;
        debug!(
            commit = %head.short(),
            changed = changed_paths.len(),
            "source advanced"
        );
        Ok(Detection::Change {
            new_ref: head,
            changed_paths,
        })
    }

    pub fn checkout(&mut self, commit: &CommitRef) -> Result<WorkingTree, DetectError> {
        self.source.checkout(commit)
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
