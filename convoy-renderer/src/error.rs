//! Error types for convoy-renderer.

use std::path::PathBuf;

use thiserror::Error;

/// Failures reading the checked-out tree. Problems with the *content* of
/// units are never errors here; they are collected as validation errors.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
