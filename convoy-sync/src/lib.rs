//! # convoy-sync
//!
//! Everything that touches the unit directory: atomic installs, the
//! content-addressed [`BackupManager`], and dry-run diffs.

pub mod backup;
pub mod diff;
pub mod error;
pub mod writer;

pub use backup::{BackupManager, RestoreReport};
pub use diff::{diff_unit_dir, ChangeKind, FileDiff};
pub use error::SyncError;
pub use writer::{apply, atomic_write, current_checksum, plan, sha256_hex, ApplyPlan};
