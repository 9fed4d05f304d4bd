//! Atomic writes into the unit directory.
//!
//! ## `atomic_write`
//!
//! 1. Write to `.<name>.convoy.tmp` in the target's directory.
//! 2. `fsync` and set the final mode.
//! 3. Rename over the target (atomic on POSIX).
//!
//! A crash leaves either the old file or the new one, plus at worst a stray
//! `.convoy.tmp` that the next write replaces and snapshots ignore.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use convoy_core::paths::set_mode;
use convoy_renderer::{FileKind, RenderedUnitSet};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{io_err, SyncError};

pub(crate) const TMP_SUFFIX: &str = ".convoy.tmp";

/// Mode for unit files.
pub const UNIT_MODE: u32 = 0o644;
/// Environment files may carry secrets.
pub const ENV_MODE: u32 = 0o600;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Atomically replace `path` with `bytes`.
pub fn atomic_write(path: &Path, bytes: &[u8], mode: u32) -> Result<(), SyncError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{name}{TMP_SUFFIX}"));

    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(&tmp, e));
    }
    set_mode(&tmp, mode).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    sync_dir(parent);
    Ok(())
}

/// Best-effort directory fsync so the rename itself is durable.
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// Remove `path`, treating "already gone" as success.
pub(crate) fn remove_if_present(path: &Path) -> Result<bool, SyncError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Checksum of the file currently at `path`, if any.
pub fn current_checksum(path: &Path) -> Result<Option<String>, SyncError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(sha256_hex(&bytes))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

// ---------------------------------------------------------------------------
// Plan / apply
// ---------------------------------------------------------------------------

/// What applying a unit set to the unit directory will change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyPlan {
    /// New or changed files, by installed name.
    pub writes: Vec<String>,
    /// Files already byte-identical on disk.
    pub unchanged: Vec<String>,
    /// Previously deployed files absent from the new set.
    pub removals: Vec<String>,
}

impl ApplyPlan {
    pub fn is_noop(&self) -> bool {
        self.writes.is_empty() && self.removals.is_empty()
    }
}

/// Compare `set` with the unit directory. `previous` lists the files the
/// last deployment installed; only those are candidates for removal.
pub fn plan<'a>(
    unit_dir: &Path,
    set: &RenderedUnitSet,
    previous: impl IntoIterator<Item = &'a str>,
) -> Result<ApplyPlan, SyncError> {
    let mut out = ApplyPlan::default();
    for unit in set.iter() {
        let on_disk = current_checksum(&unit_dir.join(&unit.name))?;
        if on_disk.as_deref() == Some(unit.checksum.as_str()) {
            out.unchanged.push(unit.name.clone());
        } else {
            out.writes.push(unit.name.clone());
        }
    }
    let removals: BTreeSet<&str> = previous
        .into_iter()
        .filter(|name| set.get(name).is_none())
        .collect();
    for name in removals {
        if unit_dir.join(name).exists() {
            out.removals.push(name.to_string());
        }
    }
    Ok(out)
}

/// Carry out `plan`. Writes happen before removals so a unit never
/// disappears while its replacement is still pending.
pub fn apply(unit_dir: &Path, set: &RenderedUnitSet, plan: &ApplyPlan) -> Result<(), SyncError> {
    if unit_dir.exists() && !unit_dir.is_dir() {
        return Err(SyncError::NotADirectory {
            path: unit_dir.to_path_buf(),
        });
    }
    for name in &plan.writes {
        let Some(unit) = set.get(name) else {
            continue;
        };
        let mode = if unit.kind == FileKind::Env {
            ENV_MODE
        } else {
            UNIT_MODE
        };
        let path = checked_join(unit_dir, name)?;
        atomic_write(&path, unit.content.as_bytes(), mode)?;
        info!(file = %name, checksum = %unit.checksum, "unit written");
    }
    for name in &plan.removals {
        let path = checked_join(unit_dir, name)?;
        if remove_if_present(&path)? {
            info!(file = %name, "unit removed");
        }
    }
    if !plan.removals.is_empty() {
        sync_dir(unit_dir);
    }
    debug!(
        written = plan.writes.len(),
        removed = plan.removals.len(),
        unchanged = plan.unchanged.len(),
        "unit directory updated"
    );
    Ok(())
}

/// Join a relative manifest/unit name onto `base`, rejecting anything that
/// could escape it.
pub(crate) fn checked_join(base: &Path, rel: &str) -> Result<PathBuf, SyncError> {
    let rel_path = Path::new(rel);
    let safe = !rel.is_empty()
        && rel_path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
    if !safe {
        return Err(SyncError::UnsafePath(rel.to_string()));
    }
    Ok(base.join(rel_path))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
