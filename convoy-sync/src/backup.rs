//! Content-addressed snapshots of the unit directory.
//!
//! # Storage layout
//!
//! ```text
//! <backup_dir>/
//!   objects/<sha256>          file bodies, stored once (mode 0600)
//!   snapshots/<id>.json       manifest: relative path -> sha256
//! ```
//!
//! A snapshot is complete once its manifest is renamed into place; objects
//! are always written first. Restore verifies every object before touching
//! the target directory, so a damaged store never produces a half-restore.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use convoy_core::{paths::ensure_private_dir, BackupSnapshot, DeploymentId, Manifest, SnapshotId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{io_err, SyncError};
use crate::writer::{
    atomic_write, checked_join, remove_if_present, sha256_hex, sync_dir, TMP_SUFFIX,
};

const OBJECT_MODE: u32 = 0o600;

/// On-disk manifest document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ManifestDoc {
    id: SnapshotId,
    deployment_id: DeploymentId,
    created_at: chrono::DateTime<Utc>,
    files: Manifest,
}

/// What a restore changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub removed: Vec<String>,
}

impl RestoreReport {
    /// Files whose content or presence changed; their services need a restart.
    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.restored
            .iter()
            .chain(self.removed.iter())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    fn object_path(&self, digest: &str) -> PathBuf {
        self.objects_dir().join(digest)
    }

    fn manifest_path(&self, id: &SnapshotId) -> PathBuf {
        self.snapshots_dir().join(format!("{}.json", id.0))
    }

    /// Snapshot ids are derived from the owning deployment, which the ledger
    /// never reuses.
    pub fn snapshot_id_for(deployment: DeploymentId) -> SnapshotId {
        SnapshotId(format!("deploy-{:08}", deployment.0))
    }

    // -----------------------------------------------------------------------
    // snapshot
    // -----------------------------------------------------------------------

    /// Capture every file under `target_dir` (an absent directory captures as
    /// empty). Durable on return.
    pub fn snapshot(
        &self,
        target_dir: &Path,
        deployment: DeploymentId,
    ) -> Result<BackupSnapshot, SyncError> {
        let objects = self.objects_dir();
        let snapshots = self.snapshots_dir();
        ensure_private_dir(&objects).map_err(|e| io_err(&objects, e))?;
        ensure_private_dir(&snapshots).map_err(|e| io_err(&snapshots, e))?;

        let mut files = Vec::new();
        if target_dir.exists() {
            walk(target_dir, target_dir, &mut files)?;
        }
        files.sort();

        let mut manifest = Manifest::new();
        let mut stored = 0usize;
        for rel in files {
            let path = target_dir.join(&rel);
            let bytes = std::fs::read(&path).map_err(|e| io_err(&path, e))?;
            let digest = sha256_hex(&bytes);
            let object = self.object_path(&digest);
            if !object.exists() {
                atomic_write(&object, &bytes, OBJECT_MODE)?;
                stored += 1;
            }
            manifest.insert(rel, digest);
        }

        let id = Self::snapshot_id_for(deployment);
        let doc = ManifestDoc {
            id: id.clone(),
            deployment_id: deployment,
            created_at: Utc::now(),
            files: manifest,
        };
        let json = serde_json::to_vec_pretty(&doc)?;
        atomic_write(&self.manifest_path(&id), &json, OBJECT_MODE)?;

        info!(
            snapshot = %id,
            files = doc.files.len(),
            new_objects = stored,
            "snapshot taken"
        );
        Ok(BackupSnapshot {
            id,
            deployment_id: deployment,
            manifest: doc.files,
            created_at: doc.created_at,
            pruned_at: None,
        })
    }

    /// Read a manifest back from disk.
    pub fn load(&self, id: &SnapshotId) -> Result<Option<BackupSnapshot>, SyncError> {
        let path = self.manifest_path(id);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path, e)),
        };
        let doc: ManifestDoc = serde_json::from_slice(&bytes)?;
        Ok(Some(BackupSnapshot {
            id: doc.id,
            deployment_id: doc.deployment_id,
            manifest: doc.files,
            created_at: doc.created_at,
            pruned_at: None,
        }))
    }

    // -----------------------------------------------------------------------
    // restore
    // -----------------------------------------------------------------------

    /// Make `target_dir` byte-identical to `snapshot`: same file set, same
    /// content. Files created after the snapshot are removed.
    pub fn restore(
        &self,
        snapshot: &BackupSnapshot,
        target_dir: &Path,
    ) -> Result<RestoreReport, SyncError> {
        // Verify everything first.
        let mut bodies: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
        for (rel, digest) in &snapshot.manifest {
            checked_join(target_dir, rel)?;
            let object = self.object_path(digest);
            let bytes = match std::fs::read(&object) {
                Ok(b) => b,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(SyncError::MissingObject {
                        snapshot: snapshot.id.clone(),
                        file: rel.clone(),
                        digest: digest.clone(),
                    })
                }
                Err(e) => return Err(io_err(&object, e)),
            };
            let actual = sha256_hex(&bytes);
            if &actual != digest {
                return Err(SyncError::Integrity {
                    snapshot: snapshot.id.clone(),
                    file: rel.clone(),
                    expected: digest.clone(),
                    actual,
                });
            }
            bodies.insert(rel.as_str(), bytes);
        }

        let mut report = RestoreReport::default();
        std::fs::create_dir_all(target_dir).map_err(|e| io_err(target_dir, e))?;

        for (rel, bytes) in &bodies {
            let path = checked_join(target_dir, rel)?;
            let current = match std::fs::read(&path) {
                Ok(b) => Some(b),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(io_err(&path, e)),
            };
            if current.as_deref() == Some(bytes.as_slice()) {
                continue;
            }
            let mode = existing_mode(&path).unwrap_or(if rel.ends_with(".env") {
                0o600
            } else {
                0o644
            });
            atomic_write(&path, bytes, mode)?;
            report.restored.push((*rel).to_string());
        }

        let mut present = Vec::new();
        walk(target_dir, target_dir, &mut present)?;
        for rel in present {
            if snapshot.manifest.contains_key(&rel) {
                continue;
            }
            let path = target_dir.join(&rel);
            if remove_if_present(&path)? {
                report.removed.push(rel);
            }
        }
        if !report.removed.is_empty() {
            sync_dir(target_dir);
        }

        info!(
            snapshot = %snapshot.id,
            restored = report.restored.len(),
            removed = report.removed.len(),
            "snapshot restored"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // retention
    // -----------------------------------------------------------------------

    /// Drop the oldest snapshots beyond `retain`, skipping any whose owning
    /// deployment is not yet terminal, then garbage-collect objects.
    ///
    /// `snapshots` must be ordered oldest first. Returns the pruned ids.
    pub fn prune<F>(
        &self,
        snapshots: &[BackupSnapshot],
        retain: usize,
        owner_terminal: F,
    ) -> Result<Vec<SnapshotId>, SyncError>
    where
        F: Fn(&BackupSnapshot) -> bool,
    {
        let live: Vec<&BackupSnapshot> = snapshots.iter().filter(|s| s.pruned_at.is_none()).collect();
        let excess = live.len().saturating_sub(retain);
        let mut pruned = Vec::new();
        for snapshot in live.into_iter().take(excess) {
            if !owner_terminal(snapshot) {
                debug!(snapshot = %snapshot.id, "owner still open; keeping");
                continue;
            }
            remove_if_present(&self.manifest_path(&snapshot.id))?;
            pruned.push(snapshot.id.clone());
        }
        if !pruned.is_empty() {
            let collected = self.gc()?;
            info!(pruned = pruned.len(), objects = collected, "snapshots pruned");
        }
        Ok(pruned)
    }

    /// Delete objects no manifest references. Returns how many were removed.
    pub fn gc(&self) -> Result<usize, SyncError> {
        let snapshots = self.snapshots_dir();
        let objects = self.objects_dir();
        if !objects.exists() {
            return Ok(0);
        }
        let mut referenced = BTreeSet::new();
        if snapshots.exists() {
            for entry in read_dir(&snapshots)? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let bytes = std::fs::read(&path).map_err(|e| io_err(&path, e))?;
                match serde_json::from_slice::<ManifestDoc>(&bytes) {
                    Ok(doc) => referenced.extend(doc.files.into_values()),
                    Err(e) => {
                        // Unreadable manifest: keep every object rather than guess.
                        warn!(manifest = %path.display(), error = %e, "skipping gc");
                        return Ok(0);
                    }
                }
            }
        }
        let mut removed = 0;
        for entry in read_dir(&objects)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !referenced.contains(&name) && remove_if_present(&entry.path())? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn read_dir(dir: &Path) -> Result<Vec<std::fs::DirEntry>, SyncError> {
    std::fs::read_dir(dir)
        .map_err(|e| io_err(dir, e))?
        .map(|entry| entry.map_err(|e| io_err(dir, e)))
        .collect()
}

/// Relative paths (with `/` separators) of every regular file under `dir`,
/// ignoring in-flight temp files.
fn walk(base: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), SyncError> {
    for entry in read_dir(dir)? {
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| io_err(&path, e))?;
        if file_type.is_dir() {
            walk(base, &path, out)?;
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(TMP_SUFFIX) {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(base) {
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(parts.join("/"));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn existing_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn existing_mode(_path: &Path) -> Option<u32> {
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
