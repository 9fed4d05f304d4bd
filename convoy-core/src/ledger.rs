//! Durable deployment ledger backed by SQLite.
//!
//! # Invariants
//!
//! - At most one deployment is non-terminal (`pending`/`applying`). The
//!   `open_slot` column is `1` while a record is open and `NULL` afterwards;
//!   its `UNIQUE` constraint makes a second open record impossible even if two
//!   processes race past the check in [`Ledger::begin`].
//! - Terminal records are immutable; a trigger rejects any later status
//!   change. The one exception is a crash-recovered `failed` record with
//!   `rollback_pending = 1`, which resolves to `rolled_back` or `degraded`.
//! - A record enters `applying` only with a stored snapshot, and its
//!   `applied_at` is strictly later than the snapshot's `created_at`.
//! - Events are append-only.
//!
//! Every mutating call runs in one `BEGIN IMMEDIATE` transaction, so it either
//! fully applies or leaves the database untouched.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{
    params, Connection, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::paths;
use crate::types::{
    AppliedUnit, BackupSnapshot, CommitRef, ContainerRecord, ContainerStatus, DeploymentId,
    DeploymentRecord, DeploymentStatus, Event, EventLevel, LedgerAggregates, SnapshotId,
};

/// Reason recorded on deployments interrupted by a process crash.
pub const INTERRUPTED: &str = "interrupted";

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS deployments (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    commit_ref       TEXT    NOT NULL,
    status           TEXT    NOT NULL,
    reason           TEXT,
    started_at       TEXT    NOT NULL,
    applied_at       TEXT,
    finished_at      TEXT,
    rollback_pending INTEGER NOT NULL DEFAULT 0,
    open_slot        INTEGER UNIQUE CHECK (open_slot IS NULL OR open_slot = 1)
);
CREATE INDEX IF NOT EXISTS deployments_commit ON deployments (commit_ref);

CREATE TABLE IF NOT EXISTS containers (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    deployment_id INTEGER NOT NULL REFERENCES deployments (id),
    unit          TEXT    NOT NULL,
    checksum      TEXT    NOT NULL,
    status        TEXT    NOT NULL,
    updated_at    TEXT    NOT NULL,
    UNIQUE (deployment_id, unit)
);

CREATE TABLE IF NOT EXISTS backups (
    id            TEXT    PRIMARY KEY,
    deployment_id INTEGER NOT NULL UNIQUE REFERENCES deployments (id),
    manifest      TEXT    NOT NULL,
    created_at    TEXT    NOT NULL,
    pruned_at     TEXT
);

CREATE TABLE IF NOT EXISTS events (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    deployment_id INTEGER REFERENCES deployments (id),
    level         TEXT    NOT NULL,
    message       TEXT    NOT NULL,
    created_at    TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS interventions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    deployment_id INTEGER NOT NULL REFERENCES deployments (id),
    note          TEXT,
    created_at    TEXT    NOT NULL
);

CREATE TRIGGER IF NOT EXISTS deployments_terminal_immutable
BEFORE UPDATE ON deployments
WHEN OLD.status IN ('healthy', 'rolled_back', 'degraded')
  OR (OLD.status = 'failed' AND OLD.rollback_pending = 0)
BEGIN
    SELECT RAISE(ABORT, 'terminal deployment records are immutable');
END;

CREATE TRIGGER IF NOT EXISTS events_append_only
BEFORE UPDATE ON events
BEGIN
    SELECT RAISE(ABORT, 'events are append-only');
END;
"#;

const DEPLOYMENT_COLUMNS: &str = "id, commit_ref, status, reason, started_at, applied_at, finished_at, rollback_pending";

/// A deployment left mid-apply by a crash, with the snapshot to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryTicket {
    pub deployment: DeploymentRecord,
    pub snapshot: BackupSnapshot,
}

/// What `recover_on_startup` found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Interrupted before any unit write; closed as `failed`, nothing to undo.
    pub abandoned: Vec<DeploymentRecord>,
    /// Interrupted mid-apply; the caller must restore and then resolve it.
    pub rollback: Option<RecoveryTicket>,
}

pub struct Ledger {
    conn: Connection,
    path: PathBuf,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("path", &self.path).finish()
    }
}

// ---------------------------------------------------------------------------
// 1. Open
// ---------------------------------------------------------------------------

impl Ledger {
    /// Open (creating if needed) the ledger at `path` and verify its integrity.
    ///
    /// Returns `LedgerError::Corrupt` when the file is not a database or
    /// fails `PRAGMA quick_check`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            paths::ensure_private_dir(parent).map_err(|source| LedgerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let fresh = !path.exists();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(|e| corrupt_or(path, e))?;
        if fresh {
            paths::set_mode(path, 0o600).map_err(|source| LedgerError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let ledger = Self::init(conn, path.to_path_buf())?;
        debug!(path = %path.display(), "ledger opened");
        Ok(ledger)
    }

    /// Private in-memory ledger, for tests and dry runs.
    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self, LedgerError> {
        conn.busy_timeout(Duration::from_secs(10))?;
        let check: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| corrupt_or(&path, e))?;
        if check != "ok" {
            return Err(LedgerError::Corrupt {
                path,
                detail: check,
            });
        }
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        if path.as_os_str() != ":memory:" {
            // WAL lets readers (status, metrics) proceed during a cycle.
            let _mode: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        }

        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(LedgerError::Corrupt {
                path,
                detail: format!("schema version {version} is newer than supported {SCHEMA_VERSION}"),
            });
        }
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How long a write waits on another connection's lock before failing
    /// with `SQLITE_BUSY`. Ten seconds unless changed.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), LedgerError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    fn immediate(&mut self) -> Result<Transaction<'_>, LedgerError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

fn corrupt_or(path: &Path, e: rusqlite::Error) -> LedgerError {
    match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::NotADatabase) | Some(rusqlite::ErrorCode::DatabaseCorrupt) => {
            LedgerError::Corrupt {
                path: path.to_path_buf(),
                detail: e.to_string(),
            }
        }
        _ => LedgerError::Sqlite(e),
    }
}

// ---------------------------------------------------------------------------
// 2. Deployment lifecycle
// ---------------------------------------------------------------------------

impl Ledger {
    /// Open a new `pending` deployment for `commit`.
    ///
    /// Sole concurrency gate: fails with `Conflict` while any record is
    /// non-terminal.
    pub fn begin(&mut self, commit: &CommitRef) -> Result<DeploymentRecord, LedgerError> {
        let tx = self.immediate()?;
        if let Some(open) = open_record(&tx)? {
            return Err(LedgerError::Conflict {
                open: open.id,
                status: open.status,
            });
        }
        let now = Utc::now();
        let inserted = tx.execute(
            "INSERT INTO deployments (commit_ref, status, started_at, open_slot)
             VALUES (?1, ?2, ?3, 1)",
            params![commit.0, DeploymentStatus::Pending.as_str(), now],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint(&e) => {
                let open = open_record(&tx)?;
                return Err(match open {
                    Some(open) => LedgerError::Conflict {
                        open: open.id,
                        status: open.status,
                    },
                    None => LedgerError::Sqlite(e),
                });
            }
            Err(e) => return Err(e.into()),
        }
        let id = DeploymentId(tx.last_insert_rowid());
        let record = fetch(&tx, id)?;
        tx.commit()?;
        info!(deployment_id = %id, commit = %commit.short(), "deployment started");
        Ok(record)
    }

    /// Durably associate the pre-apply snapshot with a `pending` deployment.
    pub fn record_backup(
        &mut self,
        id: DeploymentId,
        snapshot: &BackupSnapshot,
    ) -> Result<(), LedgerError> {
        let tx = self.immediate()?;
        let current = fetch(&tx, id)?;
        if current.status != DeploymentStatus::Pending {
            return Err(LedgerError::InvalidTransition {
                id,
                from: current.status,
                to: DeploymentStatus::Pending,
            });
        }
        if snapshot.deployment_id != id {
            return Err(LedgerError::Precondition {
                id,
                message: format!("snapshot {} belongs to deployment {}", snapshot.id, snapshot.deployment_id),
            });
        }
        if backup_row(&tx, id)?.is_some() {
            return Err(LedgerError::Precondition {
                id,
                message: "a snapshot is already recorded".to_string(),
            });
        }
        let manifest = serde_json::to_string(&snapshot.manifest)?;
        tx.execute(
            "INSERT INTO backups (id, deployment_id, manifest, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![snapshot.id.0, id.0, manifest, snapshot.created_at],
        )?;
        tx.commit()?;
        debug!(deployment_id = %id, snapshot = %snapshot.id, files = snapshot.manifest.len(), "backup recorded");
        Ok(())
    }

    /// `pending` -> `applying`, recording the unit set about to be written.
    ///
    /// Requires a recorded snapshot; must be called before the first write.
    pub fn mark_applying(
        &mut self,
        id: DeploymentId,
        units: &[AppliedUnit],
    ) -> Result<DeploymentRecord, LedgerError> {
        let tx = self.immediate()?;
        let current = fetch(&tx, id)?;
        ensure_from(&current, &[DeploymentStatus::Pending], DeploymentStatus::Applying)?;
        let backup = backup_row(&tx, id)?.ok_or_else(|| LedgerError::Precondition {
            id,
            message: "no backup snapshot recorded before apply".to_string(),
        })?;

        let floor = backup.created_at + chrono::Duration::microseconds(1);
        let applied_at = Utc::now().max(floor);
        tx.execute(
            "UPDATE deployments SET status = ?2, applied_at = ?3 WHERE id = ?1",
            params![id.0, DeploymentStatus::Applying.as_str(), applied_at],
        )?;
        for unit in units {
            tx.execute(
                "INSERT INTO containers (deployment_id, unit, checksum, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.0, unit.unit, unit.checksum, ContainerStatus::Written.as_str(), applied_at],
            )?;
        }
        let record = fetch(&tx, id)?;
        tx.commit()?;
        info!(deployment_id = %id, units = units.len(), "deployment applying");
        Ok(record)
    }

    /// `applying` -> `healthy`. The commit becomes `last_applied_ref`.
    pub fn mark_healthy(&mut self, id: DeploymentId) -> Result<DeploymentRecord, LedgerError> {
        self.finish(id, &[DeploymentStatus::Applying], DeploymentStatus::Healthy, None, false)
    }

    /// `pending`/`applying` -> `failed`.
    pub fn mark_failed(
        &mut self,
        id: DeploymentId,
        reason: &str,
    ) -> Result<DeploymentRecord, LedgerError> {
        self.finish(
            id,
            &[DeploymentStatus::Pending, DeploymentStatus::Applying],
            DeploymentStatus::Failed,
            Some(reason),
            false,
        )
    }

    /// `applying` (or a crash-recovered `failed`) -> `rolled_back`, recording
    /// why the deployment was reverted.
    pub fn mark_rolled_back(
        &mut self,
        id: DeploymentId,
        reason: &str,
    ) -> Result<DeploymentRecord, LedgerError> {
        self.finish(
            id,
            &[DeploymentStatus::Applying],
            DeploymentStatus::RolledBack,
            Some(reason),
            true,
        )
    }

    /// `applying` (or a crash-recovered `failed`) -> `degraded`. Halts auto-apply.
    pub fn mark_degraded(
        &mut self,
        id: DeploymentId,
        reason: &str,
    ) -> Result<DeploymentRecord, LedgerError> {
        self.finish(
            id,
            &[DeploymentStatus::Applying],
            DeploymentStatus::Degraded,
            Some(reason),
            true,
        )
    }

    fn finish(
        &mut self,
        id: DeploymentId,
        from: &[DeploymentStatus],
        to: DeploymentStatus,
        reason: Option<&str>,
        resolves_recovery: bool,
    ) -> Result<DeploymentRecord, LedgerError> {
        let tx = self.immediate()?;
        let current = fetch(&tx, id)?;
        let recovering = resolves_recovery
            && current.status == DeploymentStatus::Failed
            && current.rollback_pending;
        if !recovering {
            ensure_from(&current, from, to)?;
        }
        tx.execute(
            "UPDATE deployments
                SET status = ?2,
                    reason = COALESCE(?3, reason),
                    finished_at = ?4,
                    rollback_pending = 0,
                    open_slot = NULL
              WHERE id = ?1",
            params![id.0, to.as_str(), reason, Utc::now()],
        )?;
        let record = fetch(&tx, id)?;
        tx.commit()?;
        info!(deployment_id = %id, status = %to, reason = reason.unwrap_or(""), "deployment finished");
        Ok(record)
    }

    /// Update the last-known status of one unit in a deployment.
    pub fn update_container(
        &mut self,
        id: DeploymentId,
        unit: &str,
        status: ContainerStatus,
    ) -> Result<(), LedgerError> {
        let tx = self.immediate()?;
        let changed = tx.execute(
            "UPDATE containers SET status = ?3, updated_at = ?4 WHERE deployment_id = ?1 AND unit = ?2",
            params![id.0, unit, status.as_str(), Utc::now()],
        )?;
        if changed == 0 {
            return Err(LedgerError::Precondition {
                id,
                message: format!("unit '{unit}' is not part of this deployment"),
            });
        }
        tx.commit()?;
        Ok(())
    }

    /// Close out whatever a previous process left open.
    ///
    /// `pending` records never wrote anything and are simply failed. An
    /// `applying` record becomes `failed` with `rollback_pending` set and is
    /// returned with its snapshot so the caller can restore it and then call
    /// `mark_rolled_back`/`mark_degraded`. A `failed` record that is still
    /// `rollback_pending` (crash during a previous recovery) is returned again.
    pub fn recover_on_startup(&mut self) -> Result<Recovery, LedgerError> {
        let tx = self.immediate()?;
        let mut recovery = Recovery::default();
        let now = Utc::now();

        let stuck = query_deployments(
            &tx,
            "WHERE status IN ('pending', 'applying') OR (status = 'failed' AND rollback_pending = 1)
             ORDER BY id",
            [],
        )?;
        for record in stuck {
            match record.status {
                DeploymentStatus::Pending => {
                    tx.execute(
                        "UPDATE deployments SET status = 'failed', reason = ?2, finished_at = ?3, open_slot = NULL
                          WHERE id = ?1",
                        params![record.id.0, INTERRUPTED, now],
                    )?;
                    warn!(deployment_id = %record.id, "interrupted before apply; marked failed");
                    recovery.abandoned.push(fetch(&tx, record.id)?);
                }
                DeploymentStatus::Applying | DeploymentStatus::Failed => {
                    if record.status == DeploymentStatus::Applying {
                        tx.execute(
                            "UPDATE deployments
                                SET status = 'failed', reason = ?2, finished_at = ?3, rollback_pending = 1
                              WHERE id = ?1",
                            params![record.id.0, INTERRUPTED, now],
                        )?;
                        warn!(deployment_id = %record.id, "interrupted mid-apply; rollback required");
                    }
                    let snapshot = backup_row(&tx, record.id)?.ok_or_else(|| LedgerError::Precondition {
                        id: record.id,
                        message: "applying record has no snapshot".to_string(),
                    })?;
                    recovery.rollback = Some(RecoveryTicket {
                        deployment: fetch(&tx, record.id)?,
                        snapshot,
                    });
                }
                _ => {}
            }
        }
        tx.commit()?;
        Ok(recovery)
    }

    /// Record that a snapshot's files were removed by retention.
    pub fn mark_backup_pruned(&mut self, snapshot: &SnapshotId) -> Result<(), LedgerError> {
        let tx = self.immediate()?;
        tx.execute(
            "UPDATE backups SET pruned_at = ?2 WHERE id = ?1 AND pruned_at IS NULL",
            params![snapshot.0, Utc::now()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Persist an audit event.
    pub fn append_event(
        &mut self,
        deployment: Option<DeploymentId>,
        level: EventLevel,
        message: &str,
    ) -> Result<Event, LedgerError> {
        let tx = self.immediate()?;
        let now = Utc::now();
        tx.execute(
            "INSERT INTO events (deployment_id, level, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![deployment.map(|d| d.0), level.as_str(), message, now],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Event {
            id,
            deployment_id: deployment,
            level,
            message: message.to_string(),
            created_at: now,
        })
    }

    /// Acknowledge the latest `degraded` deployment, lifting the auto-apply halt.
    ///
    /// Returns the acknowledged deployment, or `None` if nothing was halted.
    pub fn clear_degraded(&mut self, note: Option<&str>) -> Result<Option<DeploymentId>, LedgerError> {
        let tx = self.immediate()?;
        let Some(id) = halting_deployment(&tx)? else {
            return Ok(None);
        };
        tx.execute(
            "INSERT INTO interventions (deployment_id, note, created_at) VALUES (?1, ?2, ?3)",
            params![id.0, note, Utc::now()],
        )?;
        tx.commit()?;
        info!(deployment_id = %id, "degraded halt cleared");
        Ok(Some(id))
    }
}

// ---------------------------------------------------------------------------
// 3. Reads
// ---------------------------------------------------------------------------

impl Ledger {
    pub fn get(&self, id: DeploymentId) -> Result<DeploymentRecord, LedgerError> {
        fetch(&self.conn, id)
    }

    /// The non-terminal record, if any.
    pub fn open_deployment(&self) -> Result<Option<DeploymentRecord>, LedgerError> {
        open_record(&self.conn)
    }

    /// Commit of the newest `healthy` deployment.
    pub fn last_applied_ref(&self) -> Result<Option<CommitRef>, LedgerError> {
        Ok(self
            .conn
            .query_row(
                "SELECT commit_ref FROM deployments WHERE status = 'healthy' ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(CommitRef))
    }

    /// Newest `healthy` deployment.
    pub fn last_healthy(&self) -> Result<Option<DeploymentRecord>, LedgerError> {
        Ok(query_deployments(
            &self.conn,
            "WHERE status = 'healthy' ORDER BY id DESC LIMIT 1",
            [],
        )?
        .pop())
    }

    /// Newest attempt for `commit`, whatever its outcome.
    pub fn latest_attempt(&self, commit: &CommitRef) -> Result<Option<DeploymentRecord>, LedgerError> {
        Ok(query_deployments(
            &self.conn,
            "WHERE commit_ref = ?1 ORDER BY id DESC LIMIT 1",
            [&commit.0],
        )?
        .pop())
    }

    /// Newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<DeploymentRecord>, LedgerError> {
        query_deployments(
            &self.conn,
            "ORDER BY id DESC LIMIT ?1",
            [i64::try_from(limit).unwrap_or(i64::MAX)],
        )
    }

    pub fn containers_for(&self, id: DeploymentId) -> Result<Vec<ContainerRecord>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, deployment_id, unit, checksum, status, updated_at
               FROM containers WHERE deployment_id = ?1 ORDER BY unit",
        )?;
        let rows = stmt.query_map([id.0], container_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn backup_for(&self, id: DeploymentId) -> Result<Option<BackupSnapshot>, LedgerError> {
        backup_row(&self.conn, id)
    }

    /// Every snapshot, oldest first.
    pub fn backups(&self) -> Result<Vec<BackupSnapshot>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, deployment_id, manifest, created_at, pruned_at FROM backups ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], raw_backup_from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw?.decode()?);
        }
        Ok(out)
    }

    /// Newest first.
    pub fn events(&self, limit: usize) -> Result<Vec<Event>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, deployment_id, level, message, created_at FROM events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            Ok(Event {
                id: row.get(0)?,
                deployment_id: row.get::<_, Option<i64>>(1)?.map(DeploymentId),
                level: parse_column(row, 2)?,
                message: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// True while the latest `degraded` deployment has not been acknowledged.
    pub fn is_halted(&self) -> Result<bool, LedgerError> {
        Ok(halting_deployment(&self.conn)?.is_some())
    }

    pub fn aggregates(&self) -> Result<LedgerAggregates, LedgerError> {
        let mut agg = LedgerAggregates::default();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT status, COUNT(*) FROM deployments GROUP BY status")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (status, count) = row?;
                let count = u64::try_from(count).unwrap_or(0);
                agg.total += count;
                agg.by_status.insert(status, count);
            }
        }
        agg.rollbacks = agg
            .by_status
            .get(DeploymentStatus::RolledBack.as_str())
            .copied()
            .unwrap_or(0)
            + agg
                .by_status
                .get(DeploymentStatus::Degraded.as_str())
                .copied()
                .unwrap_or(0);

        let finished = query_deployments(
            &self.conn,
            "WHERE finished_at IS NOT NULL ORDER BY id",
            [],
        )?;
        let durations: Vec<i64> = finished
            .iter()
            .filter_map(|r| r.duration())
            .map(|d| d.num_milliseconds())
            .collect();
        if !durations.is_empty() {
            let len = i64::try_from(durations.len()).unwrap_or(i64::MAX);
            agg.mean_duration_ms = Some(durations.iter().sum::<i64>() / len);
            agg.last_duration_ms = durations.last().copied();
        }
        agg.last_applied = self.last_applied_ref()?;
        agg.halted = self.is_halted()?;
        Ok(agg)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn ensure_from(
    current: &DeploymentRecord,
    allowed: &[DeploymentStatus],
    to: DeploymentStatus,
) -> Result<(), LedgerError> {
    if allowed.contains(&current.status) {
        Ok(())
    } else {
        Err(LedgerError::InvalidTransition {
            id: current.id,
            from: current.status,
            to,
        })
    }
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = crate::types::ParseStatusError>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<DeploymentRecord> {
    Ok(DeploymentRecord {
        id: DeploymentId(row.get(0)?),
        commit: CommitRef(row.get(1)?),
        status: parse_column(row, 2)?,
        reason: row.get(3)?,
        started_at: row.get(4)?,
        applied_at: row.get(5)?,
        finished_at: row.get(6)?,
        rollback_pending: row.get(7)?,
    })
}

fn container_from_row(row: &Row<'_>) -> rusqlite::Result<ContainerRecord> {
    Ok(ContainerRecord {
        id: row.get(0)?,
        deployment_id: DeploymentId(row.get(1)?),
        unit: row.get(2)?,
        checksum: row.get(3)?,
        status: parse_column(row, 4)?,
        updated_at: row.get(5)?,
    })
}

fn query_deployments<P: rusqlite::Params>(
    conn: &Connection,
    tail: &str,
    params: P,
) -> Result<Vec<DeploymentRecord>, LedgerError> {
    let sql = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments {tail}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, deployment_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn fetch(conn: &Connection, id: DeploymentId) -> Result<DeploymentRecord, LedgerError> {
    query_deployments(conn, "WHERE id = ?1", [id.0])?
        .pop()
        .ok_or(LedgerError::NotFound(id))
}

fn open_record(conn: &Connection) -> Result<Option<DeploymentRecord>, LedgerError> {
    Ok(query_deployments(conn, "WHERE open_slot = 1", [])?.pop())
}

fn halting_deployment(conn: &Connection) -> Result<Option<DeploymentId>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT d.id FROM deployments d
              WHERE d.status = 'degraded'
                AND NOT EXISTS (SELECT 1 FROM interventions i WHERE i.deployment_id = d.id)
              ORDER BY d.id DESC LIMIT 1",
            [],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .map(DeploymentId))
}

struct RawBackup {
    id: String,
    deployment_id: i64,
    manifest: String,
    created_at: DateTime<Utc>,
    pruned_at: Option<DateTime<Utc>>,
}

impl RawBackup {
    fn decode(self) -> Result<BackupSnapshot, LedgerError> {
        Ok(BackupSnapshot {
            id: SnapshotId(self.id),
            deployment_id: DeploymentId(self.deployment_id),
            manifest: serde_json::from_str(&self.manifest)?,
            created_at: self.created_at,
            pruned_at: self.pruned_at,
        })
    }
}

fn raw_backup_from_row(row: &Row<'_>) -> rusqlite::Result<RawBackup> {
    Ok(RawBackup {
        id: row.get(0)?,
        deployment_id: row.get(1)?,
        manifest: row.get(2)?,
        created_at: row.get(3)?,
        pruned_at: row.get(4)?,
    })
}

fn backup_row(conn: &Connection, id: DeploymentId) -> Result<Option<BackupSnapshot>, LedgerError> {
    conn.query_row(
        "SELECT id, deployment_id, manifest, created_at, pruned_at FROM backups WHERE deployment_id = ?1",
        [id.0],
        raw_backup_from_row,
    )
    .optional()?
    .map(RawBackup::decode)
    .transpose()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
