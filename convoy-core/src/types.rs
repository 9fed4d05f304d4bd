//! Domain types for the convoy ledger and engine.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! Status enums round-trip through their `as_str` form, which is what the
//! ledger stores.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Ledger-assigned identifier of a deployment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentId(pub i64);

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for DeploymentId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A Git commit hash. Comparison is by identity only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitRef(pub String);

impl CommitRef {
    /// First eight characters, for log lines and tables.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CommitRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitRef {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a backup snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SnapshotId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Returned when a stored status string is not a known variant.
#[derive(Debug, Clone, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

/// Lifecycle status of a deployment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Applying,
    Healthy,
    Failed,
    RolledBack,
    Degraded,
}

impl DeploymentStatus {
    pub fn all() -> &'static [DeploymentStatus] {
        &[
            DeploymentStatus::Pending,
            DeploymentStatus::Applying,
            DeploymentStatus::Healthy,
            DeploymentStatus::Failed,
            DeploymentStatus::RolledBack,
            DeploymentStatus::Degraded,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Applying => "applying",
            DeploymentStatus::Healthy => "healthy",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Degraded => "degraded",
        }
    }

    /// Terminal statuses are never rewritten once stored.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Healthy
                | DeploymentStatus::Failed
                | DeploymentStatus::RolledBack
                | DeploymentStatus::Degraded
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeploymentStatus::all()
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| ParseStatusError {
                kind: "deployment status",
                value: s.to_string(),
            })
    }
}

/// Last-known status of a unit within a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Written,
    Active,
    Healthy,
    Unhealthy,
    Reverted,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Written => "written",
            ContainerStatus::Active => "active",
            ContainerStatus::Healthy => "healthy",
            ContainerStatus::Unhealthy => "unhealthy",
            ContainerStatus::Reverted => "reverted",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "written" => Ok(ContainerStatus::Written),
            "active" => Ok(ContainerStatus::Active),
            "healthy" => Ok(ContainerStatus::Healthy),
            "unhealthy" => Ok(ContainerStatus::Unhealthy),
            "reverted" => Ok(ContainerStatus::Reverted),
            other => Err(ParseStatusError {
                kind: "container status",
                value: other.to_string(),
            }),
        }
    }
}

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventLevel {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(EventLevel::Info),
            "warn" => Ok(EventLevel::Warn),
            "error" => Ok(EventLevel::Error),
            other => Err(ParseStatusError {
                kind: "event level",
                value: other.to_string(),
            }),
        }
    }
}

/// How a unit's health is verified.
///
/// Declared per unit (`[X-Health]`) or per container in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CheckSpec {
    Http {
        url: String,
    },
    Tcp {
        #[serde(default = "default_check_host")]
        host: String,
        port: u16,
    },
    Command {
        command: String,
    },
    /// Supervisor/process state only.
    Process,
}

fn default_check_host() -> String {
    "127.0.0.1".to_string()
}

impl fmt::Display for CheckSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckSpec::Http { url } => write!(f, "http {url}"),
            CheckSpec::Tcp { host, port } => write!(f, "tcp {host}:{port}"),
            CheckSpec::Command { command } => write!(f, "command `{command}`"),
            CheckSpec::Process => f.write_str("process state"),
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

/// One deployment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub commit: CommitRef,
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Set when the record enters `applying`; always after its snapshot.
    pub applied_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// A crash-recovered `failed` record still awaiting its rollback outcome.
    pub rollback_pending: bool,
}

impl DeploymentRecord {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|finished| finished - self.started_at)
    }
}

/// A unit applied as part of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: i64,
    pub deployment_id: DeploymentId,
    pub unit: String,
    pub checksum: String,
    pub status: ContainerStatus,
    pub updated_at: DateTime<Utc>,
}

/// Unit name + content checksum handed to `mark_applying`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedUnit {
    pub unit: String,
    pub checksum: String,
}

/// Relative file path -> SHA-256 hex digest of its content.
pub type Manifest = BTreeMap<String, String>;

/// Captured state of the unit directory before a deployment overwrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub id: SnapshotId,
    pub deployment_id: DeploymentId,
    pub manifest: Manifest,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pruned_at: Option<DateTime<Utc>>,
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<DeploymentId>,
    pub level: EventLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Read-only aggregates for the metrics surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerAggregates {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub rollbacks: u64,
    pub mean_duration_ms: Option<i64>,
    pub last_duration_ms: Option<i64>,
    pub last_applied: Option<CommitRef>,
    pub halted: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
