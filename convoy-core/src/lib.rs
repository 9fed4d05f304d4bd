//! Convoy core library: domain types, configuration, path layout and the
//! deployment ledger.
//!
//! - [`types`]: newtypes and ledger records
//! - [`config`]: typed `config.yaml` and its validation
//! - [`paths`]: `~/.convoy/` layout
//! - [`ledger`]: transactional deployment ledger
//! - [`lock`]: host-wide engine lock
//! - [`error`]: [`LedgerError`], [`LockError`], [`ConfigError`]

pub mod config;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod paths;
pub mod types;

pub use config::{Config, FieldError, HealthPolicy, ValidatedConfig, VerifierKind};
pub use error::{ConfigError, LedgerError, LockError};
pub use ledger::{Ledger, Recovery, RecoveryTicket};
pub use lock::EngineLock;
pub use types::{
    AppliedUnit, BackupSnapshot, CheckSpec, CommitRef, ContainerRecord, ContainerStatus,
    DeploymentId, DeploymentRecord, DeploymentStatus, Event, EventLevel, LedgerAggregates,
    Manifest, SnapshotId,
};
