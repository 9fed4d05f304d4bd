//! Convergence Engine: one reconciliation cycle per call.
//!
//! ```text
//! Idle -> Detecting -> Rendering -> BackingUp -> Applying -> HealthChecking
//!                                                   |              |
//!                                                   v              v
//!                                   RollingBack <---+----------- Committed
//!                                        |
//!                                        +--> Degraded (halts auto-apply)
//! ```
//!
//! The ledger's `begin` is the only concurrency gate within a host; the
//! [`EngineLock`] held by [`Engine::with_lock`] keeps a second process from
//! recovering records this one still owns. Cancellation is honoured up to and
//! including `Rendering`; once `BackingUp` starts the cycle runs to a terminal
//! ledger status. A ledger error after `begin` closes the record on the spot,
//! or on the next cycle if the ledger is still refusing writes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use convoy_core::ledger::INTERRUPTED;
use convoy_core::{
    BackupSnapshot, CommitRef, ContainerStatus, DeploymentId, DeploymentRecord, DeploymentStatus,
    EngineLock, EventLevel, HealthPolicy, Ledger, LedgerError,
};
use convoy_detector::{ChangeDetector, Detection, GitSource};
use convoy_renderer::health::{container_name, pod_name};
use convoy_renderer::unit::UnitFile;
use convoy_renderer::{service_for_file, FileKind, RenderedUnitSet, Renderer};
use convoy_sync::{writer, ApplyPlan, BackupManager};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::activator::{ActivationSet, ServiceActivator};
use crate::error::EngineError;
use crate::health::{verify_all, HealthTarget, HealthVerifier, Sleeper, Verdict, Workload};
use crate::notify::Notifier;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Detecting,
    Rendering,
    BackingUp,
    Applying,
    HealthChecking,
    Committed,
    RollingBack,
    Degraded,
}

impl EngineState {
    /// A cycle in this state may stop early without touching the host.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            EngineState::Idle | EngineState::Detecting | EngineState::Rendering
        )
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Cancelled,
    NoChange { head: CommitRef },
    /// Fetch or checkout failed; retried next tick with no ledger change.
    SourceUnavailable { reason: String },
    /// The head already failed and is not retried until the source advances.
    Skipped {
        commit: CommitRef,
        status: DeploymentStatus,
    },
    /// Auto-apply is halted by an uncleared degraded deployment.
    Halted { commit: CommitRef },
    /// Another deployment holds the ledger.
    Busy { open: DeploymentId },
    ValidationFailed {
        deployment: DeploymentId,
        errors: usize,
    },
    Failed {
        deployment: DeploymentId,
        reason: String,
    },
    Committed {
        deployment: DeploymentId,
        commit: CommitRef,
        written: usize,
        removed: usize,
    },
    RolledBack {
        deployment: DeploymentId,
        reason: String,
    },
    Degraded {
        deployment: DeploymentId,
        reason: String,
    },
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Cancelled => write!(f, "cancelled"),
            CycleOutcome::NoChange { head } => write!(f, "no change (head {})", head.short()),
            CycleOutcome::SourceUnavailable { reason } => write!(f, "source unavailable: {reason}"),
            CycleOutcome::Skipped { commit, status } => {
                write!(f, "skipped {} (previous attempt {status})", commit.short())
            }
            CycleOutcome::Halted { commit } => write!(f, "halted; {} not applied", commit.short()),
            CycleOutcome::Busy { open } => write!(f, "busy (deployment {open} open)"),
            CycleOutcome::ValidationFailed { deployment, errors } => {
                write!(f, "deployment {deployment} failed validation ({errors} error(s))")
            }
            CycleOutcome::Failed { deployment, reason } => {
                write!(f, "deployment {deployment} failed: {reason}")
            }
            CycleOutcome::Committed {
                deployment,
                commit,
                written,
                removed,
            } => write!(
                f,
                "deployment {deployment} healthy at {} ({written} written, {removed} removed)",
                commit.short()
            ),
            CycleOutcome::RolledBack { deployment, reason } => {
                write!(f, "deployment {deployment} rolled back: {reason}")
            }
            CycleOutcome::Degraded { deployment, reason } => {
                write!(f, "deployment {deployment} degraded: {reason}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub unit_dir: PathBuf,
    pub retain: usize,
    pub health: HealthPolicy,
}

/// Everything one reconciliation needs, passed in explicitly.
pub struct EngineContext {
    pub ledger: Ledger,
    pub detector: ChangeDetector<Box<dyn GitSource>>,
    pub renderer: Renderer,
    pub backups: BackupManager,
    pub activator: Box<dyn ServiceActivator>,
    pub verifier: Box<dyn HealthVerifier>,
    pub notifier: Box<dyn Notifier>,
    pub sleeper: Box<dyn Sleeper>,
    pub settings: EngineSettings,
}

pub struct Engine {
    ctx: EngineContext,
    state: EngineState,
    /// Candidates already reported while halted.
    announced: BTreeSet<CommitRef>,
    /// Deployment a ledger error left open, with the reason to close it with.
    unresolved: Option<(DeploymentId, String)>,
    lock: Option<EngineLock>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

impl Engine {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            state: EngineState::Idle,
            announced: BTreeSet::new(),
            unresolved: None,
            lock: None,
        }
    }

    /// Keep `lock` for as long as this engine lives.
    pub fn with_lock(mut self, lock: EngineLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn lock(&self) -> Option<&EngineLock> {
        self.lock.as_ref()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ctx.ledger
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.ctx.settings
    }

    /// Resolve anything a previous process left open. Must run before the
    /// first cycle.
    pub fn recover(&mut self) -> Result<Option<CycleOutcome>, EngineError> {
        let recovery = self.ctx.ledger.recover_on_startup()?;
        for record in &recovery.abandoned {
            self.emit(
                Some(record.id),
                EventLevel::Warn,
                format!(
                    "deployment of {} was interrupted before apply; nothing to restore",
                    record.commit.short()
                ),
            )?;
        }
        let outcome = match recovery.rollback {
            Some(ticket) => {
                info!(
                    deployment_id = %ticket.deployment.id,
                    snapshot = %ticket.snapshot.id,
                    "recovering interrupted deployment"
                );
                Some(self.roll_back(
                    ticket.deployment.id,
                    &ticket.snapshot,
                    format!("{INTERRUPTED} mid-apply"),
                )?)
            }
            None => None,
        };
        self.settle()?;
        Ok(outcome)
    }

    /// One pass through the state machine.
    pub fn run_cycle(&mut self, cancel: &AtomicBool) -> Result<CycleOutcome, EngineError> {
        let started = Instant::now();
        let outcome = self.cycle(cancel);
        self.settle()?;
        let outcome = outcome?;
        info!(
            outcome = %outcome,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "cycle finished"
        );
        Ok(outcome)
    }

    fn cycle(&mut self, cancel: &AtomicBool) -> Result<CycleOutcome, EngineError> {
        if cancel.load(Ordering::SeqCst) {
            return Ok(CycleOutcome::Cancelled);
        }
        if let Some((id, reason)) = self.unresolved.take() {
            info!(deployment_id = %id, "closing deployment left open by a ledger error");
            if let Some(outcome) = self.close_or_defer(id, reason)? {
                return Ok(outcome);
            }
        }

        self.transition(EngineState::Detecting);
        let last = self.ctx.ledger.last_applied_ref()?;
        let (commit, changed) = match self.ctx.detector.detect(last.as_ref()) {
            Ok(Detection::NoChange { head }) => return Ok(CycleOutcome::NoChange { head }),
            Ok(Detection::Change {
                new_ref,
                changed_paths,
            }) => (new_ref, changed_paths),
            Err(e) => {
                warn!(error = %e, "source unavailable; retrying next tick");
                return Ok(CycleOutcome::SourceUnavailable {
                    reason: e.to_string(),
                });
            }
        };
        if let Some(previous) = self.ctx.ledger.latest_attempt(&commit)? {
            if is_settled_failure(&previous) {
                debug!(commit = %commit.short(), status = %previous.status, "already attempted");
                return Ok(CycleOutcome::Skipped {
                    commit,
                    status: previous.status,
                });
            }
        }
        if cancel.load(Ordering::SeqCst) {
            return Ok(CycleOutcome::Cancelled);
        }

        self.transition(EngineState::Rendering);
        let tree = match self.ctx.detector.checkout(&commit) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(commit = %commit.short(), error = %e, "checkout failed");
                return Ok(CycleOutcome::SourceUnavailable {
                    reason: e.to_string(),
                });
            }
        };
        let rendered = self.ctx.renderer.render(&tree.root, &commit);
        if cancel.load(Ordering::SeqCst) {
            return Ok(CycleOutcome::Cancelled);
        }

        if self.ctx.ledger.is_halted()? {
            let problems = match &rendered {
                Ok(result) => result.errors.len(),
                Err(_) => 1,
            };
            return self.hold(commit, problems);
        }

        let result = match rendered {
            Ok(result) => result,
            Err(e) => return self.reject(&commit, vec![e.to_string()]),
        };
        if !result.is_valid() {
            let errors = result.errors.iter().map(ToString::to_string).collect();
            return self.reject(&commit, errors);
        }

        let record = match self.begin(&commit)? {
            Ok(record) => record,
            Err(busy) => return Ok(busy),
        };
        info!(
            deployment_id = %record.id,
            commit = %commit.short(),
            changed_paths = changed.len(),
            units = result.units.len(),
            "deploying"
        );
        let id = record.id;
        let deployed = result
            .warnings
            .iter()
            .try_for_each(|warning| self.emit(Some(id), EventLevel::Warn, warning.to_string()))
            .and_then(|()| self.deploy(id, result.units));
        match deployed {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.after_ledger_error(id, e),
        }
    }

    /// `Ok(Err(Busy))` when another deployment is open.
    fn begin(
        &mut self,
        commit: &CommitRef,
    ) -> Result<Result<DeploymentRecord, CycleOutcome>, EngineError> {
        match self.ctx.ledger.begin(commit) {
            Ok(record) => Ok(Ok(record)),
            Err(LedgerError::Conflict { open, .. }) => {
                debug!(open = %open, "deployment already open; skipping cycle");
                Ok(Err(CycleOutcome::Busy { open }))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn hold(&mut self, commit: CommitRef, problems: usize) -> Result<CycleOutcome, EngineError> {
        if self.announced.insert(commit.clone()) {
            self.emit(
                None,
                EventLevel::Warn,
                format!(
                    "auto-apply halted by a degraded deployment; candidate {} ({problems} validation error(s)) not applied until cleared",
                    commit.short()
                ),
            )?;
        }
        Ok(CycleOutcome::Halted { commit })
    }

    fn reject(
        &mut self,
        commit: &CommitRef,
        errors: Vec<String>,
    ) -> Result<CycleOutcome, EngineError> {
        let record = match self.begin(commit)? {
            Ok(record) => record,
            Err(busy) => return Ok(busy),
        };
        let id = record.id;
        let recorded = errors
            .iter()
            .try_for_each(|error| self.emit(Some(id), EventLevel::Error, format!("validation: {error}")))
            .and_then(|()| {
                self.ctx
                    .ledger
                    .mark_failed(id, &format!("validation: {} error(s)", errors.len()))
                    .map_err(EngineError::from)
            });
        match recorded {
            Ok(_) => Ok(CycleOutcome::ValidationFailed {
                deployment: id,
                errors: errors.len(),
            }),
            Err(e) => self.after_ledger_error(id, e),
        }
    }

    // -----------------------------------------------------------------------
    // BackingUp .. Committed
    // -----------------------------------------------------------------------

    fn deploy(
        &mut self,
        id: DeploymentId,
        units: RenderedUnitSet,
    ) -> Result<CycleOutcome, EngineError> {
        let unit_dir = self.ctx.settings.unit_dir.clone();

        self.transition(EngineState::BackingUp);
        let snapshot = match self.ctx.backups.snapshot(&unit_dir, id) {
            Ok(snapshot) => snapshot,
            Err(e) => return self.abort(id, format!("backup failed: {e}")),
        };
        self.ctx.ledger.record_backup(id, &snapshot)?;

        self.transition(EngineState::Applying);
        let previous = self.previous_units()?;
        let plan = match writer::plan(&unit_dir, &units, previous.iter().map(String::as_str)) {
            Ok(plan) => plan,
            Err(e) => return self.abort(id, format!("could not read unit directory: {e}")),
        };
        self.ctx.ledger.mark_applying(id, &units.applied_units())?;

        let removed = services_of(plan.removals.iter().map(String::as_str));
        if let Err(e) = self.ctx.activator.deactivate(&removed) {
            return self.roll_back(id, &snapshot, format!("deactivation failed: {e}"));
        }
        if let Err(e) = writer::apply(&unit_dir, &units, &plan) {
            return self.roll_back(id, &snapshot, format!("write failed: {e}"));
        }
        if let Err(e) = self.ctx.activator.activate(&activation_for(&units, &plan)) {
            return self.roll_back(id, &snapshot, format!("activation failed: {e}"));
        }
        for unit in units.iter() {
            self.ctx
                .ledger
                .update_container(id, &unit.name, ContainerStatus::Active)?;
        }

        self.transition(EngineState::HealthChecking);
        let targets = health_targets(&units, &self.ctx.settings.health.overrides);
        let report = verify_all(
            self.ctx.verifier.as_ref(),
            &targets,
            &self.ctx.settings.health,
            self.ctx.sleeper.as_ref(),
        );
        for (unit, verdict) in &report.verdicts {
            let status = match verdict {
                Verdict::Healthy => ContainerStatus::Healthy,
                _ => ContainerStatus::Unhealthy,
            };
            self.ctx.ledger.update_container(id, unit, status)?;
        }
        if !report.is_healthy() {
            return self.roll_back(
                id,
                &snapshot,
                format!(
                    "health verification failed after {} attempt(s): {}",
                    report.attempts,
                    report.summary()
                ),
            );
        }

        self.transition(EngineState::Committed);
        let record = self.ctx.ledger.mark_healthy(id)?;
        self.emit(
            Some(id),
            EventLevel::Info,
            format!(
                "deployed {} ({} written, {} removed, {} unchanged)",
                record.commit.short(),
                plan.writes.len(),
                plan.removals.len(),
                plan.unchanged.len()
            ),
        )?;
        self.prune_backups()?;
        Ok(CycleOutcome::Committed {
            deployment: id,
            commit: record.commit,
            written: plan.writes.len(),
            removed: plan.removals.len(),
        })
    }

    /// A ledger write failed while `id` was open. Close it if the ledger
    /// lets us; the outcome of closing replaces the error. The record counts
    /// as interrupted, so its commit is attempted again.
    fn after_ledger_error(
        &mut self,
        id: DeploymentId,
        err: EngineError,
    ) -> Result<CycleOutcome, EngineError> {
        warn!(deployment_id = %id, error = %err, "ledger error mid-deployment");
        match self.close_or_defer(id, format!("{INTERRUPTED} by {err}"))? {
            Some(outcome) => Ok(outcome),
            None => Err(err),
        }
    }

    /// Bring a deployment interrupted by a ledger error to a terminal status:
    /// `pending` fails, `applying` rolls back. `Ok(None)` when it is already
    /// terminal. If the ledger still refuses, the record is retried at the
    /// start of the next cycle and the error is returned.
    fn close_or_defer(
        &mut self,
        id: DeploymentId,
        reason: String,
    ) -> Result<Option<CycleOutcome>, EngineError> {
        match self.close(id, &reason) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(deployment_id = %id, error = %e, "deployment left open; retrying next cycle");
                self.unresolved = Some((id, reason));
                Err(e)
            }
        }
    }

    fn close(&mut self, id: DeploymentId, reason: &str) -> Result<Option<CycleOutcome>, EngineError> {
        let record = self.ctx.ledger.get(id)?;
        match record.status {
            DeploymentStatus::Pending => self.abort(id, reason.to_string()).map(Some),
            DeploymentStatus::Applying => {
                let snapshot =
                    self.ctx
                        .ledger
                        .backup_for(id)?
                        .ok_or_else(|| LedgerError::Precondition {
                            id,
                            message: "applying record has no snapshot".to_string(),
                        })?;
                self.roll_back(id, &snapshot, reason.to_string()).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Fail a deployment that never reached `applying`.
    fn abort(&mut self, id: DeploymentId, reason: String) -> Result<CycleOutcome, EngineError> {
        self.emit(Some(id), EventLevel::Error, reason.clone())?;
        self.ctx.ledger.mark_failed(id, &reason)?;
        Ok(CycleOutcome::Failed {
            deployment: id,
            reason,
        })
    }

    // -----------------------------------------------------------------------
    // RollingBack
    // -----------------------------------------------------------------------

    fn roll_back(
        &mut self,
        id: DeploymentId,
        snapshot: &BackupSnapshot,
        reason: String,
    ) -> Result<CycleOutcome, EngineError> {
        self.transition(EngineState::RollingBack);
        self.emit(Some(id), EventLevel::Warn, format!("rolling back: {reason}"))?;

        match self.restore(snapshot) {
            Ok(()) => {
                for container in self.ctx.ledger.containers_for(id)? {
                    self.ctx
                        .ledger
                        .update_container(id, &container.unit, ContainerStatus::Reverted)?;
                }
                self.ctx.ledger.mark_rolled_back(id, &reason)?;
                self.emit(
                    Some(id),
                    EventLevel::Warn,
                    format!("rolled back to snapshot {}", snapshot.id),
                )?;
                self.prune_backups()?;
                Ok(CycleOutcome::RolledBack {
                    deployment: id,
                    reason,
                })
            }
            Err(failure) => {
                self.transition(EngineState::Degraded);
                let reason = format!("{reason}; rollback failed: {failure}");
                self.ctx.ledger.mark_degraded(id, &reason)?;
                self.emit(
                    Some(id),
                    EventLevel::Error,
                    format!("degraded, auto-apply halted: {reason}"),
                )?;
                Ok(CycleOutcome::Degraded {
                    deployment: id,
                    reason,
                })
            }
        }
    }

    /// Put the unit directory back and re-activate the snapshot's units.
    fn restore(&mut self, snapshot: &BackupSnapshot) -> Result<(), String> {
        let unit_dir = &self.ctx.settings.unit_dir;
        let report = self
            .ctx
            .backups
            .restore(snapshot, unit_dir)
            .map_err(|e| e.to_string())?;

        // Generated services outlive their files until the next daemon-reload.
        let stale = services_of(report.removed.iter().map(String::as_str));
        self.ctx
            .activator
            .deactivate(&stale)
            .map_err(|e| e.to_string())?;

        let ensure = workload_services(snapshot.manifest.keys().map(String::as_str));
        let support_changed = report
            .restored
            .iter()
            .any(|name| !is_workload(name));
        let restart = if support_changed {
            ensure.clone()
        } else {
            workload_services(report.restored.iter().map(String::as_str))
        };
        self.ctx
            .activator
            .activate(&ActivationSet { restart, ensure })
            .map_err(|e| e.to_string())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn previous_units(&self) -> Result<Vec<String>, EngineError> {
        let Some(last) = self.ctx.ledger.last_healthy()? else {
            return Ok(Vec::new());
        };
        Ok(self
            .ctx
            .ledger
            .containers_for(last.id)?
            .into_iter()
            .map(|c| c.unit)
            .collect())
    }

    fn prune_backups(&mut self) -> Result<(), EngineError> {
        let snapshots = self.ctx.ledger.backups()?;
        let ledger = &self.ctx.ledger;
        let pruned = self.ctx.backups.prune(&snapshots, self.ctx.settings.retain, |s| {
            ledger
                .get(s.deployment_id)
                .map(|r| r.status.is_terminal() && !r.rollback_pending)
                .unwrap_or(false)
        });
        match pruned {
            Ok(pruned) => {
                for snapshot in &pruned {
                    self.ctx.ledger.mark_backup_pruned(snapshot)?;
                }
            }
            Err(e) => warn!(error = %e, "backup retention failed"),
        }
        Ok(())
    }

    fn emit(
        &mut self,
        deployment: Option<DeploymentId>,
        level: EventLevel,
        message: String,
    ) -> Result<(), EngineError> {
        let event = self.ctx.ledger.append_event(deployment, level, &message)?;
        self.ctx.notifier.notify(&event);
        Ok(())
    }

    fn transition(&mut self, next: EngineState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "engine state");
            self.state = next;
        }
    }

    /// Park in `Degraded` while the ledger says so, otherwise `Idle`.
    fn settle(&mut self) -> Result<(), EngineError> {
        let next = if self.ctx.ledger.is_halted()? {
            EngineState::Degraded
        } else {
            self.announced.clear();
            EngineState::Idle
        };
        self.transition(next);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// A failed attempt that should not be retried at the same commit. Attempts
/// cut short by a crash are retried, whatever recovery made of them.
fn is_settled_failure(record: &DeploymentRecord) -> bool {
    let interrupted = record
        .reason
        .as_deref()
        .is_some_and(|reason| reason.starts_with(INTERRUPTED));
    match record.status {
        DeploymentStatus::Failed | DeploymentStatus::RolledBack | DeploymentStatus::Degraded => {
            !interrupted
        }
        _ => false,
    }
}

fn is_workload(name: &str) -> bool {
    FileKind::from_path(Path::new(name)).is_some_and(|k| k.starts_directly())
}

fn services_of<'a>(names: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    names.filter_map(service_for_file).collect()
}

fn workload_services<'a>(names: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    services_of(names.filter(|name| is_workload(name)))
}

/// Restart workloads whose own file or referenced environment file changed;
/// make sure every workload in the set is running.
fn activation_for(units: &RenderedUnitSet, plan: &ApplyPlan) -> ActivationSet {
    let written: BTreeSet<&str> = plan.writes.iter().map(String::as_str).collect();
    let changed_env: Vec<&str> = written
        .iter()
        .copied()
        .filter(|name| FileKind::from_path(Path::new(name)) == Some(FileKind::Env))
        .collect();

    let mut set = ActivationSet::default();
    for unit in units.workloads() {
        let Some(service) = unit.service() else {
            continue;
        };
        let env_changed = !changed_env.is_empty()
            && UnitFile::parse(&unit.content).is_ok_and(|parsed| {
                parsed.get_all("Container", "EnvironmentFile").any(|entry| {
                    let env = entry.value.trim().trim_start_matches('-').trim_start();
                    changed_env.contains(&env)
                })
            });
        if written.contains(unit.name.as_str()) || env_changed {
            set.restart.insert(service.clone());
        }
        set.ensure.insert(service);
    }
    set
}

/// Per-unit override, then the unit's own declaration, then process state.
/// Pods and kube units get the workload their kind is inspected as.
fn health_targets(
    units: &RenderedUnitSet,
    overrides: &BTreeMap<String, convoy_core::CheckSpec>,
) -> Vec<HealthTarget> {
    units
        .workloads()
        .filter_map(|unit| {
            let service = unit.service()?;
            let stem = unit.name.rsplit_once('.').map_or(unit.name.as_str(), |(s, _)| s);
            let parsed = UnitFile::parse(&unit.content).unwrap_or_default();
            let workload = match unit.kind {
                FileKind::Pod => Workload::Pod(pod_name(&parsed, stem)),
                FileKind::Kube => Workload::Kube,
                _ => Workload::Container(container_name(&parsed, stem)),
            };
            let check = overrides
                .get(&unit.name)
                .cloned()
                .or_else(|| unit.health.clone())
                .unwrap_or(convoy_core::CheckSpec::Process);
            Some(HealthTarget {
                unit: unit.name.clone(),
                service,
                workload,
                check,
            })
        })
        .collect()
}
