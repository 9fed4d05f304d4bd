//! End-to-end reconciliation cycles against scripted collaborators: a Git
//! source backed by temp directories, a recording activator and a verifier
//! whose verdict the test controls. The activator can also grab the ledger's
//! write lock mid-deployment to make the engine's own writes fail.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use convoy_core::{
    AppliedUnit, CommitRef, DeploymentId, DeploymentStatus, EventLevel, HealthPolicy, Ledger,
};
use convoy_daemon::{
    ActivationError, ActivationSet, CycleOutcome, Engine, EngineContext, EngineSettings,
    HealthTarget, HealthVerifier, ServiceActivator, Sleeper, TracingNotifier, Verdict,
};
use convoy_detector::{ChangeDetector, DetectError, GitSource, WorkingTree};
use convoy_renderer::{HostEnv, Renderer};
use convoy_sync::BackupManager;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Repo {
    head: Option<CommitRef>,
    trees: BTreeMap<CommitRef, BTreeMap<String, String>>,
    offline: bool,
}

struct TreeSource {
    repo: Arc<Mutex<Repo>>,
    checkouts: PathBuf,
}

impl GitSource for TreeSource {
    fn fetch(&mut self, branch: &str) -> Result<CommitRef, DetectError> {
        let repo = self.repo.lock().unwrap();
        if repo.offline {
            return Err(DetectError::Transient {
                branch: branch.to_string(),
                message: "network unreachable".to_string(),
            });
        }
        repo.head
            .clone()
            .ok_or_else(|| DetectError::BadCommit("empty repository".to_string()))
    }

    fn checkout(&mut self, commit: &CommitRef) -> Result<WorkingTree, DetectError> {
        let repo = self.repo.lock().unwrap();
        let files = repo
            .trees
            .get(commit)
            .ok_or_else(|| DetectError::BadCommit(commit.to_string()))?;
        let root = self.checkouts.join(&commit.0);
        let units = root.join("units");
        fs::create_dir_all(&units).unwrap();
        for (name, content) in files {
            fs::write(units.join(name), content).unwrap();
        }
        Ok(WorkingTree {
            root,
            commit: commit.clone(),
        })
    }

    fn changed_paths(
        &self,
        _from: Option<&CommitRef>,
        to: &CommitRef,
    ) -> Result<Vec<PathBuf>, DetectError> {
        let repo = self.repo.lock().unwrap();
        Ok(repo
            .trees
            .get(to)
            .map(|files| files.keys().map(|n| Path::new("units").join(n)).collect())
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct ActivatorLog {
    calls: Vec<String>,
    fail: bool,
    /// On the next `activate`, open this ledger and hold its write lock.
    lock_ledger: Option<PathBuf>,
    blocker: Option<rusqlite::Connection>,
}

struct RecordingActivator(Arc<Mutex<ActivatorLog>>);

fn joined(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(",")
}

impl ServiceActivator for RecordingActivator {
    fn activate(&mut self, set: &ActivationSet) -> Result<(), ActivationError> {
        let mut log = self.0.lock().unwrap();
        log.calls.push(format!(
            "activate restart=[{}] ensure=[{}]",
            joined(&set.restart),
            joined(&set.ensure)
        ));
        if let Some(path) = log.lock_ledger.take() {
            let conn = rusqlite::Connection::open(path).unwrap();
            conn.execute_batch("BEGIN IMMEDIATE").unwrap();
            log.blocker = Some(conn);
        }
        if log.fail {
            return Err(ActivationError::Command {
                args: "restart".to_string(),
                code: Some(1),
                stderr: "unit failed to start".to_string(),
            });
        }
        Ok(())
    }

    fn deactivate(&mut self, services: &BTreeSet<String>) -> Result<(), ActivationError> {
        let mut log = self.0.lock().unwrap();
        if !services.is_empty() {
            log.calls.push(format!("deactivate [{}]", joined(services)));
        }
        Ok(())
    }
}

struct ScriptedVerifier(Arc<Mutex<Verdict>>);

impl HealthVerifier for ScriptedVerifier {
    fn process_state(&self, _target: &HealthTarget) -> Verdict {
        self.0.lock().unwrap().clone()
    }

    fn check_timeout(&self) -> Duration {
        Duration::from_millis(10)
    }
}

struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) {}
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    dir: TempDir,
    repo: Arc<Mutex<Repo>>,
    activator: Arc<Mutex<ActivatorLog>>,
    verdict: Arc<Mutex<Verdict>>,
    host: BTreeMap<String, String>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            repo: Arc::new(Mutex::new(Repo::default())),
            activator: Arc::new(Mutex::new(ActivatorLog::default())),
            verdict: Arc::new(Mutex::new(Verdict::Healthy)),
            host: BTreeMap::new(),
        }
    }

    fn unit_dir(&self) -> PathBuf {
        self.dir.path().join("systemd")
    }

    fn ledger_path(&self) -> PathBuf {
        self.dir.path().join("state").join("ledger.db")
    }

    fn backups(&self) -> BackupManager {
        BackupManager::new(self.dir.path().join("backups"))
    }

    fn push(&self, commit: &str, files: &[(&str, &str)]) {
        let mut repo = self.repo.lock().unwrap();
        let commit = CommitRef::from(commit);
        repo.trees.insert(
            commit.clone(),
            files
                .iter()
                .map(|(n, c)| (n.to_string(), c.to_string()))
                .collect(),
        );
        repo.head = Some(commit);
    }

    fn engine(&self) -> Engine {
        fs::create_dir_all(self.ledger_path().parent().unwrap()).unwrap();
        let source: Box<dyn GitSource> = Box::new(TreeSource {
            repo: Arc::clone(&self.repo),
            checkouts: self.dir.path().join("checkouts"),
        });
        let health = HealthPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            ..HealthPolicy::default()
        };
        let ledger = Ledger::open(&self.ledger_path()).unwrap();
        ledger.set_busy_timeout(Duration::from_millis(50)).unwrap();
        Engine::new(EngineContext {
            ledger,
            detector: ChangeDetector::new(source, "main"),
            renderer: Renderer::new(
                vec![PathBuf::from("units")],
                HostEnv::from_map(self.host.clone()),
            ),
            backups: self.backups(),
            activator: Box::new(RecordingActivator(Arc::clone(&self.activator))),
            verifier: Box::new(ScriptedVerifier(Arc::clone(&self.verdict))),
            notifier: Box::new(TracingNotifier),
            sleeper: Box::new(NoSleep),
            settings: EngineSettings {
                unit_dir: self.unit_dir(),
                retain: 5,
                health,
            },
        })
    }

    fn read_unit(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.unit_dir().join(name)).ok()
    }

    fn calls(&self) -> Vec<String> {
        self.activator.lock().unwrap().calls.clone()
    }

    fn release_ledger(&self) {
        self.activator.lock().unwrap().blocker = None;
    }
}

const WEB_V1: &str = "[Container]\nImage=docker.io/library/nginx:1.25\nPublishPort=8080:80\n";
const WEB_V2: &str = "[Container]\nImage=docker.io/library/nginx:1.27\nPublishPort=8080:80\n";
const API: &str = "[Container]\nImage=ghcr.io/acme/api:3\n";

fn cycle(engine: &mut Engine) -> CycleOutcome {
    engine.run_cycle(&AtomicBool::new(false)).unwrap()
}

fn deployment_of(outcome: &CycleOutcome) -> DeploymentId {
    match outcome {
        CycleOutcome::Committed { deployment, .. }
        | CycleOutcome::RolledBack { deployment, .. }
        | CycleOutcome::Degraded { deployment, .. }
        | CycleOutcome::ValidationFailed { deployment, .. }
        | CycleOutcome::Failed { deployment, .. } => *deployment,
        other => panic!("no deployment in {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn first_deployment_installs_and_second_poll_changes_nothing() {
    let h = Harness::new();
    h.push("c1", &[("web.container", WEB_V1)]);
    let mut engine = h.engine();

    let outcome = cycle(&mut engine);
    assert!(
        matches!(outcome, CycleOutcome::Committed { written: 1, removed: 0, .. }),
        "{outcome:?}"
    );
    assert_eq!(h.read_unit("web.container").as_deref(), Some(WEB_V1));
    assert_eq!(
        h.calls(),
        vec!["activate restart=[web.service] ensure=[web.service]".to_string()]
    );

    let history = engine.ledger().history(10).unwrap();
    let events = engine.ledger().events(100).unwrap();
    let calls = h.calls();

    let again = cycle(&mut engine);
    assert_eq!(
        again,
        CycleOutcome::NoChange {
            head: CommitRef::from("c1")
        }
    );
    assert_eq!(engine.ledger().history(10).unwrap(), history);
    assert_eq!(engine.ledger().events(100).unwrap(), events);
    assert_eq!(h.calls(), calls);
    assert_eq!(h.read_unit("web.container").as_deref(), Some(WEB_V1));
}

#[test]
fn unhealthy_deployment_restores_previous_files() {
    let h = Harness::new();
    h.push("c1", &[("web.container", WEB_V1)]);
    let mut engine = h.engine();
    assert!(matches!(cycle(&mut engine), CycleOutcome::Committed { .. }));

    h.push("c2", &[("web.container", WEB_V2), ("api.container", API)]);
    *h.verdict.lock().unwrap() = Verdict::Unhealthy("connection refused".to_string());

    let outcome = cycle(&mut engine);
    assert!(matches!(outcome, CycleOutcome::RolledBack { .. }), "{outcome:?}");
    let id = deployment_of(&outcome);

    assert_eq!(h.read_unit("web.container").as_deref(), Some(WEB_V1));
    assert_eq!(h.read_unit("api.container"), None);

    let record = engine.ledger().get(id).unwrap();
    assert_eq!(record.status, DeploymentStatus::RolledBack);
    let snapshot = engine.ledger().backup_for(id).unwrap().expect("snapshot");
    assert_eq!(
        snapshot.manifest.keys().cloned().collect::<Vec<_>>(),
        vec!["web.container".to_string()]
    );
    assert!(snapshot.created_at <= record.applied_at.expect("applied_at"));
    assert_eq!(
        engine.ledger().last_applied_ref().unwrap(),
        Some(CommitRef::from("c1"))
    );

    // The rolled-back head is not retried until the branch moves.
    *h.verdict.lock().unwrap() = Verdict::Healthy;
    assert_eq!(
        cycle(&mut engine),
        CycleOutcome::Skipped {
            commit: CommitRef::from("c2"),
            status: DeploymentStatus::RolledBack
        }
    );
}

#[test]
fn invalid_commit_is_rejected_without_touching_the_host() {
    let h = Harness::new();
    h.push("bad", &[("web.container", "[Container]\nPublishPort=80:80\n")]);
    let mut engine = h.engine();

    let outcome = cycle(&mut engine);
    assert!(
        matches!(outcome, CycleOutcome::ValidationFailed { .. }),
        "{outcome:?}"
    );
    let id = deployment_of(&outcome);
    assert_eq!(engine.ledger().get(id).unwrap().status, DeploymentStatus::Failed);
    assert!(engine.ledger().backup_for(id).unwrap().is_none());
    assert!(h.read_unit("web.container").is_none());
    assert!(h.calls().is_empty());

    let events = engine.ledger().events(10).unwrap();
    assert!(events
        .iter()
        .any(|e| e.level == EventLevel::Error && e.message.contains("Image")));

    assert!(matches!(cycle(&mut engine), CycleOutcome::Skipped { .. }));
    assert_eq!(engine.ledger().history(10).unwrap().len(), 1);
}

#[test]
fn unresolved_variable_is_deployed_with_a_warning() {
    let h = Harness::new();
    h.push(
        "c1",
        &[("web.container", "[Container]\nImage=nginx:${WEB_TAG}\n")],
    );
    let mut engine = h.engine();

    let outcome = cycle(&mut engine);
    let id = deployment_of(&outcome);
    assert!(matches!(outcome, CycleOutcome::Committed { .. }));
    assert_eq!(
        h.read_unit("web.container").as_deref(),
        Some("[Container]\nImage=nginx:${WEB_TAG}\n")
    );
    let events = engine.ledger().events(10).unwrap();
    assert!(events.iter().any(|e| e.deployment_id == Some(id)
        && e.level == EventLevel::Warn
        && e.message.contains("WEB_TAG")));
}

#[test]
fn units_removed_from_the_repository_are_stopped_and_deleted() {
    let h = Harness::new();
    h.push("c1", &[("web.container", WEB_V1), ("api.container", API)]);
    let mut engine = h.engine();
    assert!(matches!(cycle(&mut engine), CycleOutcome::Committed { .. }));

    h.push("c2", &[("web.container", WEB_V1)]);
    let outcome = cycle(&mut engine);
    assert!(
        matches!(outcome, CycleOutcome::Committed { written: 0, removed: 1, .. }),
        "{outcome:?}"
    );
    assert!(h.read_unit("api.container").is_none());
    assert_eq!(h.read_unit("web.container").as_deref(), Some(WEB_V1));
    let calls = h.calls();
    assert!(calls.contains(&"deactivate [api.service]".to_string()));
    assert_eq!(
        calls.last().map(String::as_str),
        Some("activate restart=[] ensure=[web.service]")
    );
}

#[test]
fn failed_rollback_degrades_and_halts_until_cleared() {
    let h = Harness::new();
    h.push("c1", &[("web.container", WEB_V1)]);
    let mut engine = h.engine();
    assert!(matches!(cycle(&mut engine), CycleOutcome::Committed { .. }));

    h.activator.lock().unwrap().fail = true;
    h.push("c2", &[("web.container", WEB_V2)]);
    let outcome = cycle(&mut engine);
    assert!(matches!(outcome, CycleOutcome::Degraded { .. }), "{outcome:?}");
    assert!(engine.ledger().is_halted().unwrap());
    // Files are back even though the services could not be restarted.
    assert_eq!(h.read_unit("web.container").as_deref(), Some(WEB_V1));

    h.activator.lock().unwrap().fail = false;
    h.push("c3", &[("web.container", API)]);
    let calls = h.calls();
    for _ in 0..3 {
        assert_eq!(
            cycle(&mut engine),
            CycleOutcome::Halted {
                commit: CommitRef::from("c3")
            }
        );
    }
    assert_eq!(h.calls(), calls);
    assert_eq!(h.read_unit("web.container").as_deref(), Some(WEB_V1));
    let announcements = engine
        .ledger()
        .events(100)
        .unwrap()
        .into_iter()
        .filter(|e| e.message.contains("auto-apply halted by a degraded deployment"))
        .count();
    assert_eq!(announcements, 1);

    let mut operator = Ledger::open(&h.ledger_path()).unwrap();
    assert!(operator.clear_degraded(Some("fixed by hand")).unwrap().is_some());

    let outcome = cycle(&mut engine);
    assert!(matches!(outcome, CycleOutcome::Committed { .. }), "{outcome:?}");
    assert_eq!(h.read_unit("web.container").as_deref(), Some(API));
}

#[test]
fn crash_during_apply_is_rolled_back_on_startup_and_retried() {
    let h = Harness::new();
    h.push("c1", &[("web.container", WEB_V1)]);
    {
        let mut engine = h.engine();
        assert!(matches!(cycle(&mut engine), CycleOutcome::Committed { .. }));
    }

    // A process that died between the first write and the health verdict.
    h.push("c2", &[("web.container", WEB_V2)]);
    let crashed = {
        let mut ledger = Ledger::open(&h.ledger_path()).unwrap();
        let record = ledger.begin(&CommitRef::from("c2")).unwrap();
        let snapshot = h.backups().snapshot(&h.unit_dir(), record.id).unwrap();
        ledger.record_backup(record.id, &snapshot).unwrap();
        ledger
            .mark_applying(
                record.id,
                &[AppliedUnit {
                    unit: "web.container".to_string(),
                    checksum: "0".repeat(64),
                }],
            )
            .unwrap();
        fs::write(h.unit_dir().join("web.container"), WEB_V2).unwrap();
        fs::write(h.unit_dir().join("half.container"), API).unwrap();
        record.id
    };

    let mut engine = h.engine();
    let outcome = engine.recover().unwrap();
    assert!(
        matches!(outcome, Some(CycleOutcome::RolledBack { deployment, .. }) if deployment == crashed),
        "{outcome:?}"
    );
    assert_eq!(h.read_unit("web.container").as_deref(), Some(WEB_V1));
    assert!(h.read_unit("half.container").is_none());

    let record = engine.ledger().get(crashed).unwrap();
    assert_eq!(record.status, DeploymentStatus::RolledBack);
    assert!(!record.rollback_pending);
    assert!(engine.ledger().open_deployment().unwrap().is_none());

    // The branch still points at c2; the interrupted attempt does not count.
    let outcome = cycle(&mut engine);
    assert!(
        matches!(outcome, CycleOutcome::Committed { ref commit, .. } if commit == &CommitRef::from("c2")),
        "{outcome:?}"
    );
    assert_ne!(deployment_of(&outcome), crashed);
    assert_eq!(h.read_unit("web.container").as_deref(), Some(WEB_V2));
    assert_eq!(
        engine.ledger().last_applied_ref().unwrap(),
        Some(CommitRef::from("c2"))
    );
    assert!(matches!(cycle(&mut engine), CycleOutcome::NoChange { .. }));
}

#[test]
fn ledger_failure_mid_deployment_never_leaves_the_record_open() {
    let h = Harness::new();
    h.push("c1", &[("web.container", WEB_V1)]);
    let mut engine = h.engine();
    assert!(matches!(cycle(&mut engine), CycleOutcome::Committed { .. }));

    // Activation succeeds, then every ledger write is refused.
    h.activator.lock().unwrap().lock_ledger = Some(h.ledger_path());
    h.push("c2", &[("web.container", WEB_V2)]);
    let err = engine.run_cycle(&AtomicBool::new(false)).unwrap_err();
    assert!(err.to_string().contains("ledger"), "{err}");
    assert_eq!(h.read_unit("web.container").as_deref(), Some(WEB_V2));
    let open = engine.ledger().open_deployment().unwrap().expect("still open");
    assert_eq!(open.status, DeploymentStatus::Applying);

    // The next cycle closes it before looking at the source.
    h.release_ledger();
    let outcome = cycle(&mut engine);
    assert!(
        matches!(outcome, CycleOutcome::RolledBack { deployment, .. } if deployment == open.id),
        "{outcome:?}"
    );
    assert_eq!(h.read_unit("web.container").as_deref(), Some(WEB_V1));
    let record = engine.ledger().get(open.id).unwrap();
    assert_eq!(record.status, DeploymentStatus::RolledBack);
    assert!(record.reason.as_deref().is_some_and(|r| r.starts_with("interrupted")));
    assert!(engine.ledger().open_deployment().unwrap().is_none());

    // A ledger hiccup is not a verdict on the commit.
    let outcome = cycle(&mut engine);
    assert!(matches!(outcome, CycleOutcome::Committed { .. }), "{outcome:?}");
    assert_eq!(h.read_unit("web.container").as_deref(), Some(WEB_V2));
}

#[test]
fn unwritable_backup_root_fails_before_touching_units() {
    let h = Harness::new();
    fs::write(h.dir.path().join("backups"), "not a directory").unwrap();
    h.push("c1", &[("web.container", WEB_V1)]);
    let mut engine = h.engine();

    let outcome = cycle(&mut engine);
    assert!(
        matches!(outcome, CycleOutcome::Failed { ref reason, .. } if reason.contains("backup failed")),
        "{outcome:?}"
    );
    let record = engine.ledger().get(deployment_of(&outcome)).unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(engine.ledger().backup_for(record.id).unwrap().is_none());
    assert!(h.read_unit("web.container").is_none());
    assert!(h.calls().is_empty());
    assert!(engine.ledger().open_deployment().unwrap().is_none());
}

#[test]
fn unreachable_source_leaves_no_trace() {
    let h = Harness::new();
    h.push("c1", &[("web.container", WEB_V1)]);
    h.repo.lock().unwrap().offline = true;
    let mut engine = h.engine();

    let outcome = cycle(&mut engine);
    assert!(
        matches!(outcome, CycleOutcome::SourceUnavailable { ref reason } if reason.contains("network unreachable")),
        "{outcome:?}"
    );
    assert!(engine.ledger().history(10).unwrap().is_empty());
    assert!(engine.ledger().events(10).unwrap().is_empty());
    assert!(!h.unit_dir().exists());
}

#[test]
fn cancelled_cycle_does_nothing() {
    let h = Harness::new();
    h.push("c1", &[("web.container", WEB_V1)]);
    let mut engine = h.engine();

    let outcome = engine.run_cycle(&AtomicBool::new(true)).unwrap();
    assert_eq!(outcome, CycleOutcome::Cancelled);
    assert!(engine.ledger().history(10).unwrap().is_empty());
}
