use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use convoy_core::paths::{ensure_private_dir, socket_path_at};
use convoy_core::{EngineLock, Ledger, ValidatedConfig};
use convoy_detector::{ChangeDetector, GitCli, GitSource};
use convoy_renderer::{HostEnv, Renderer};
use convoy_sync::BackupManager;

use crate::activator::SystemdActivator;
use crate::engine::{CycleOutcome, Engine, EngineContext, EngineSettings};
use crate::error::{io_err, DaemonError};
use crate::health::{verifier_for, ThreadSleeper};
use crate::notify::TracingNotifier;
use crate::protocol::{parse_request, ControlReply, ControlRequest, ReplyCode};

/// Last finished cycle, as reported by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub trigger: String,
    pub outcome: CycleOutcome,
    pub finished_at_unix: u64,
}

/// Shared daemon state: the engine behind a lock, the cancel flag, and the
/// shutdown channel every task listens on.
pub struct Daemon {
    engine: Mutex<Engine>,
    cancel: AtomicBool,
    last: Mutex<Option<CycleReport>>,
    ledger_path: PathBuf,
    socket: PathBuf,
    started_at_unix: u64,
    shutdown: broadcast::Sender<()>,
}

impl Daemon {
    pub fn new(engine: Engine, socket: PathBuf) -> Arc<Self> {
        let ledger_path = engine.ledger().path().to_path_buf();
        let (shutdown, _) = broadcast::channel(16);
        Arc::new(Self {
            engine: Mutex::new(engine),
            cancel: AtomicBool::new(false),
            last: Mutex::new(None),
            ledger_path,
            socket,
            started_at_unix: unix_seconds_now(),
            shutdown,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Ask every task to stop. A running cycle stops at its next cancellable
    /// boundary or runs to a terminal status.
    pub fn shutdown(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Run one cycle on a blocking worker. `Ok(None)` means a cycle is
    /// already running; the request is dropped, not queued.
    pub async fn reconcile(
        self: &Arc<Self>,
        trigger: &'static str,
    ) -> Result<Option<CycleOutcome>, DaemonError> {
        let daemon = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || {
            let mut engine = match daemon.engine.try_lock() {
                Ok(engine) => engine,
                Err(TryLockError::WouldBlock) => return Ok(None),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            };
            engine.run_cycle(&daemon.cancel).map(Some)
        })
        .await
        .map_err(|err| DaemonError::TaskAborted {
            task: "cycle",
            message: err.to_string(),
        })?;

        let outcome = result?;
        match &outcome {
            Some(outcome) => {
                let report = CycleReport {
                    trigger: trigger.to_string(),
                    outcome: outcome.clone(),
                    finished_at_unix: unix_seconds_now(),
                };
                if let Ok(mut last) = self.last.lock() {
                    *last = Some(report);
                }
            }
            None => tracing::debug!(trigger, "cycle already running; request dropped"),
        }
        Ok(outcome)
    }

    /// Answer one control request.
    pub async fn handle(self: &Arc<Self>, request: ControlRequest) -> ControlReply {
        let answered = match request {
            ControlRequest::Status => self.status_payload().await,
            ControlRequest::Metrics => self.read_ledger(|l| Ok(json!(l.aggregates()?))).await,
            ControlRequest::Reconcile => match self.reconcile("socket").await {
                Ok(Some(outcome)) => Ok(json!(outcome)),
                Ok(None) => {
                    return ControlReply::refused(
                        ReplyCode::Busy,
                        "a reconciliation cycle is already running",
                    )
                }
                Err(err) => Err(err),
            },
            ControlRequest::Stop => {
                self.shutdown();
                Ok(json!({ "stopping": true }))
            }
        };
        match answered {
            Ok(data) => ControlReply::data(data),
            Err(err) => {
                tracing::warn!(cmd = request.name(), error = %err, "control request failed");
                ControlReply::refused(ReplyCode::Failed, err.to_string())
            }
        }
    }

    async fn status_payload(self: &Arc<Self>) -> Result<Value, DaemonError> {
        let (busy, state) = match self.engine.try_lock() {
            Ok(engine) => (false, json!(engine.state())),
            Err(_) => (true, Value::Null),
        };
        let last = self.last.lock().ok().and_then(|l| l.clone());
        let ledger = self
            .read_ledger(|l| {
                Ok(json!({
                    "last_applied": l.last_applied_ref()?,
                    "open_deployment": l.open_deployment()?,
                    "halted": l.is_halted()?,
                }))
            })
            .await?;

        Ok(json!({
            "running": true,
            "busy": busy,
            "state": state,
            "started_at_unix": self.started_at_unix,
            "last_cycle": last,
            "ledger": ledger,
            "socket": self.socket.display().to_string(),
        }))
    }

    /// Read through a separate connection so status never waits on a cycle.
    async fn read_ledger<F>(&self, read: F) -> Result<Value, DaemonError>
    where
        F: FnOnce(&Ledger) -> Result<Value, DaemonError> + Send + 'static,
    {
        let path = self.ledger_path.clone();
        tokio::task::spawn_blocking(move || {
            let ledger = Ledger::open(&path)?;
            read(&ledger)
        })
        .await
        .map_err(|err| DaemonError::TaskAborted {
            task: "ledger read",
            message: err.to_string(),
        })?
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Take the host's engine lock and build the engine with the real
/// collaborators named in `config`. Fails with [`DaemonError::Locked`] while
/// another convoy process is reconciling.
pub fn build_engine(config: &ValidatedConfig) -> Result<Engine, DaemonError> {
    let lock = EngineLock::acquire(&config.state_dir)?;
    let ledger = Ledger::open(&config.ledger_path())?;
    let source: Box<dyn GitSource> = Box::new(GitCli::new(
        config.repository.clone(),
        config.checkout_dir.clone(),
    ));
    let health = config.health.clone();
    Ok(Engine::new(EngineContext {
        ledger,
        detector: ChangeDetector::new(source, config.branch.clone()),
        renderer: Renderer::new(
            config.source_paths.clone(),
            HostEnv::capture(&config.variables),
        ),
        backups: BackupManager::new(config.backup_dir.clone()),
        activator: Box::new(SystemdActivator::new(config.user_mode)),
        verifier: verifier_for(health.verifier, config.user_mode, health.timeout),
        notifier: Box::new(TracingNotifier),
        sleeper: Box::new(ThreadSleeper),
        settings: EngineSettings {
            unit_dir: config.unit_dir.clone(),
            retain: config.retain,
            health,
        },
    })
    .with_lock(lock))
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path, config: ValidatedConfig) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Recover, then poll and serve the control socket until shutdown.
pub async fn run(home: PathBuf, config: ValidatedConfig) -> Result<(), DaemonError> {
    let poll_interval = config.poll_interval;
    let engine = tokio::task::spawn_blocking(move || -> Result<Engine, DaemonError> {
        let mut engine = build_engine(&config)?;
        if let Some(outcome) = engine.recover()? {
            tracing::warn!(outcome = %outcome, "recovered interrupted deployment");
        }
        Ok(engine)
    })
    .await
    .map_err(|err| DaemonError::TaskAborted {
        task: "startup recovery",
        message: err.to_string(),
    })??;

    let daemon = Daemon::new(engine, socket_path_at(&home));
    tracing::info!(
        socket = %daemon.socket().display(),
        poll_secs = poll_interval.as_secs(),
        "daemon started"
    );

    let poller_handle = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            let result = poll_task(Arc::clone(&daemon), poll_interval).await;
            daemon.shutdown();
            result
        })
    };

    let socket_handle = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            let result = socket_server_task(Arc::clone(&daemon)).await;
            daemon.shutdown();
            result
        })
    };

    let signal_handle = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { signal_task(daemon).await })
    };

    let (poller_result, socket_result, signal_result) =
        tokio::join!(poller_handle, socket_handle, signal_handle);

    join_outcome("poller", poller_result)?;
    join_outcome("control socket", socket_result)?;
    join_outcome("signal handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Run a cycle on every tick. Ticks that fire during a cycle are skipped.
pub async fn poll_task(daemon: Arc<Daemon>, every: Duration) -> Result<(), DaemonError> {
    let mut shutdown_rx = daemon.subscribe();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                if daemon.is_shutting_down() {
                    break;
                }
                match daemon.reconcile("poll").await {
                    Ok(_) => {}
                    Err(DaemonError::Engine(err)) if err.is_fatal() => {
                        tracing::error!(error = %err, "ledger is unusable; stopping");
                        return Err(err.into());
                    }
                    Err(err) => tracing::error!(error = %err, "reconciliation cycle failed"),
                }
            }
        }
    }
    Ok(())
}

async fn signal_task(daemon: Arc<Daemon>) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut shutdown_rx = daemon.subscribe();
    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    tokio::select! {
        _ = shutdown_rx.recv() => {}
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| io_err("ctrl-c handler", e))?;
            tracing::info!("received ctrl-c, shutting down daemon");
            daemon.shutdown();
        }
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down daemon");
            daemon.shutdown();
        }
    }
    Ok(())
}

/// Accept control connections until shutdown.
pub async fn socket_server_task(daemon: Arc<Daemon>) -> Result<(), DaemonError> {
    let mut shutdown_rx = daemon.subscribe();
    let socket = daemon.socket().to_path_buf();
    if let Some(run) = socket.parent() {
        ensure_private_dir(run).map_err(|e| io_err(run, e))?;
    }
    claim_socket_path(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    convoy_core::paths::set_mode(&socket, 0o600).map_err(|e| io_err(&socket, e))?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let daemon = Arc::clone(&daemon);
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, daemon).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(stream: UnixStream, daemon: Arc<Daemon>) -> Result<(), DaemonError> {
    let socket = daemon.socket().to_path_buf();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await.map_err(|e| io_err(&socket, e))? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (reply, stop) = match parse_request(line) {
            Ok(request) => (daemon.handle(request).await, request == ControlRequest::Stop),
            Err(refusal) => (refusal, false),
        };
        send_reply(&mut writer, &reply)
            .await
            .map_err(|e| io_err(&socket, e))?;
        if stop {
            break;
        }
    }
    Ok(())
}

/// Clear a socket file left behind by a daemon that is gone. A live listener
/// means another daemon serves this home.
fn claim_socket_path(socket: &Path) -> Result<(), DaemonError> {
    if StdUnixStream::connect(socket).is_ok() {
        return Err(DaemonError::SocketInUse {
            socket: socket.to_path_buf(),
        });
    }
    match fs::remove_file(socket) {
        Ok(()) => {
            tracing::warn!(socket = %socket.display(), "removed stale control socket");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

/// One reply line.
async fn send_reply(writer: &mut OwnedWriteHalf, reply: &ControlReply) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(reply)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

fn join_outcome(
    task: &'static str,
    joined: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    joined.map_err(|err| DaemonError::TaskAborted {
        task,
        message: err.to_string(),
    })?
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        let _ = fmt().json().with_env_filter(filter).try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlClient;
    use convoy_core::{CommitRef, HealthPolicy, VerifierKind};
    use convoy_detector::{DetectError, WorkingTree};
    use tempfile::TempDir;

    struct OfflineSource;

    impl GitSource for OfflineSource {
        fn fetch(&mut self, branch: &str) -> Result<CommitRef, DetectError> {
            Err(DetectError::Transient {
                branch: branch.to_string(),
                message: "offline".to_string(),
            })
        }

        fn checkout(&mut self, commit: &CommitRef) -> Result<WorkingTree, DetectError> {
            Err(DetectError::BadCommit(commit.to_string()))
        }

        fn changed_paths(
            &self,
            _from: Option<&CommitRef>,
            _to: &CommitRef,
        ) -> Result<Vec<PathBuf>, DetectError> {
            Ok(Vec::new())
        }
    }

    fn daemon(dir: &TempDir) -> Arc<Daemon> {
        let health = HealthPolicy::default();
        let engine = Engine::new(EngineContext {
            ledger: Ledger::open(&dir.path().join("ledger.db")).unwrap(),
            detector: ChangeDetector::new(Box::new(OfflineSource) as Box<dyn GitSource>, "main"),
            renderer: Renderer::new(vec![PathBuf::from(".")], HostEnv::default()),
            backups: BackupManager::new(dir.path().join("backups")),
            activator: Box::new(SystemdActivator::new(true)),
            verifier: verifier_for(VerifierKind::Basic, true, health.timeout),
            notifier: Box::new(TracingNotifier),
            sleeper: Box::new(ThreadSleeper),
            settings: EngineSettings {
                unit_dir: dir.path().join("units"),
                retain: 3,
                health,
            },
        });
        Daemon::new(engine, dir.path().join("run").join("convoy.sock"))
    }

    #[tokio::test]
    async fn reconcile_records_last_cycle() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir);

        let outcome = daemon.reconcile("test").await.unwrap();
        assert!(matches!(outcome, Some(CycleOutcome::SourceUnavailable { .. })));

        let response = daemon.handle(ControlRequest::Status).await;
        assert!(response.ok, "{response:?}");
        let data = response.data.unwrap();
        assert_eq!(data["busy"], json!(false));
        assert_eq!(data["state"], json!("idle"));
        assert_eq!(data["last_cycle"]["trigger"], json!("test"));
        assert_eq!(data["last_cycle"]["outcome"]["outcome"], json!("source_unavailable"));
        assert_eq!(data["ledger"]["halted"], json!(false));
        assert_eq!(data["ledger"]["last_applied"], Value::Null);
    }

    #[tokio::test]
    async fn overlapping_reconcile_is_dropped() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir);

        let guard = daemon.engine.lock().unwrap();
        assert!(daemon.reconcile("poll").await.unwrap().is_none());

        let response = daemon.handle(ControlRequest::Reconcile).await;
        assert!(!response.ok);
        assert_eq!(response.code, Some(ReplyCode::Busy));

        let status = daemon.handle(ControlRequest::Status).await;
        assert_eq!(status.data.unwrap()["busy"], json!(true));
        drop(guard);

        assert!(daemon.reconcile("poll").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stop_broadcasts_shutdown() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir);
        let mut rx = daemon.subscribe();

        let response = daemon.handle(ControlRequest::Stop).await;
        assert!(response.ok);
        assert!(daemon.is_shutting_down());
        rx.recv().await.unwrap();

        let outcome = daemon.reconcile("poll").await.unwrap();
        assert_eq!(outcome, Some(CycleOutcome::Cancelled));
    }

    #[tokio::test]
    async fn metrics_reports_ledger_totals() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir);
        let response = daemon.handle(ControlRequest::Metrics).await;
        assert!(response.ok, "{response:?}");
        assert_eq!(response.data.unwrap()["total"], json!(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn socket_round_trip() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir);
        let socket = daemon.socket().to_path_buf();
        let server = tokio::spawn(socket_server_task(Arc::clone(&daemon)));

        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let client = ControlClient::at(&socket);
        let status = tokio::task::spawn_blocking(move || client.status())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status["running"], json!(true));

        // Raw lines: an unknown command is refused and the connection stays usable.
        let path = socket.clone();
        let replies = tokio::task::spawn_blocking(move || {
            use std::io::{BufRead, BufReader, Write};
            let mut stream = StdUnixStream::connect(&path).unwrap();
            stream
                .write_all(b"{\"cmd\":\"explode\"}\n{\"cmd\":\"stop\"}\n")
                .unwrap();
            BufReader::new(stream)
                .lines()
                .map(|l| serde_json::from_str::<ControlReply>(&l.unwrap()).unwrap())
                .collect::<Vec<_>>()
        })
        .await
        .unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].code, Some(ReplyCode::BadRequest));
        assert_eq!(replies[0].error.as_deref(), Some("unknown command 'explode'"));
        assert!(replies[1].ok);

        server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_runs_on_first_tick_and_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir);
        let poller = tokio::spawn(poll_task(Arc::clone(&daemon), Duration::from_secs(300)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let last = daemon.last.lock().unwrap().clone().expect("first tick ran a cycle");
        assert_eq!(last.trigger, "poll");

        daemon.shutdown();
        poller.await.unwrap().unwrap();
    }

    #[test]
    fn stale_socket_is_removed_before_bind() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("stale.sock");
        fs::write(&socket, b"").unwrap();
        claim_socket_path(&socket).unwrap();
        assert!(!socket.exists());
    }
}
