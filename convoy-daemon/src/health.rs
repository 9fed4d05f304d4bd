//! Health verification after activation.
//!
//! Two verifiers share one contract: [`BasicVerifier`] reads process state
//! from systemd, [`InspectVerifier`] asks podman about the unit's workload:
//! the container with its native healthcheck, or the pod. Kube units name
//! their pods from YAML the generator never shows us, so they fall back to
//! systemd state. Explicit HTTP, TCP and command checks run the same way
//! under both once the process is up.
//!
//! [`verify_all`] is the bounded retry loop the engine blocks on. Each
//! attempt fans out one thread per pending target; the loop sleeps through an
//! injected [`Sleeper`] so tests never wait on the wall clock.

use std::collections::BTreeMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use convoy_core::{CheckSpec, HealthPolicy, VerifierKind};
use serde::Serialize;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One workload unit to verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTarget {
    /// Installed unit file name, e.g. `web.container`.
    pub unit: String,
    pub service: String,
    pub workload: Workload,
    pub check: CheckSpec,
}

/// What podman knows the unit's workload as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workload {
    Container(String),
    Pod(String),
    /// No podman name to inspect; systemd state only.
    Kube,
}

/// Binaries the verifiers shell out to.
#[derive(Debug, Clone)]
pub struct Tools {
    pub systemctl: PathBuf,
    pub podman: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            systemctl: PathBuf::from("systemctl"),
            podman: PathBuf::from("podman"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Healthy,
    /// Not healthy yet; retried while the budget lasts.
    Unhealthy(String),
    /// The process failed or exited. Never retried.
    Failed(String),
}

impl Verdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Verdict::Healthy)
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Check contract shared by both verifier variants.
pub trait HealthVerifier: Send + Sync {
    /// State of the target's process alone.
    fn process_state(&self, target: &HealthTarget) -> Verdict;

    /// Timeout for a single HTTP, TCP or command check.
    fn check_timeout(&self) -> Duration;

    fn check(&self, target: &HealthTarget) -> Verdict {
        let state = self.process_state(target);
        match (&target.check, state) {
            (_, failed @ Verdict::Failed(_)) => failed,
            (CheckSpec::Process, verdict) => verdict,
            (_, pending @ Verdict::Unhealthy(_)) => pending,
            (spec, Verdict::Healthy) => run_check(spec, self.check_timeout()),
        }
    }
}

/// Build the verifier selected in configuration.
pub fn verifier_for(kind: VerifierKind, user_mode: bool, timeout: Duration) -> Box<dyn HealthVerifier> {
    let tools = Tools::default();
    match kind {
        VerifierKind::Basic => Box::new(BasicVerifier {
            user_mode,
            timeout,
            tools,
        }),
        VerifierKind::Inspect => Box::new(InspectVerifier {
            user_mode,
            timeout,
            tools,
        }),
    }
}

// ---------------------------------------------------------------------------
// Verifiers
// ---------------------------------------------------------------------------

/// Process state from `systemctl is-active`.
#[derive(Debug, Clone)]
pub struct BasicVerifier {
    pub user_mode: bool,
    pub timeout: Duration,
    pub tools: Tools,
}

impl HealthVerifier for BasicVerifier {
    fn process_state(&self, target: &HealthTarget) -> Verdict {
        systemd_state(&self.tools, self.user_mode, &target.service)
    }

    fn check_timeout(&self) -> Duration {
        self.timeout
    }
}

fn systemd_state(tools: &Tools, user_mode: bool, service: &str) -> Verdict {
    let mut cmd = Command::new(&tools.systemctl);
    if user_mode {
        cmd.arg("--user");
    }
    // is-active exits non-zero for anything but "active"; the word is what matters.
    let output = match cmd.args(["is-active", service]).output() {
        Ok(output) => output,
        Err(e) => return Verdict::Unhealthy(format!("could not run systemctl: {e}")),
    };
    let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
    match state.as_str() {
        "active" => Verdict::Healthy,
        "failed" => Verdict::Failed(format!("{service} is failed")),
        other => Verdict::Unhealthy(format!("{service} is {other}")),
    }
}

/// Workload state from `podman container inspect` or `podman pod inspect`.
#[derive(Debug, Clone)]
pub struct InspectVerifier {
    /// Used for kube units, which fall back to systemd.
    pub user_mode: bool,
    pub timeout: Duration,
    pub tools: Tools,
}

const CONTAINER_FORMAT: &str = "{{.State.Status}}|{{if .State.Health}}{{.State.Health.Status}}{{end}}";
const POD_FORMAT: &str = "{{.State}}";

impl HealthVerifier for InspectVerifier {
    fn process_state(&self, target: &HealthTarget) -> Verdict {
        let (noun, format, name) = match &target.workload {
            Workload::Container(name) => ("container", CONTAINER_FORMAT, name.as_str()),
            Workload::Pod(name) => ("pod", POD_FORMAT, name.as_str()),
            Workload::Kube => return systemd_state(&self.tools, self.user_mode, &target.service),
        };
        let output = Command::new(&self.tools.podman)
            .args([noun, "inspect", "--format", format, name])
            .output();
        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(_) => return Verdict::Unhealthy(format!("{noun} {name} not found")),
            Err(e) => return Verdict::Unhealthy(format!("could not run podman: {e}")),
        };
        let state = String::from_utf8_lossy(&output.stdout);
        match target.workload {
            Workload::Pod(_) => classify_pod(name, state.trim()),
            _ => classify_container(name, state.trim()),
        }
    }

    fn check_timeout(&self) -> Duration {
        self.timeout
    }
}

fn classify_container(container: &str, line: &str) -> Verdict {
    let (status, health) = line.split_once('|').unwrap_or((line, ""));
    match (status, health) {
        ("running", "" | "healthy") => Verdict::Healthy,
        ("running", health) => Verdict::Unhealthy(format!("{container} healthcheck is {health}")),
        ("exited" | "stopped" | "dead", _) => Verdict::Failed(format!("{container} is {status}")),
        (status, _) => Verdict::Unhealthy(format!("{container} is {status}")),
    }
}

/// Pod states as podman prints them: `Running`, `Degraded`, `Exited`...
fn classify_pod(pod: &str, state: &str) -> Verdict {
    match state.to_ascii_lowercase().as_str() {
        "running" => Verdict::Healthy,
        "exited" | "stopped" | "dead" => Verdict::Failed(format!("pod {pod} is {state}")),
        _ => Verdict::Unhealthy(format!("pod {pod} is {state}")),
    }
}

// ---------------------------------------------------------------------------
// Explicit checks
// ---------------------------------------------------------------------------

fn run_check(spec: &CheckSpec, timeout: Duration) -> Verdict {
    match spec {
        CheckSpec::Http { url } => http_check(url, timeout),
        CheckSpec::Tcp { host, port } => tcp_check(host, *port, timeout),
        CheckSpec::Command { command } => command_check(command, timeout),
        CheckSpec::Process => Verdict::Healthy,
    }
}

fn http_check(url: &str, timeout: Duration) -> Verdict {
    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    match agent.get(url).call() {
        Ok(response) => {
            debug!(url, status = response.status(), "http check ok");
            Verdict::Healthy
        }
        Err(ureq::Error::Status(code, _)) => Verdict::Unhealthy(format!("{url} returned {code}")),
        Err(e) => Verdict::Unhealthy(format!("{url}: {e}")),
    }
}

fn tcp_check(host: &str, port: u16, timeout: Duration) -> Verdict {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect::<Vec<_>>(),
        Err(e) => return Verdict::Unhealthy(format!("cannot resolve {host}: {e}")),
    };
    let mut last = format!("{host}:{port} has no addresses");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Verdict::Healthy,
            Err(e) => last = format!("{addr}: {e}"),
        }
    }
    Verdict::Unhealthy(last)
}

fn command_check(command: &str, timeout: Duration) -> Verdict {
    let mut child = match Command::new("sh")
        .args(["-c", command])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return Verdict::Unhealthy(format!("could not run `{command}`: {e}")),
    };
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => return Verdict::Healthy,
            Ok(Some(status)) => return Verdict::Unhealthy(format!("`{command}` exited with {status}")),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Verdict::Unhealthy(format!("`{command}` timed out after {timeout:?}"));
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(20)),
            Err(e) => return Verdict::Unhealthy(format!("waiting on `{command}`: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Bounded retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Final verdict per unit.
    pub verdicts: BTreeMap<String, Verdict>,
    pub attempts: u32,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.verdicts.values().all(Verdict::is_healthy)
    }

    /// One line naming every unhealthy unit.
    pub fn summary(&self) -> String {
        let failing: Vec<String> = self
            .verdicts
            .iter()
            .filter_map(|(unit, v)| match v {
                Verdict::Healthy => None,
                Verdict::Unhealthy(r) | Verdict::Failed(r) => Some(format!("{unit}: {r}")),
            })
            .collect();
        if failing.is_empty() {
            "all checks passing".to_string()
        } else {
            failing.join("; ")
        }
    }
}

/// Check every target until all pass, one fails permanently, or
/// `policy.max_attempts` is spent. Sleeps `policy.backoff(n)` before attempt `n`.
pub fn verify_all(
    verifier: &dyn HealthVerifier,
    targets: &[HealthTarget],
    policy: &HealthPolicy,
    sleeper: &dyn Sleeper,
) -> HealthReport {
    let mut verdicts: BTreeMap<String, Verdict> = targets
        .iter()
        .map(|t| (t.unit.clone(), Verdict::Unhealthy("not checked".to_string())))
        .collect();
    let mut pending: Vec<&HealthTarget> = targets.iter().collect();
    let mut attempts = 0;

    while !pending.is_empty() && attempts < policy.max_attempts {
        attempts += 1;
        sleeper.sleep(policy.backoff(attempts));

        let results: Vec<(&HealthTarget, Verdict)> = std::thread::scope(|scope| {
            let handles: Vec<_> = pending
                .iter()
                .map(|target| {
                    let target = *target;
                    (target, scope.spawn(move || verifier.check(target)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(target, handle)| {
                    let verdict = handle
                        .join()
                        .unwrap_or_else(|_| Verdict::Unhealthy("check panicked".to_string()));
                    (target, verdict)
                })
                .collect()
        });

        let mut permanent = false;
        pending.clear();
        for (target, verdict) in results {
            debug!(unit = %target.unit, attempt = attempts, verdict = ?verdict, "health check");
            match &verdict {
                Verdict::Healthy => {}
                Verdict::Unhealthy(_) => pending.push(target),
                Verdict::Failed(_) => permanent = true,
            }
            verdicts.insert(target.unit.clone(), verdict);
        }
        if permanent {
            warn!(attempt = attempts, "permanent health failure");
            break;
        }
    }

    let report = HealthReport { verdicts, attempts };
    if report.is_healthy() {
        info!(targets = targets.len(), attempts, "all health checks passing");
    }
    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
