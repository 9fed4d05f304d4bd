//! Convoy daemon: the convergence engine, its systemd and health
//! boundaries, and the long-running runtime with its control socket.

pub mod activator;
pub mod engine;
mod error;
pub mod health;
pub mod notify;
pub mod protocol;
mod runtime;

pub use activator::{ActivationError, ActivationSet, ServiceActivator, SystemdActivator};
pub use engine::{CycleOutcome, Engine, EngineContext, EngineSettings, EngineState};
pub use error::{DaemonError, EngineError};
pub use health::{verifier_for, HealthTarget, HealthVerifier, Sleeper, ThreadSleeper, Tools, Verdict, Workload};
pub use notify::{Notifier, TracingNotifier};
pub use protocol::{parse_request, ControlClient, ControlReply, ControlRequest, ReplyCode};
pub use runtime::{
    build_engine, init_tracing, poll_task, run, socket_server_task, start_blocking, CycleReport,
    Daemon,
};
