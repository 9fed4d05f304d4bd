//! `convoy reconcile`: one cycle now, through the daemon when it is running.

use std::sync::atomic::AtomicBool;

use anyhow::{bail, Context, Result};
use colored::Colorize;

use convoy_daemon::{
    build_engine, init_tracing, ControlClient, ControlRequest, CycleOutcome, DaemonError,
};

use super::{load_config, print_json, Globals};

pub fn run(globals: &Globals) -> Result<()> {
    let (home, config) = load_config(globals)?;
    init_tracing(&config.log_level, globals.log_json);

    match ControlClient::for_home(&home).call(ControlRequest::Reconcile) {
        Ok(outcome) => {
            println!("reconciled by the running daemon:");
            return print_json(&outcome);
        }
        Err(DaemonError::DaemonNotRunning { .. }) => {}
        Err(DaemonError::Busy(message)) => {
            println!("{} {message}", "daemon busy:".yellow().bold());
            return Ok(());
        }
        Err(err) => return Err(err).context("failed to reach daemon"),
    }

    // Holding the engine lock makes any open ledger record a leftover of a
    // dead process, so recovery may roll it back.
    let mut engine = match build_engine(&config) {
        Ok(engine) => engine,
        Err(DaemonError::Locked(held)) => {
            println!("{} {held}; try again later", "busy:".yellow().bold());
            return Ok(());
        }
        Err(err) => return Err(err).context("failed to initialise engine"),
    };
    if let Some(outcome) = engine.recover().context("startup recovery failed")? {
        print_outcome(&outcome);
    }
    let outcome = engine
        .run_cycle(&AtomicBool::new(false))
        .context("reconciliation failed")?;
    print_outcome(&outcome);
    if is_failure(&outcome) {
        bail!("{outcome}");
    }
    Ok(())
}

fn is_failure(outcome: &CycleOutcome) -> bool {
    matches!(
        outcome,
        CycleOutcome::ValidationFailed { .. }
            | CycleOutcome::Failed { .. }
            | CycleOutcome::RolledBack { .. }
            | CycleOutcome::Degraded { .. }
    )
}

fn print_outcome(outcome: &CycleOutcome) {
    let line = outcome.to_string();
    let line = match outcome {
        CycleOutcome::Committed { .. } => format!("✓ {line}").as_str().green().to_string(),
        CycleOutcome::NoChange { .. } | CycleOutcome::Cancelled => line.as_str().bright_black().to_string(),
        CycleOutcome::Degraded { .. } => format!("✗ {line}").as_str().red().bold().to_string(),
        _ if is_failure(outcome) => format!("✗ {line}").as_str().red().to_string(),
        _ => line.as_str().yellow().to_string(),
    };
    println!("{line}");
}
