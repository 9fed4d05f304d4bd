//! `convoy daemon`: control a running daemon over its Unix socket.

use anyhow::{Context, Result};
use clap::Subcommand;

use convoy_daemon::{ControlClient, ControlRequest, DaemonError};

use super::{home_dir, print_json, socket_hint};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Query daemon runtime status.
    Status,
    /// Request graceful shutdown.
    Stop,
    /// Ask the daemon to run a cycle now.
    Reconcile,
    /// Deployment counts and durations.
    Metrics,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let client = ControlClient::for_home(&home_dir()?);

    match command {
        DaemonCommand::Status => match client.status() {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                print_json(&serde_json::json!({
                    "running": false,
                    "socket": socket_hint(),
                }))?;
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Stop => match client.call(ControlRequest::Stop) {
            Ok(_) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Reconcile => {
            let outcome = client
                .call(ControlRequest::Reconcile)
                .context("daemon reconcile failed")?;
            print_json(&outcome)?;
        }
        DaemonCommand::Metrics => {
            let metrics = client
                .call(ControlRequest::Metrics)
                .context("failed to read daemon metrics")?;
            print_json(&metrics)?;
        }
    }

    Ok(())
}
