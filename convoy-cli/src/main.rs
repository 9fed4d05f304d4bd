//! Convoy: pull-based GitOps for Podman Quadlet units on a single host.
//!
//! # Usage
//!
//! ```text
//! convoy run
//! convoy reconcile
//! convoy render [--ref <commit>] [--json]
//! convoy diff [--ref <commit>]
//! convoy status [--json]
//! convoy history [--limit N] [--json]
//! convoy events [--limit N]
//! convoy clear-degraded [--note <text>]
//! convoy daemon status|stop|reconcile|metrics
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, diff::DiffArgs, events::EventsArgs, history::HistoryArgs,
    clear::ClearDegradedArgs, render::RenderArgs, status::StatusArgs, Globals,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "convoy",
    version,
    about = "Reconcile Podman Quadlet units on this host with a Git repository",
    long_about = None,
)]
struct Cli {
    /// Configuration file (default: ~/.convoy/config.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit log records as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconciliation daemon in the foreground.
    Run,

    /// Run one reconciliation cycle now.
    Reconcile,

    /// Render and validate the desired state without touching the host.
    Render(RenderArgs),

    /// Show unified diffs between the desired state and the unit directory.
    Diff(DiffArgs),

    /// Show the current deployment state.
    Status(StatusArgs),

    /// List past deployments, newest first.
    History(HistoryArgs),

    /// Show the audit event log, newest first.
    Events(EventsArgs),

    /// Acknowledge a degraded deployment and resume auto-apply.
    ClearDegraded(ClearDegradedArgs),

    /// Talk to a running daemon over its control socket.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let globals = Globals {
        config: cli.config,
        log_json: cli.log_json,
    };
    match cli.command {
        Commands::Run => commands::run::run(&globals),
        Commands::Reconcile => commands::reconcile::run(&globals),
        Commands::Render(args) => args.run(&globals),
        Commands::Diff(args) => args.run(&globals),
        Commands::Status(args) => args.run(&globals),
        Commands::History(args) => args.run(&globals),
        Commands::Events(args) => args.run(&globals),
        Commands::ClearDegraded(args) => args.run(&globals),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
