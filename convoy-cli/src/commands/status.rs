//! `convoy status`: what is deployed, what is in flight, and whether
//! auto-apply is halted.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use convoy_core::{ContainerRecord, DeploymentRecord, LedgerAggregates};
use convoy_daemon::{ControlClient, ControlRequest};

use super::{format_age, load_config, open_ledger, print_json, status_label, Globals};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    daemon_running: bool,
    halted: bool,
    last_healthy: Option<DeploymentRecord>,
    open_deployment: Option<DeploymentRecord>,
    units: Vec<ContainerRecord>,
    totals: LedgerAggregates,
}

#[derive(Tabled)]
struct UnitRow {
    unit: String,
    checksum: String,
    status: String,
    #[tabled(rename = "updated")]
    updated: String,
}

impl StatusArgs {
    pub fn run(self, globals: &Globals) -> Result<()> {
        let (home, config) = load_config(globals)?;
        let ledger = open_ledger(&config)?;

        let last_healthy = ledger.last_healthy().context("failed to read ledger")?;
        let units = match &last_healthy {
            Some(record) => ledger.containers_for(record.id)?,
            None => Vec::new(),
        };
        let report = StatusReport {
            daemon_running: ControlClient::for_home(&home)
                .exchange(ControlRequest::Status)
                .is_ok(),
            halted: ledger.is_halted()?,
            last_healthy,
            open_deployment: ledger.open_deployment()?,
            units,
            totals: ledger.aggregates()?,
        };

        if self.json {
            return print_json(&report);
        }
        print_report(report);
        Ok(())
    }
}

fn print_report(report: StatusReport) {
    let daemon = if report.daemon_running {
        "running".green().to_string()
    } else {
        "stopped".bright_black().to_string()
    };
    println!(
        "Convoy v{} | daemon {} | {} deployment(s) | {} rollback(s)",
        env!("CARGO_PKG_VERSION"),
        daemon,
        report.totals.total,
        report.totals.rollbacks,
    );

    if report.halted {
        println!(
            "{} a rollback failed and auto-apply is halted. Repair the host, then run 'convoy clear-degraded'.",
            "DEGRADED".red().bold()
        );
    }

    if let Some(open) = &report.open_deployment {
        println!(
            "In flight: deployment {} of {} ({}, started {})",
            open.id,
            open.commit.short(),
            status_label(open.status),
            format_age(open.started_at),
        );
    }

    let Some(current) = &report.last_healthy else {
        println!("Nothing deployed yet.");
        return;
    };
    println!(
        "Deployed: {} (deployment {}, {})",
        current.commit.short().bold(),
        current.id,
        current.finished_at.map_or_else(|| "-".to_string(), format_age),
    );

    if report.units.is_empty() {
        return;
    }
    let rows: Vec<UnitRow> = report
        .units
        .into_iter()
        .map(|c| UnitRow {
            unit: c.unit,
            checksum: c.checksum.chars().take(12).collect(),
            status: c.status.to_string(),
            updated: format_age(c.updated_at),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}
