//! `convoy history`

use anyhow::{Context, Result};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use super::{format_age, load_config, open_ledger, print_json, status_label, Globals};

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Number of deployments to show.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct HistoryRow {
    id: String,
    commit: String,
    status: String,
    started: String,
    #[tabled(rename = "duration")]
    duration: String,
    reason: String,
}

impl HistoryArgs {
    pub fn run(self, globals: &Globals) -> Result<()> {
        let (_home, config) = load_config(globals)?;
        let ledger = open_ledger(&config)?;
        let records = ledger
            .history(self.limit)
            .context("failed to read deployment history")?;

        if self.json {
            return print_json(&records);
        }
        if records.is_empty() {
            println!("No deployments recorded.");
            return Ok(());
        }

        let rows: Vec<HistoryRow> = records
            .into_iter()
            .map(|r| HistoryRow {
                id: r.id.to_string(),
                commit: r.commit.short().to_string(),
                status: status_label(r.status),
                started: format_age(r.started_at),
                duration: r
                    .duration()
                    .map_or_else(|| "-".to_string(), |d| format!("{}ms", d.num_milliseconds())),
                reason: r.reason.unwrap_or_default(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}
