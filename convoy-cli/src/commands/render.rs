//! `convoy render`: validate the desired state and show what would be installed.

use anyhow::{bail, Result};
use clap::Args;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use super::{load_config, print_json, render_source, report_render_problems, Globals};

#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Commit to render instead of the branch head.
    #[arg(long = "ref")]
    pub reference: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct RenderJson<'a> {
    commit: String,
    valid: bool,
    units: Vec<UnitJson<'a>>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

#[derive(Serialize)]
struct UnitJson<'a> {
    name: &'a str,
    kind: String,
    checksum: &'a str,
    health: Option<String>,
}

#[derive(Tabled)]
struct UnitRow {
    unit: String,
    kind: String,
    checksum: String,
    health: String,
}

impl RenderArgs {
    pub fn run(self, globals: &Globals) -> Result<()> {
        let (_home, config) = load_config(globals)?;
        let (commit, result) = render_source(&config, self.reference.as_deref())?;

        if self.json {
            let payload = RenderJson {
                commit: commit.to_string(),
                valid: result.is_valid(),
                units: result
                    .units
                    .iter()
                    .map(|u| UnitJson {
                        name: &u.name,
                        kind: u.kind.to_string(),
                        checksum: &u.checksum,
                        health: u.health.as_ref().map(ToString::to_string),
                    })
                    .collect(),
                errors: result.errors.iter().map(ToString::to_string).collect(),
                warnings: result.warnings.iter().map(ToString::to_string).collect(),
            };
            return print_json(&payload);
        }

        println!("commit {} | {} unit(s)", commit, result.units.len());
        let rows: Vec<UnitRow> = result
            .units
            .iter()
            .map(|u| UnitRow {
                unit: u.name.clone(),
                kind: u.kind.to_string(),
                checksum: u.checksum.chars().take(12).collect(),
                health: u
                    .health
                    .as_ref()
                    .map_or_else(|| "-".to_string(), ToString::to_string),
            })
            .collect();
        if !rows.is_empty() {
            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{table}");
        }

        if !report_render_problems(&result) {
            bail!("{} validation error(s); commit would be rejected", result.errors.len());
        }
        Ok(())
    }
}
