//! `convoy events`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use convoy_core::EventLevel;

use super::{load_config, open_ledger, print_json, Globals};

#[derive(Args, Debug)]
pub struct EventsArgs {
    /// Number of events to show.
    #[arg(long, default_value_t = 50)]
    pub limit: usize,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl EventsArgs {
    pub fn run(self, globals: &Globals) -> Result<()> {
        let (_home, config) = load_config(globals)?;
        let ledger = open_ledger(&config)?;
        let events = ledger.events(self.limit).context("failed to read events")?;

        if self.json {
            return print_json(&events);
        }
        if events.is_empty() {
            println!("No events recorded.");
            return Ok(());
        }

        for event in events {
            let level = match event.level {
                EventLevel::Info => "INFO ".green(),
                EventLevel::Warn => "WARN ".yellow(),
                EventLevel::Error => "ERROR".red().bold(),
            };
            let deployment = event
                .deployment_id
                .map_or_else(String::new, |id| format!("[#{id}] "));
            println!(
                "{} {level} {deployment}{}",
                event.created_at.format("%Y-%m-%d %H:%M:%S").to_string()
                    .as_str()
                    .bright_black(),
                event.message
            );
        }
        Ok(())
    }
}
