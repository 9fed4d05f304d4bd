//! `convoy clear-degraded`: operator acknowledgement of a failed rollback.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use super::{load_config, open_ledger, Globals};

#[derive(Args, Debug)]
pub struct ClearDegradedArgs {
    /// Note stored with the acknowledgement.
    #[arg(long)]
    pub note: Option<String>,
}

impl ClearDegradedArgs {
    pub fn run(self, globals: &Globals) -> Result<()> {
        let (_home, config) = load_config(globals)?;
        let mut ledger = open_ledger(&config)?;
        match ledger
            .clear_degraded(self.note.as_deref())
            .context("failed to clear degraded state")?
        {
            Some(id) => println!(
                "{} deployment {id} acknowledged; auto-apply resumes on the next cycle",
                "✓".green()
            ),
            None => println!("Nothing to clear: auto-apply is not halted."),
        }
        Ok(())
    }
}
