//! `convoy diff`: unified diffs between the desired state and the unit directory.

use anyhow::{bail, Context, Result};
use clap::Args;

use convoy_sync::diff_unit_dir;

use super::{load_config, open_ledger, render_source, report_render_problems, Globals};

#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Commit to compare instead of the branch head.
    #[arg(long = "ref")]
    pub reference: Option<String>,
}

impl DiffArgs {
    pub fn run(self, globals: &Globals) -> Result<()> {
        let (_home, config) = load_config(globals)?;
        let (commit, result) = render_source(&config, self.reference.as_deref())?;
        if !report_render_problems(&result) {
            bail!("{} does not validate; nothing to compare", commit.short());
        }

        let ledger = open_ledger(&config)?;
        let previous: Vec<String> = match ledger.last_healthy()? {
            Some(record) => ledger
                .containers_for(record.id)?
                .into_iter()
                .map(|c| c.unit)
                .collect(),
            None => Vec::new(),
        };

        let diffs = diff_unit_dir(
            &config.unit_dir,
            &result.units,
            previous.iter().map(String::as_str),
        )
        .with_context(|| format!("failed to read {}", config.unit_dir.display()))?;

        if diffs.is_empty() {
            println!("No differences at {}.", commit.short());
            return Ok(());
        }

        for diff in diffs {
            print!("{}", diff.unified_diff);
            if !diff.unified_diff.ends_with('\n') {
                println!();
            }
        }
        Ok(())
    }
}
