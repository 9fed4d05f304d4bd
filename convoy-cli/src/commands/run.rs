//! `convoy run`: the daemon in the foreground.

use anyhow::{Context, Result};

use convoy_daemon::{init_tracing, start_blocking};

use super::{load_config, Globals};

pub fn run(globals: &Globals) -> Result<()> {
    let (home, config) = load_config(globals)?;
    init_tracing(&config.log_level, globals.log_json);
    start_blocking(&home, config).context("daemon exited with error")
}
