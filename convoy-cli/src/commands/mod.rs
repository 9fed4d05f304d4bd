//! Subcommand implementations and the helpers they share.

pub mod clear;
pub mod daemon;
pub mod diff;
pub mod events;
pub mod history;
pub mod reconcile;
pub mod render;
pub mod run;
pub mod status;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;

use convoy_core::{config, paths, CommitRef, DeploymentStatus, Ledger, ValidatedConfig};
use convoy_detector::{ChangeDetector, Detection, GitCli};
use convoy_renderer::{HostEnv, RenderResult, Renderer};

/// Flags accepted by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    pub config: Option<PathBuf>,
    pub log_json: bool,
}

pub fn home_dir() -> Result<PathBuf> {
    paths::home().context("could not determine home directory")
}

/// Load and validate the configuration, reporting every field problem.
pub fn load_config(globals: &Globals) -> Result<(PathBuf, ValidatedConfig)> {
    let home = home_dir()?;
    let path = match &globals.config {
        Some(path) => path.clone(),
        None => paths::config_path().context("could not locate configuration")?,
    };
    let raw = config::load(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    let validated = raw.validate(&home).map_err(|errors| {
        let lines: Vec<String> = errors.iter().map(|e| format!("  - {e}")).collect();
        anyhow!(
            "invalid configuration at {}:\n{}",
            path.display(),
            lines.join("\n")
        )
    })?;
    Ok((home, validated))
}

pub fn open_ledger(config: &ValidatedConfig) -> Result<Ledger> {
    let path = config.ledger_path();
    Ledger::open(&path).with_context(|| format!("failed to open ledger at {}", path.display()))
}

/// Fetch the source and render `reference` (default: branch head) from a
/// throwaway clone. Touches neither the unit directory nor the engine's
/// checkout, so it is safe to run next to a live daemon.
pub fn render_source(
    config: &ValidatedConfig,
    reference: Option<&str>,
) -> Result<(CommitRef, RenderResult)> {
    let scratch = tempfile::Builder::new()
        .prefix("convoy-preview-")
        .tempdir()
        .context("failed to create a scratch checkout directory")?;
    let source = GitCli::new(config.repository.clone(), scratch.path().join("repo"));
    let mut detector = ChangeDetector::new(source, config.branch.clone());
    let head = match detector
        .detect(None)
        .with_context(|| format!("failed to fetch '{}'", config.branch))?
    {
        Detection::Change { new_ref, .. } => new_ref,
        Detection::NoChange { head } => head,
    };
    let commit = reference.map(CommitRef::from).unwrap_or(head);
    let tree = detector
        .checkout(&commit)
        .with_context(|| format!("failed to check out {commit}"))?;
    let renderer = Renderer::new(
        config.source_paths.clone(),
        HostEnv::capture(&config.variables),
    );
    let result = renderer
        .render(&tree.root, &commit)
        .with_context(|| format!("failed to render {}", commit.short()))?;
    Ok((commit, result))
}

/// Print validation errors and warnings; true when the result is deployable.
pub fn report_render_problems(result: &RenderResult) -> bool {
    for warning in &result.warnings {
        eprintln!("{} {warning}", "warning:".yellow().bold());
    }
    for error in &result.errors {
        eprintln!("{} {error}", "error:".red().bold());
    }
    result.is_valid()
}

pub fn status_label(status: DeploymentStatus) -> String {
    let text = status.to_string();
    match status {
        DeploymentStatus::Healthy => text.as_str().green().to_string(),
        DeploymentStatus::Pending | DeploymentStatus::Applying => text.as_str().cyan().to_string(),
        DeploymentStatus::Failed | DeploymentStatus::RolledBack => text.as_str().yellow().to_string(),
        DeploymentStatus::Degraded => text.as_str().red().bold().to_string(),
    }
}

/// `42s ago`, `5m ago`, `3h ago`, `2d ago`.
pub fn format_age(at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize JSON output")?
    );
    Ok(())
}

pub fn socket_hint() -> String {
    paths::socket_path()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}
