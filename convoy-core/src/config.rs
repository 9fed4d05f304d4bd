//! Typed configuration and its validation.
//!
//! `Config` is exactly what `config.yaml` deserialises into; every section
//! has defaults except `source.repository`. [`Config::validate`] turns it into
//! a [`ValidatedConfig`] with resolved paths and durations, or returns every
//! field-level problem at once.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths;
use crate::types::CheckSpec;

// ---------------------------------------------------------------------------
// Raw configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub activation: ActivationConfig,
    /// Host variables layered over the process environment.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub repository: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_dir: Option<PathBuf>,
    /// Directories inside the repository that hold unit definitions.
    #[serde(default = "default_source_paths")]
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    #[serde(default = "default_retain")]
    pub retain: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retain: default_retain(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierKind {
    /// Supervisor process state only.
    #[default]
    Basic,
    /// Container runtime inspection, including native healthchecks.
    Inspect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default)]
    pub verifier: VerifierKind,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Per-unit checks keyed by unit file name (`web.container`).
    #[serde(default)]
    pub overrides: BTreeMap<String, CheckSpec>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            verifier: VerifierKind::default(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_ms: default_timeout_ms(),
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivationConfig {
    /// Talk to the per-user service manager (`systemctl --user`).
    #[serde(default = "default_true")]
    pub user_mode: bool,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self { user_mode: true }
    }
}

fn default_poll_interval() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_branch() -> String {
    "main".to_string()
}
fn default_source_paths() -> Vec<PathBuf> {
    vec![PathBuf::from(".")]
}
fn default_retain() -> usize {
    5
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_timeout_ms() -> u64 {
    2_000
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

/// One field-level validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Retry budget and check selection for the health verifier.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthPolicy {
    pub verifier: VerifierKind,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
    pub overrides: BTreeMap<String, CheckSpec>,
}

impl HealthPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << shift;
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        let raw = HealthConfig::default();
        Self {
            verifier: raw.verifier,
            max_attempts: raw.max_attempts,
            initial_delay: Duration::from_millis(raw.initial_delay_ms),
            max_delay: Duration::from_millis(raw.max_delay_ms),
            timeout: Duration::from_millis(raw.timeout_ms),
            overrides: raw.overrides,
        }
    }
}

/// Configuration with every default and path resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig {
    pub repository: String,
    pub branch: String,
    pub checkout_dir: PathBuf,
    pub source_paths: Vec<PathBuf>,
    pub poll_interval: Duration,
    pub unit_dir: PathBuf,
    pub state_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub retain: usize,
    pub health: HealthPolicy,
    pub user_mode: bool,
    pub variables: BTreeMap<String, String>,
    pub log_level: String,
}

impl ValidatedConfig {
    pub fn ledger_path(&self) -> PathBuf {
        paths::ledger_path_in(&self.state_dir)
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Parse YAML text. No validation beyond the shape of the document.
    pub fn from_yaml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate and resolve against `home`. Pure: touches no filesystem state.
    pub fn validate(self, home: &Path) -> Result<ValidatedConfig, Vec<FieldError>> {
        let mut errors = Vec::new();

        if self.source.repository.trim().is_empty() {
            errors.push(FieldError::new("source.repository", "must not be empty"));
        }
        if self.source.branch.trim().is_empty() || self.source.branch.contains(char::is_whitespace)
        {
            errors.push(FieldError::new(
                "source.branch",
                "must be a non-empty branch name without whitespace",
            ));
        }
        if self.source.paths.is_empty() {
            errors.push(FieldError::new("source.paths", "must list at least one directory"));
        }
        for (i, p) in self.source.paths.iter().enumerate() {
            let escapes = p
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
            if escapes {
                errors.push(FieldError::new(
                    format!("source.paths[{i}]"),
                    format!("'{}' must be relative to the repository root", p.display()),
                ));
            }
        }
        if self.poll_interval_secs == 0 {
            errors.push(FieldError::new("poll_interval_secs", "must be greater than zero"));
        }
        if self.backup.retain == 0 {
            errors.push(FieldError::new("backup.retain", "must keep at least one snapshot"));
        }

        let h = &self.health;
        if h.max_attempts == 0 {
            errors.push(FieldError::new("health.max_attempts", "must be at least 1"));
        }
        if h.initial_delay_ms > h.max_delay_ms {
            errors.push(FieldError::new(
                "health.initial_delay_ms",
                format!("{} exceeds max_delay_ms {}", h.initial_delay_ms, h.max_delay_ms),
            ));
        }
        if h.timeout_ms == 0 {
            errors.push(FieldError::new("health.timeout_ms", "must be greater than zero"));
        }
        for (unit, check) in &h.overrides {
            let field = format!("health.overrides.{unit}");
            if !unit.contains('.') {
                errors.push(FieldError::new(
                    field.clone(),
                    "key must be a unit file name such as 'web.container'",
                ));
            }
            if let Some(message) = check_problem(check) {
                errors.push(FieldError::new(field, message));
            }
        }

        for name in self.variables.keys() {
            if !is_variable_name(name) {
                errors.push(FieldError::new(
                    format!("variables.{name}"),
                    "variable names may only contain letters, digits and '_' and must not start with a digit",
                ));
            }
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            errors.push(FieldError::new(
                "log_level",
                format!("'{}' is not one of {}", self.log_level, LOG_LEVELS.join(", ")),
            ));
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let state_dir = self.state_dir.unwrap_or_else(|| paths::state_dir_at(home));
        Ok(ValidatedConfig {
            repository: self.source.repository,
            branch: self.source.branch,
            checkout_dir: self
                .source
                .checkout_dir
                .unwrap_or_else(|| paths::checkout_dir_at(home)),
            source_paths: self.source.paths,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            unit_dir: self.unit_dir.unwrap_or_else(|| paths::unit_dir_at(home)),
            state_dir,
            backup_dir: self.backup.dir.unwrap_or_else(|| paths::backup_dir_at(home)),
            retain: self.backup.retain,
            health: HealthPolicy {
                verifier: self.health.verifier,
                max_attempts: self.health.max_attempts,
                initial_delay: Duration::from_millis(self.health.initial_delay_ms),
                max_delay: Duration::from_millis(self.health.max_delay_ms),
                timeout: Duration::from_millis(self.health.timeout_ms),
                overrides: self.health.overrides,
            },
            user_mode: self.activation.user_mode,
            variables: self.variables,
            log_level: self.log_level,
        })
    }
}

fn check_problem(check: &CheckSpec) -> Option<String> {
    match check {
        CheckSpec::Http { url } if !(url.starts_with("http://") || url.starts_with("https://")) => {
            Some(format!("url '{url}' must start with http:// or https://"))
        }
        CheckSpec::Tcp { port: 0, .. } => Some("tcp port must be non-zero".to_string()),
        CheckSpec::Tcp { host, .. } if host.trim().is_empty() => {
            Some("tcp host must not be empty".to_string())
        }
        CheckSpec::Command { command } if command.trim().is_empty() => {
            Some("command must not be empty".to_string())
        }
        _ => None,
    }
}

pub(crate) fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Read and parse `path`. Returns `ConfigError::NotFound` if absent.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Config::from_yaml_str(&text, path)
}

/// Load `<home>/.convoy/config.yaml`.
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    load(&paths::config_path_at(home))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
