//! Desired-state rendering: scan a checked-out tree, substitute variables,
//! validate every unit and produce a checksummed unit set.
//!
//! Rendering never stops at the first bad file: every problem across the
//! tree lands in [`RenderResult::errors`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use convoy_core::{AppliedUnit, CheckSpec, CommitRef};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::RenderError;
use crate::health::unit_health_check;
use crate::substitute::{service_prefix, substitute, HostEnv, Scope};
use crate::unit::{parse_env_file, FileKind, UnitFile};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One file ready to install in the unit directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedUnit {
    /// Installed file name, e.g. `web.container`.
    pub name: String,
    pub kind: FileKind,
    /// Path relative to the repository root it was rendered from.
    pub source: PathBuf,
    pub content: String,
    /// SHA-256 hex digest of `content`.
    pub checksum: String,
    /// Check declared by the unit itself, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<CheckSpec>,
}

impl RenderedUnit {
    pub fn service(&self) -> Option<String> {
        let stem = Path::new(&self.name).file_stem()?.to_str()?;
        self.kind.service_name(stem)
    }
}

/// Fully rendered desired state for one commit, keyed by installed file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedUnitSet {
    pub commit: CommitRef,
    pub units: BTreeMap<String, RenderedUnit>,
}

impl RenderedUnitSet {
    pub fn new(commit: CommitRef) -> Self {
        Self {
            commit,
            units: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&RenderedUnit> {
        self.units.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RenderedUnit> {
        self.units.values()
    }

    /// File name -> checksum, the shape stored in backups and the ledger.
    pub fn checksums(&self) -> BTreeMap<String, String> {
        self.units
            .iter()
            .map(|(name, unit)| (name.clone(), unit.checksum.clone()))
            .collect()
    }

    pub fn applied_units(&self) -> Vec<AppliedUnit> {
        self.units
            .values()
            .map(|u| AppliedUnit {
                unit: u.name.clone(),
                checksum: u.checksum.clone(),
            })
            .collect()
    }

    /// Units that are started explicitly after activation.
    pub fn workloads(&self) -> impl Iterator<Item = &RenderedUnit> {
        self.units.values().filter(|u| u.kind.starts_directly())
    }
}

/// A problem that blocks deployment of the whole commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub file: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{line}: {}", self.file.display(), self.message),
            None => write!(f, "{}: {}", self.file.display(), self.message),
        }
    }
}

/// Non-blocking findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderWarning {
    MissingVariable { file: PathBuf, name: String },
}

impl fmt::Display for RenderWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderWarning::MissingVariable { file, name } => {
                write!(f, "{}: variable ${{{name}}} is not set; left unresolved", file.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderResult {
    pub units: RenderedUnitSet,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<RenderWarning>,
}

impl RenderResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Renderer {
    source_paths: Vec<PathBuf>,
    host: HostEnv,
}

impl Renderer {
    pub fn new(source_paths: Vec<PathBuf>, host: HostEnv) -> Self {
        Self { source_paths, host }
    }

    /// Render the tree checked out at `root` for `commit`.
    ///
    /// Returns `Err` only when the tree itself cannot be read; everything
    /// wrong with its content is reported in the result.
    pub fn render(&self, root: &Path, commit: &CommitRef) -> Result<RenderResult, RenderError> {
        let mut result = RenderResult {
            units: RenderedUnitSet::new(commit.clone()),
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        let mut unit_files = Vec::new();
        for rel in &self.source_paths {
            let dir = root.join(rel);
            if !dir.is_dir() {
                result.errors.push(ValidationError {
                    file: rel.clone(),
                    line: None,
                    message: "configured source path does not exist in this commit".to_string(),
                });
                continue;
            }
            collect_units(root, &dir, &mut unit_files)?;
        }
        unit_files.sort();
        unit_files.dedup();

        for rel in &unit_files {
            self.render_unit(root, rel, &mut result)?;
        }

        debug!(
            commit = %commit.short(),
            units = result.units.len(),
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "rendered"
        );
        Ok(result)
    }

    fn render_unit(
        &self,
        root: &Path,
        rel: &Path,
        result: &mut RenderResult,
    ) -> Result<(), RenderError> {
        let Some(kind) = FileKind::from_path(rel).filter(FileKind::is_unit) else {
            return Ok(());
        };
        let name = file_name(rel);
        let stem = rel
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let raw = match read_text(root, rel)? {
            Ok(text) => text,
            Err(message) => {
                result.errors.push(error(rel, None, message));
                return Ok(());
            }
        };

        // Referenced environment files are parsed from the raw unit so their
        // values can act as defaults for the unit's own substitution.
        let pre = UnitFile::parse(&raw).unwrap_or_default();
        let mut file_defaults = BTreeMap::new();
        let mut env_refs = Vec::new();
        for entry in pre.get_all("Container", "EnvironmentFile") {
            let value = entry.value.trim().trim_start_matches('-').trim_start();
            if value.is_empty() || Path::new(value).is_absolute() || value.contains('%') {
                continue;
            }
            let optional = entry.value.trim().starts_with('-');
            match resolve_relative(rel, value) {
                Some(env_rel) if root.join(&env_rel).is_file() => {
                    match read_text(root, &env_rel)? {
                        Ok(text) => match parse_env_file(&text) {
                            Ok(vars) => {
                                file_defaults.extend(vars);
                                env_refs.push((value.to_string(), env_rel, text));
                            }
                            Err(errs) => {
                                for e in errs {
                                    result.errors.push(error(&env_rel, Some(e.line), e.message));
                                }
                            }
                        },
                        Err(message) => result.errors.push(error(&env_rel, None, message)),
                    }
                }
                Some(_) if optional => {}
                Some(env_rel) => result.errors.push(error(
                    rel,
                    Some(entry.line),
                    format!("EnvironmentFile '{}' does not exist", env_rel.display()),
                )),
                None => result.errors.push(error(
                    rel,
                    Some(entry.line),
                    format!("EnvironmentFile '{value}' escapes the repository"),
                )),
            }
        }

        let builtins = BTreeMap::from([("APP_NAME".to_string(), stem.clone())]);
        let scope = Scope {
            host: &self.host,
            prefix: service_prefix(&stem),
            file_defaults: &file_defaults,
            builtins: &builtins,
        };
        let no_defaults = BTreeMap::new();
        let env_scope = Scope {
            host: &self.host,
            prefix: service_prefix(&stem),
            file_defaults: &no_defaults,
            builtins: &builtins,
        };

        // Env files first, so the unit can point at their installed names.
        let mut renames = Vec::new();
        for (value, env_rel, text) in env_refs {
            let env_name = file_name(&env_rel);
            let rendered = self.substituted(&env_rel, &text, &env_scope, result);
            if env_name != value {
                renames.push((value, env_name.clone()));
            }
            self.insert(result, env_name, FileKind::Env, env_rel, rendered, None);
        }

        let mut content = self.substituted(rel, &raw, &scope, result);
        if !renames.is_empty() {
            content = rewrite_env_refs(&content, &renames);
        }

        match UnitFile::parse(&content) {
            Ok(unit) => {
                let mut structural = unit.validate(kind);
                let health = match unit_health_check(&unit, &stem) {
                    Ok(h) => h,
                    Err(e) => {
                        structural.push(e);
                        None
                    }
                };
                if structural.is_empty() {
                    self.insert(result, name, kind, rel.to_path_buf(), content, health);
                } else {
                    for e in structural {
                        result.errors.push(error(rel, Some(e.line), e.message));
                    }
                }
            }
            Err(errs) => {
                for e in errs {
                    result.errors.push(error(rel, Some(e.line), e.message));
                }
            }
        }
        Ok(())
    }

    fn substituted(
        &self,
        rel: &Path,
        text: &str,
        scope: &Scope<'_>,
        result: &mut RenderResult,
    ) -> String {
        let out = substitute(text, scope);
        for name in out.missing {
            warn!(file = %rel.display(), variable = %name, "unresolved variable left in place");
            result.warnings.push(RenderWarning::MissingVariable {
                file: rel.to_path_buf(),
                name,
            });
        }
        for (name, message, line) in out.required {
            result
                .errors
                .push(error(rel, Some(line), format!("required variable {name}: {message}")));
        }
        for (reference, line) in out.malformed {
            result
                .errors
                .push(error(rel, Some(line), format!("malformed variable reference '{reference}'")));
        }
        out.text
    }

    fn insert(
        &self,
        result: &mut RenderResult,
        name: String,
        kind: FileKind,
        source: PathBuf,
        content: String,
        health: Option<CheckSpec>,
    ) {
        if let Some(existing) = result.units.units.get(&name) {
            // The same env file shared by several units renders identically
            // only if nothing unit-specific leaked into it.
            if existing.source == source && existing.content == content {
                return;
            }
            result.errors.push(error(
                &source,
                None,
                format!(
                    "installs as '{name}', which is already produced by {}",
                    existing.source.display()
                ),
            ));
            return;
        }
        let unit = RenderedUnit {
            checksum: checksum(&content),
            name: name.clone(),
            kind,
            source,
            content,
            health,
        };
        result.units.units.insert(name, unit);
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn error(file: &Path, line: Option<usize>, message: impl Into<String>) -> ValidationError {
    ValidationError {
        file: file.to_path_buf(),
        line,
        message: message.into(),
    }
}

fn file_name(rel: &Path) -> String {
    rel.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Recursively collect unit files below `dir` as paths relative to `root`.
/// Hidden entries (`.git`, editor swap files) are skipped.
fn collect_units(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RenderError> {
    let entries = std::fs::read_dir(dir).map_err(|source| RenderError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| RenderError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let file_type = entry.file_type().map_err(|source| RenderError::Io {
            path: path.clone(),
            source,
        })?;
        if file_type.is_dir() {
            collect_units(root, &path, out)?;
        } else if FileKind::from_path(&path).is_some_and(|k| k.is_unit()) {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    Ok(())
}

/// `Ok(Err(msg))` for content problems (not UTF-8), `Err` for I/O failures.
fn read_text(root: &Path, rel: &Path) -> Result<Result<String, String>, RenderError> {
    let path = root.join(rel);
    let bytes = std::fs::read(&path).map_err(|source| RenderError::Io { path, source })?;
    Ok(String::from_utf8(bytes).map_err(|_| "file is not valid UTF-8".to_string()))
}

/// Resolve `value` relative to the directory of `unit_rel`, refusing to leave
/// the repository root.
fn resolve_relative(unit_rel: &Path, value: &str) -> Option<PathBuf> {
    let mut out = unit_rel.parent().map(Path::to_path_buf).unwrap_or_default();
    for component in Path::new(value).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Point `EnvironmentFile=` lines at the flattened installed names.
fn rewrite_env_refs(content: &str, renames: &[(String, String)]) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.split_inclusive('\n') {
        let rewritten = line
            .split_once('=')
            .filter(|(key, _)| key.trim() == "EnvironmentFile")
            .and_then(|(_, value)| {
                let value = value.trim();
                let (dash, bare) = match value.strip_prefix('-') {
                    Some(rest) => ("-", rest.trim_start()),
                    None => ("", value),
                };
                renames
                    .iter()
                    .find(|(from, _)| from == bare)
                    .map(|(_, to)| format!("EnvironmentFile={dash}{to}"))
            });
        match rewritten {
            Some(new) => {
                out.push_str(&new);
                if line.ends_with('\n') {
                    out.push('\n');
                }
            }
            None => out.push_str(line),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_resolution_stays_in_repo() {
        assert_eq!(
            resolve_relative(Path::new("apps/web.container"), "web.env"),
            Some(PathBuf::from("apps/web.env"))
        );
        assert_eq!(
            resolve_relative(Path::new("apps/web.container"), "../env/web.env"),
            Some(PathBuf::from("env/web.env"))
        );
        assert_eq!(resolve_relative(Path::new("web.container"), "../x.env"), None);
    }

    #[test]
    fn env_refs_rewritten_to_installed_names() {
        let content = "[Container]\nImage=x\nEnvironmentFile=-../env/web.env\nEnvironmentFile=other.env\n";
        let out = rewrite_env_refs(content, &[("../env/web.env".into(), "web.env".into())]);
        assert_eq!(
            out,
            "[Container]\nImage=x\nEnvironmentFile=-web.env\nEnvironmentFile=other.env\n"
        );
    }

    #[test]
    fn env_refs_tolerate_spaced_keys() {
        let renames = [("env/web.env".to_string(), "web.env".to_string())];
        let out = rewrite_env_refs("[Container]\nEnvironmentFile = env/web.env\n  EnvironmentFile= -env/web.env\n", &renames);
        assert_eq!(out, "[Container]\nEnvironmentFile=web.env\nEnvironmentFile=-web.env\n");
    }

    #[test]
    fn checksum_is_sha256_hex() {
        assert_eq!(
            checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
