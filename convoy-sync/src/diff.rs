//! Dry-run unified diff of a rendered unit set against the unit directory.

use std::io::ErrorKind;
use std::path::Path;

use serde::Serialize;
use similar::TextDiff;

use convoy_renderer::RenderedUnitSet;

use crate::error::io_err;
use crate::writer::plan;
use crate::SyncError;

/// How a single installed file would change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDiff {
    pub name: String,
    pub change: ChangeKind,
    pub unified_diff: String,
}

/// Compare `set` with what is installed in `unit_dir`. `previous` names the
/// files the last deployment installed, so removals can be shown too.
///
/// No files are written.
pub fn diff_unit_dir<'a>(
    unit_dir: &Path,
    set: &RenderedUnitSet,
    previous: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<FileDiff>, SyncError> {
    let planned = plan(unit_dir, set, previous)?;
    let mut diffs = Vec::new();

    for name in &planned.writes {
        let Some(unit) = set.get(name) else {
            continue;
        };
        let existing = read_existing(&unit_dir.join(name))?;
        let change = if existing.is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        let old = existing.unwrap_or_default();
        let new = normalize_line_endings(&unit.content);
        diffs.push(FileDiff {
            name: name.clone(),
            change,
            unified_diff: unified(name, &old, &new),
        });
    }

    for name in &planned.removals {
        let old = read_existing(&unit_dir.join(name))?.unwrap_or_default();
        diffs.push(FileDiff {
            name: name.clone(),
            change: ChangeKind::Removed,
            unified_diff: unified(name, &old, ""),
        });
    }

    diffs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(diffs)
}

fn unified(name: &str, old: &str, new: &str) -> String {
    let old_header = format!("a/{name}");
    let new_header = format!("b/{name}");
    TextDiff::from_lines(old, new)
        .unified_diff()
        .header(&old_header, &new_header)
        .context_radius(3)
        .to_string()
}

fn read_existing(path: &Path) -> Result<Option<String>, SyncError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(normalize_line_endings(&content))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

fn normalize_line_endings(content: &str) -> String {
    content.replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use convoy_core::CommitRef;
    use convoy_renderer::{checksum, FileKind, RenderedUnit};
    use tempfile::TempDir;

    use super::*;

    fn unit_set(files: &[(&str, &str)]) -> RenderedUnitSet {
        let mut set = RenderedUnitSet::new(CommitRef::from("c"));
        for (name, content) in files {
            set.units.insert(
                name.to_string(),
                RenderedUnit {
                    name: name.to_string(),
                    kind: FileKind::Container,
                    source: PathBuf::from(name),
                    content: content.to_string(),
                    checksum: checksum(content),
                    health: None,
                },
            );
        }
        set
    }

    #[test]
    fn in_sync_directory_has_no_diff() {
        let dir = TempDir::new().expect("dir");
        fs::write(dir.path().join("web.container"), "[Container]\nImage=a\n").expect("write");
        let set = unit_set(&[("web.container", "[Container]\nImage=a\n")]);
        let diffs = diff_unit_dir(dir.path(), &set, ["web.container"]).expect("diff");
        assert!(diffs.is_empty());
    }

    #[test]
    fn modification_addition_and_removal_are_shown() {
        let dir = TempDir::new().expect("dir");
        fs::write(dir.path().join("web.container"), "[Container]\nImage=a\n").expect("write");
        fs::write(dir.path().join("old.container"), "[Container]\nImage=o\n").expect("write");
        let set = unit_set(&[
            ("web.container", "[Container]\nImage=b\n"),
            ("new.container", "[Container]\nImage=n\n"),
        ]);

        let diffs =
            diff_unit_dir(dir.path(), &set, ["web.container", "old.container"]).expect("diff");
        let kinds: Vec<_> = diffs.iter().map(|d| (d.name.as_str(), d.change)).collect();
        assert_eq!(
            kinds,
            vec![
                ("new.container", ChangeKind::Added),
                ("old.container", ChangeKind::Removed),
                ("web.container", ChangeKind::Modified),
            ]
        );
        let web = &diffs[2].unified_diff;
        assert!(web.contains("--- a/web.container"));
        assert!(web.contains("+++ b/web.container"));
        assert!(web.contains("-Image=a"));
        assert!(web.contains("+Image=b"));
        // Nothing was written.
        assert!(!dir.path().join("new.container").exists());
    }
}
