//! Quadlet unit files: kinds, service-name mapping and INI parsing.

use std::fmt;
use std::path::Path;

use serde::Serialize;

/// Kind of a file in the desired-state tree, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Container,
    Pod,
    Kube,
    Network,
    Volume,
    Image,
    Build,
    /// `KEY=VALUE` environment file referenced by a unit.
    Env,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "container" => Some(FileKind::Container),
            "pod" => Some(FileKind::Pod),
            "kube" => Some(FileKind::Kube),
            "network" => Some(FileKind::Network),
            "volume" => Some(FileKind::Volume),
            "image" => Some(FileKind::Image),
            "build" => Some(FileKind::Build),
            "env" => Some(FileKind::Env),
            _ => None,
        }
    }

    pub fn is_unit(&self) -> bool {
        !matches!(self, FileKind::Env)
    }

    /// Section every unit of this kind must declare.
    pub fn main_section(&self) -> Option<&'static str> {
        match self {
            FileKind::Container => Some("Container"),
            FileKind::Pod => Some("Pod"),
            FileKind::Kube => Some("Kube"),
            FileKind::Network => Some("Network"),
            FileKind::Volume => Some("Volume"),
            FileKind::Image => Some("Image"),
            FileKind::Build => Some("Build"),
            FileKind::Env => None,
        }
    }

    /// Key the main section cannot do without.
    fn required_key(&self) -> Option<&'static str> {
        match self {
            FileKind::Container | FileKind::Image => Some("Image"),
            FileKind::Kube => Some("Yaml"),
            FileKind::Build => Some("ImageTag"),
            _ => None,
        }
    }

    /// Containers, pods and kube units are started explicitly; the rest are
    /// pulled in as dependencies once the generator has run.
    pub fn starts_directly(&self) -> bool {
        matches!(self, FileKind::Container | FileKind::Pod | FileKind::Kube)
    }

    /// Name of the systemd service the generator produces for `stem`.
    pub fn service_name(&self, stem: &str) -> Option<String> {
        match self {
            FileKind::Container | FileKind::Kube => Some(format!("{stem}.service")),
            FileKind::Pod => Some(format!("{stem}-pod.service")),
            FileKind::Network => Some(format!("{stem}-network.service")),
            FileKind::Volume => Some(format!("{stem}-volume.service")),
            FileKind::Image => Some(format!("{stem}-image.service")),
            FileKind::Build => Some(format!("{stem}-build.service")),
            FileKind::Env => None,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileKind::Container => "container",
            FileKind::Pod => "pod",
            FileKind::Kube => "kube",
            FileKind::Network => "network",
            FileKind::Volume => "volume",
            FileKind::Image => "image",
            FileKind::Build => "build",
            FileKind::Env => "env",
        };
        f.write_str(s)
    }
}

/// Service name for a unit file name such as `web.container`.
pub fn service_for_file(name: &str) -> Option<String> {
    let path = Path::new(name);
    let kind = FileKind::from_path(path)?;
    let stem = path.file_stem()?.to_str()?;
    kind.service_name(stem)
}

// ---------------------------------------------------------------------------
// INI parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: String,
    /// 1-based line of the key.
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub line: usize,
    pub entries: Vec<Entry>,
}

/// Parsed unit file. Sections and entries keep file order; repeated keys are
/// preserved because systemd treats many of them as lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFile {
    pub sections: Vec<Section>,
}

/// A syntax error with its 1-based line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub line: usize,
    pub message: String,
}

impl UnitFile {
    /// Parse `text`, collecting every syntax error rather than stopping at the first.
    pub fn parse(text: &str) -> Result<Self, Vec<SyntaxError>> {
        let mut unit = UnitFile::default();
        let mut errors = Vec::new();
        let mut pending: Option<(String, String, usize)> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;

            if let Some((key, mut value, start)) = pending.take() {
                let (piece, continues) = strip_continuation(raw.trim());
                value.push(' ');
                value.push_str(piece);
                if continues {
                    pending = Some((key, value, start));
                } else {
                    push_entry(&mut unit, &mut errors, key, value, start);
                }
                continue;
            }

            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                match line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                    Some(name) if !name.trim().is_empty() && !name.contains(['[', ']']) => {
                        unit.sections.push(Section {
                            name: name.trim().to_string(),
                            line: line_no,
                            entries: Vec::new(),
                        });
                    }
                    _ => errors.push(SyntaxError {
                        line: line_no,
                        message: format!("malformed section header '{line}'"),
                    }),
                }
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                errors.push(SyntaxError {
                    line: line_no,
                    message: format!("expected Key=Value, found '{line}'"),
                });
                continue;
            };
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                errors.push(SyntaxError {
                    line: line_no,
                    message: format!("invalid key '{key}'"),
                });
                continue;
            }
            let (value, continues) = strip_continuation(value.trim());
            if continues {
                pending = Some((key.to_string(), value.to_string(), line_no));
            } else {
                push_entry(&mut unit, &mut errors, key.to_string(), value.to_string(), line_no);
            }
        }
        if let Some((key, value, start)) = pending {
            push_entry(&mut unit, &mut errors, key, value, start);
        }

        if errors.is_empty() {
            Ok(unit)
        } else {
            Err(errors)
        }
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Last value of `key` in `section`, matching systemd's override rule.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .filter(|s| s.name == section)
            .flat_map(|s| s.entries.iter())
            .filter(|e| e.key == key)
            .last()
            .map(|e| e.value.as_str())
    }

    /// Every value of `key` in `section`, in order.
    pub fn get_all<'a>(&'a self, section: &'a str, key: &'a str) -> impl Iterator<Item = &'a Entry> + 'a {
        self.sections
            .iter()
            .filter(move |s| s.name == section)
            .flat_map(|s| s.entries.iter())
            .filter(move |e| e.key == key)
    }

    /// Structural checks for a unit of `kind`.
    pub fn validate(&self, kind: FileKind) -> Vec<SyntaxError> {
        let mut errors = Vec::new();
        let Some(main) = kind.main_section() else {
            return errors;
        };
        match self.section(main) {
            None => errors.push(SyntaxError {
                line: 1,
                message: format!("{kind} unit has no [{main}] section"),
            }),
            Some(section) => {
                if let Some(key) = kind.required_key() {
                    let present = self
                        .get(main, key)
                        .map(|v| !v.trim().is_empty())
                        .unwrap_or(false);
                    if !present {
                        errors.push(SyntaxError {
                            line: section.line,
                            message: format!("[{main}] is missing {key}="),
                        });
                    }
                }
            }
        }
        errors
    }
}

fn strip_continuation(value: &str) -> (&str, bool) {
    match value.strip_suffix('\\') {
        Some(rest) => (rest.trim_end(), true),
        None => (value, false),
    }
}

fn push_entry(
    unit: &mut UnitFile,
    errors: &mut Vec<SyntaxError>,
    key: String,
    value: String,
    line: usize,
) {
    match unit.sections.last_mut() {
        Some(section) => section.entries.push(Entry { key, value, line }),
        None => errors.push(SyntaxError {
            line,
            message: format!("'{key}' appears before any [Section] header"),
        }),
    }
}

/// Parse a `KEY=VALUE` environment file. Blank lines, comments and an
/// optional `export ` prefix are accepted; values may be single- or
/// double-quoted.
pub fn parse_env_file(text: &str) -> Result<Vec<(String, String)>, Vec<SyntaxError>> {
    let mut vars = Vec::new();
    let mut errors = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            errors.push(SyntaxError {
                line: idx + 1,
                message: format!("expected NAME=value, found '{line}'"),
            });
            continue;
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            errors.push(SyntaxError {
                line: idx + 1,
                message: format!("invalid variable name '{key}'"),
            });
            continue;
        }
        vars.push((key.to_string(), unquote(value.trim()).to_string()));
    }
    if errors.is_empty() {
        Ok(vars)
    } else {
        Err(errors)
    }
}

fn unquote(value: &str) -> &str {
    for q in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(q) && value.ends_with(q) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("web.container", Some("web.service"))]
    #[case("app.kube", Some("app.service"))]
    #[case("stack.pod", Some("stack-pod.service"))]
    #[case("net.network", Some("net-network.service"))]
    #[case("data.volume", Some("data-volume.service"))]
    #[case("base.image", Some("base-image.service"))]
    #[case("tool.build", Some("tool-build.service"))]
    #[case("web.env", None)]
    #[case("README.md", None)]
    fn service_names(#[case] file: &str, #[case] expected: Option<&str>) {
        assert_eq!(service_for_file(file).as_deref(), expected);
    }

    #[test]
    fn only_workloads_start_directly() {
        assert!(FileKind::Container.starts_directly());
        assert!(FileKind::Pod.starts_directly());
        assert!(FileKind::Kube.starts_directly());
        assert!(!FileKind::Network.starts_directly());
        assert!(!FileKind::Volume.starts_directly());
    }

    #[test]
    fn parses_sections_entries_and_continuations() {
        let text = "# web\n[Unit]\nDescription=Web\n\n[Container]\nImage=nginx\nPublishPort=80:80\nPublishPort=443:443\nExec=/bin/sh -c \\\n  'sleep 1'\n";
        let unit = UnitFile::parse(text).expect("parse");
        assert_eq!(unit.sections.len(), 2);
        assert_eq!(unit.get("Container", "Image"), Some("nginx"));
        assert_eq!(unit.get_all("Container", "PublishPort").count(), 2);
        assert_eq!(unit.get("Container", "Exec"), Some("/bin/sh -c 'sleep 1'"));
        assert!(unit.validate(FileKind::Container).is_empty());
    }

    #[test]
    fn collects_every_syntax_error() {
        let text = "Orphan=1\n[Container\nImage=nginx\njust words\n";
        let errors = UnitFile::parse(text).expect_err("invalid");
        let lines: Vec<usize> = errors.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![1, 2, 3, 4]);
    }

    #[test]
    fn container_requires_image() {
        let unit = UnitFile::parse("[Container]\nPublishPort=80\n").expect("parse");
        let errors = unit.validate(FileKind::Container);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("Image="));

        let unit = UnitFile::parse("[Unit]\nDescription=x\n").expect("parse");
        assert!(unit.validate(FileKind::Container)[0]
            .message
            .contains("no [Container] section"));
    }

    #[test]
    fn env_file_parsing() {
        let vars = parse_env_file("# c\nexport A=1\nB=\"two words\"\nC='x'\n\nD=\n").expect("parse");
        assert_eq!(
            vars,
            vec![
                ("A".into(), "1".into()),
                ("B".into(), "two words".into()),
                ("C".into(), "x".into()),
                ("D".into(), String::new()),
            ]
        );
        assert!(parse_env_file("not a var\n").is_err());
    }
}
