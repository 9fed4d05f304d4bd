//! `${VAR}` substitution with layered resolution.
//!
//! | Syntax              | Meaning                                        |
//! |---------------------|------------------------------------------------|
//! | `${NAME}`           | optional; left verbatim and reported if unset  |
//! | `${NAME:-default}`  | inline default                                 |
//! | `${NAME:?message}`  | required; unset is a validation error          |
//! | `$$`                | a literal `$`                                  |
//!
//! A lone `$` not followed by `{` or `$` is copied through, so systemd
//! specifiers like `$MAINPID` survive untouched.

use std::collections::BTreeMap;

/// Host-side variables, captured once so repeated renders see the same values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEnv {
    vars: BTreeMap<String, String>,
}

impl HostEnv {
    /// Process environment overlaid with `overrides` (configured variables win).
    pub fn capture(overrides: &BTreeMap<String, String>) -> Self {
        let mut vars: BTreeMap<String, String> = std::env::vars().collect();
        vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { vars }
    }

    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// `web-app` -> `WEB_APP`.
pub fn service_prefix(stem: &str) -> String {
    stem.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Resolution scope for one unit.
#[derive(Debug)]
pub struct Scope<'a> {
    pub host: &'a HostEnv,
    /// Service prefix for level-1 lookups.
    pub prefix: String,
    /// Values from the unit's own environment files.
    pub file_defaults: &'a BTreeMap<String, String>,
    /// Built-ins such as `APP_NAME`, consulted after host variables.
    pub builtins: &'a BTreeMap<String, String>,
}

impl Scope<'_> {
    /// Precedence: prefixed host, generic host, built-in, inline default,
    /// file default.
    fn resolve(&self, name: &str, inline_default: Option<&str>) -> Option<String> {
        let prefixed = format!("{}_{name}", self.prefix);
        self.host
            .get(&prefixed)
            .or_else(|| self.host.get(name))
            .or_else(|| self.builtins.get(name).map(String::as_str))
            .or(inline_default)
            .or_else(|| self.file_defaults.get(name).map(String::as_str))
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substituted {
    pub text: String,
    /// Optional variables left unresolved, deduplicated, in first-seen order.
    pub missing: Vec<String>,
    /// Required variables that could not be resolved: `(name, message, line)`.
    pub required: Vec<(String, String, usize)>,
    /// Malformed references: `(reference, line)`.
    pub malformed: Vec<(String, usize)>,
}

enum Modifier<'t> {
    None,
    Default(&'t str),
    Required(&'t str),
}

pub fn substitute(text: &str, scope: &Scope<'_>) -> Substituted {
    let mut out = Substituted {
        text: String::with_capacity(text.len()),
        ..Substituted::default()
    };
    let mut rest = text;
    let mut line = 1;

    while let Some(pos) = rest.find('$') {
        let (before, tail) = rest.split_at(pos);
        line += before.matches('\n').count();
        out.text.push_str(before);

        if let Some(after) = tail.strip_prefix("$$") {
            out.text.push('$');
            rest = after;
            continue;
        }
        let Some(body_start) = tail.strip_prefix("${") else {
            out.text.push('$');
            rest = &tail[1..];
            continue;
        };
        let Some(end) = body_start.find('}') else {
            out.malformed.push((tail.lines().next().unwrap_or(tail).to_string(), line));
            out.text.push_str(tail);
            rest = "";
            break;
        };
        let body = &body_start[..end];
        let original = &tail[..end + 3];
        rest = &body_start[end + 1..];

        let (name, modifier) = split_reference(body);
        if !is_name(name) {
            out.malformed.push((original.to_string(), line));
            out.text.push_str(original);
            continue;
        }
        let inline = match modifier {
            Modifier::Default(d) => Some(d),
            _ => None,
        };
        match scope.resolve(name, inline) {
            Some(value) => out.text.push_str(&value),
            None => {
                out.text.push_str(original);
                match modifier {
                    Modifier::Required(msg) => {
                        let msg = if msg.is_empty() {
                            "required variable is not set".to_string()
                        } else {
                            msg.to_string()
                        };
                        out.required.push((name.to_string(), msg, line));
                    }
                    _ => {
                        if !out.missing.iter().any(|m| m == name) {
                            out.missing.push(name.to_string());
                        }
                    }
                }
            }
        }
    }
    out.text.push_str(rest);
    out
}

fn split_reference(body: &str) -> (&str, Modifier<'_>) {
    if let Some((name, default)) = body.split_once(":-") {
        return (name, Modifier::Default(default));
    }
    if let Some((name, msg)) = body.split_once(":?") {
        return (name, Modifier::Required(msg));
    }
    (body, Modifier::None)
}

fn is_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
