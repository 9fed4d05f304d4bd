//! Unit-declared health checks.
//!
//! An `[X-Health]` section wins; otherwise a `[Container] HealthCmd=` is run
//! through `podman healthcheck run`. Systemd ignores `X-` sections, so the
//! declaration travels inside the installed unit harmlessly.

use convoy_core::CheckSpec;

use crate::unit::{SyntaxError, UnitFile};

pub const HEALTH_SECTION: &str = "X-Health";

/// Check declared by `unit`, or `None` when it declares nothing.
pub fn unit_health_check(unit: &UnitFile, stem: &str) -> Result<Option<CheckSpec>, SyntaxError> {
    if let Some(section) = unit.section(HEALTH_SECTION) {
        let line = section.line;
        let field = |key: &str| unit.get(HEALTH_SECTION, key).map(str::trim);
        let missing = |key: &str| SyntaxError {
            line,
            message: format!("[{HEALTH_SECTION}] is missing {key}="),
        };
        let kind = field("Type").ok_or_else(|| missing("Type"))?;
        let spec = match kind.to_ascii_lowercase().as_str() {
            "http" => {
                let url = field("Url").ok_or_else(|| missing("Url"))?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(SyntaxError {
                        line,
                        message: format!("[{HEALTH_SECTION}] Url '{url}' must be http(s)"),
                    });
                }
                CheckSpec::Http {
                    url: url.to_string(),
                }
            }
            "tcp" => {
                let port = field("Port").ok_or_else(|| missing("Port"))?;
                let port: u16 = port.parse().ok().filter(|p| *p != 0).ok_or_else(|| SyntaxError {
                    line,
                    message: format!("[{HEALTH_SECTION}] Port '{port}' is not a valid port"),
                })?;
                CheckSpec::Tcp {
                    host: field("Host").unwrap_or("127.0.0.1").to_string(),
                    port,
                }
            }
            "command" => CheckSpec::Command {
                command: field("Command")
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| missing("Command"))?
                    .to_string(),
            },
            "process" => CheckSpec::Process,
            other => {
                return Err(SyntaxError {
                    line,
                    message: format!(
                        "[{HEALTH_SECTION}] Type '{other}' is not one of http, tcp, command, process"
                    ),
                })
            }
        };
        return Ok(Some(spec));
    }

    if unit
        .get("Container", "HealthCmd")
        .is_some_and(|cmd| !cmd.trim().is_empty() && cmd.trim() != "none")
    {
        return Ok(Some(CheckSpec::Command {
            command: format!("podman healthcheck run {}", container_name(unit, stem)),
        }));
    }
    Ok(None)
}

/// Name the generator gives the container: `ContainerName=` or `systemd-<stem>`.
pub fn container_name(unit: &UnitFile, stem: &str) -> String {
    unit.get("Container", "ContainerName")
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("systemd-{stem}"))
}

/// Name the generator gives the pod: `PodName=` or `systemd-<stem>`.
pub fn pod_name(unit: &UnitFile, stem: &str) -> String {
    unit.get("Pod", "PodName")
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("systemd-{stem}"))
}
