//! Service Activator: hands installed units to systemd.
//!
//! Quadlet units become services only after `daemon-reload` runs the
//! generator, so every activation starts with a reload. Restarting a changed
//! service and starting an already-running one are both safe to repeat.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

/// Services to bring up after the unit directory changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationSet {
    /// Workload services whose unit or environment changed; restarted.
    pub restart: BTreeSet<String>,
    /// Every workload service in the deployed set; started if not running.
    pub ensure: BTreeSet<String>,
}

impl ActivationSet {
    pub fn is_empty(&self) -> bool {
        self.restart.is_empty() && self.ensure.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("could not run systemctl: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("systemctl {args} failed (exit code {code:?}): {stderr}")]
    Command {
        args: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Applies unit sets to the process supervisor.
pub trait ServiceActivator: Send {
    /// Reload unit definitions, then restart or start `set`.
    fn activate(&mut self, set: &ActivationSet) -> Result<(), ActivationError>;

    /// Stop `services` and reload. Stopping an inactive or unknown service
    /// succeeds.
    fn deactivate(&mut self, services: &BTreeSet<String>) -> Result<(), ActivationError>;
}

/// `systemctl` (optionally `--user`) driven activator.
#[derive(Debug, Clone)]
pub struct SystemdActivator {
    program: PathBuf,
    user_mode: bool,
}

impl SystemdActivator {
    pub fn new(user_mode: bool) -> Self {
        Self::with_program("systemctl", user_mode)
    }

    /// Drive `program` instead of the `systemctl` found on `PATH`.
    pub fn with_program(program: impl Into<PathBuf>, user_mode: bool) -> Self {
        Self {
            program: program.into(),
            user_mode,
        }
    }

    fn systemctl(&self, args: &[&str]) -> Result<String, ActivationError> {
        let mut cmd = Command::new(&self.program);
        if self.user_mode {
            cmd.arg("--user");
        }
        cmd.args(args);
        debug!(args = %args.join(" "), "systemctl");
        let output = cmd.output().map_err(ActivationError::Spawn)?;
        if !output.status.success() {
            return Err(ActivationError::Command {
                args: args.join(" "),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn daemon_reload(&self) -> Result<(), ActivationError> {
        self.systemctl(&["daemon-reload"]).map(|_| ())
    }
}

impl ServiceActivator for SystemdActivator {
    fn activate(&mut self, set: &ActivationSet) -> Result<(), ActivationError> {
        self.daemon_reload()?;
        for service in &set.restart {
            self.systemctl(&["restart", service.as_str()])?;
            info!(service = %service, "service restarted");
        }
        for service in set.ensure.difference(&set.restart) {
            self.systemctl(&["start", service.as_str()])?;
            debug!(service = %service, "service started");
        }
        Ok(())
    }

    fn deactivate(&mut self, services: &BTreeSet<String>) -> Result<(), ActivationError> {
        for service in services {
            match self.systemctl(&["stop", service.as_str()]) {
                Ok(_) => info!(service = %service, "service stopped"),
                // Exit code 5: unit not loaded. Already gone counts as stopped.
                Err(ActivationError::Command { code: Some(5), .. }) => {
                    debug!(service = %service, "service not loaded");
                }
                Err(e) => return Err(e),
            }
        }
        if !services.is_empty() {
            self.daemon_reload()?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    /// `systemctl` stand-in that logs each invocation and answers exit 5
    /// (unit not loaded) for `missing.service`.
    fn fake_systemctl(dir: &Path) -> PathBuf {
        let path = dir.join("systemctl");
        let script = format!(
            "#!/bin/sh\n\
             echo \"$@\" >> '{log}'\n\
             case \"$*\" in\n\
               *'stop missing.service'*) echo 'Unit missing.service not loaded.' >&2; exit 5 ;;\n\
               *'broken.service'*) echo 'Job failed.' >&2; exit 1 ;;\n\
             esac\n",
            log = dir.join("calls.log").display()
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn calls(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join("calls.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn services(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reloads_then_restarts_then_starts_the_rest() {
        let dir = TempDir::new().unwrap();
        let mut activator = SystemdActivator::with_program(fake_systemctl(dir.path()), true);
        let set = ActivationSet {
            restart: services(&["web.service"]),
            ensure: services(&["db.service", "web.service"]),
        };
        activator.activate(&set).unwrap();
        assert_eq!(
            calls(dir.path()),
            vec![
                "--user daemon-reload",
                "--user restart web.service",
                "--user start db.service",
            ]
        );
    }

    #[test]
    fn system_mode_omits_user_flag() {
        let dir = TempDir::new().unwrap();
        let mut activator = SystemdActivator::with_program(fake_systemctl(dir.path()), false);
        activator
            .activate(&ActivationSet {
                restart: BTreeSet::new(),
                ensure: services(&["web.service"]),
            })
            .unwrap();
        assert_eq!(calls(dir.path()), vec!["daemon-reload", "start web.service"]);
    }

    #[test]
    fn stopping_an_unloaded_unit_succeeds_and_reloads() {
        let dir = TempDir::new().unwrap();
        let mut activator = SystemdActivator::with_program(fake_systemctl(dir.path()), true);
        activator
            .deactivate(&services(&["missing.service", "web.service"]))
            .unwrap();
        assert_eq!(
            calls(dir.path()),
            vec![
                "--user stop missing.service",
                "--user stop web.service",
                "--user daemon-reload",
            ]
        );
    }

    #[test]
    fn other_failures_stop_activation() {
        let dir = TempDir::new().unwrap();
        let mut activator = SystemdActivator::with_program(fake_systemctl(dir.path()), true);
        let err = activator
            .activate(&ActivationSet {
                restart: services(&["broken.service"]),
                ensure: services(&["broken.service", "web.service"]),
            })
            .unwrap_err();
        match err {
            ActivationError::Command { args, code, stderr } => {
                assert_eq!(args, "restart broken.service");
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "Job failed.");
            }
            other => panic!("expected a command failure, got {other:?}"),
        }
        assert!(!calls(dir.path()).iter().any(|c| c.contains("web.service")));

        let err = activator.deactivate(&services(&["broken.service"])).unwrap_err();
        assert!(matches!(err, ActivationError::Command { code: Some(1), .. }));
    }

    #[test]
    fn nothing_to_stop_means_no_reload() {
        let dir = TempDir::new().unwrap();
        let mut activator = SystemdActivator::with_program(fake_systemctl(dir.path()), true);
        activator.deactivate(&BTreeSet::new()).unwrap();
        assert!(calls(dir.path()).is_empty());
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let dir = TempDir::new().unwrap();
        let mut activator = SystemdActivator::with_program(dir.path().join("nope"), true);
        assert!(matches!(
            activator.activate(&ActivationSet::default()),
            Err(ActivationError::Spawn(_))
        ));
    }
}
