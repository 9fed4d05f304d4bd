//! On-disk layout of a convoy host.
//!
//! ```text
//! ~/.convoy/
//!   config.yaml
//!   state/ledger.db        (mode 0600)
//!   state/engine.lock      held by the process that reconciles
//!   backups/objects/       content-addressed file bodies
//!   backups/snapshots/     one manifest per snapshot
//!   repo/                  git checkout of the source
//!   run/daemon.sock        control socket
//! ~/.config/containers/systemd/   deployed units (default unit_dir)
//! ```
//!
//! Every helper has an `_at(home)` form used by tests and a no-arg form that
//! resolves the home directory through `dirs::home_dir()`.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// `<home>/.convoy`
pub fn convoy_dir_at(home: &Path) -> PathBuf {
    home.join(".convoy")
}

pub fn config_path_at(home: &Path) -> PathBuf {
    convoy_dir_at(home).join("config.yaml")
}

pub fn state_dir_at(home: &Path) -> PathBuf {
    convoy_dir_at(home).join("state")
}

pub fn ledger_path_in(state_dir: &Path) -> PathBuf {
    state_dir.join("ledger.db")
}

pub fn engine_lock_path_in(state_dir: &Path) -> PathBuf {
    state_dir.join("engine.lock")
}

pub fn backup_dir_at(home: &Path) -> PathBuf {
    convoy_dir_at(home).join("backups")
}

pub fn checkout_dir_at(home: &Path) -> PathBuf {
    convoy_dir_at(home).join("repo")
}

pub fn socket_path_at(home: &Path) -> PathBuf {
    convoy_dir_at(home).join("run").join("daemon.sock")
}

/// Default Quadlet search path for rootless units.
pub fn unit_dir_at(home: &Path) -> PathBuf {
    home.join(".config").join("containers").join("systemd")
}

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_path_at(&home()?))
}

pub fn socket_path() -> Result<PathBuf, ConfigError> {
    Ok(socket_path_at(&home()?))
}

/// Create `dir` (and parents) and restrict it to the owner.
pub fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        set_mode(dir, 0o700)?;
    }
    Ok(())
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn layout_is_rooted_in_dot_convoy() {
        let home = TempDir::new().expect("tempdir");
        let h = home.path();
        assert!(config_path_at(h).ends_with(".convoy/config.yaml"));
        assert!(ledger_path_in(&state_dir_at(h)).ends_with(".convoy/state/ledger.db"));
        assert!(socket_path_at(h).ends_with(".convoy/run/daemon.sock"));
        assert!(unit_dir_at(h).ends_with(".config/containers/systemd"));
    }

    #[test]
    fn private_dir_created_with_perms() {
        let home = TempDir::new().expect("tempdir");
        let dir = home.path().join("a").join("b");
        ensure_private_dir(&dir).expect("mkdir");
        assert!(dir.is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
        }
    }
}
