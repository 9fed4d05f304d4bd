//! Host-wide engine lock.
//!
//! Only the process holding `state/engine.lock` may recover or run cycles
//! against the ledger. The lock is an `flock(LOCK_EX | LOCK_NB)` on a file that
//! stays open for the guard's lifetime, so the kernel releases it when the
//! holder exits, crashes included. An open ledger record found by the new
//! holder therefore belongs to a dead process.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::LockError;
use crate::paths;

/// Held exclusive engine lock. Released on drop.
pub struct EngineLock {
    _file: File,
    path: PathBuf,
}

impl fmt::Debug for EngineLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineLock")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl EngineLock {
    /// Take the lock in `state_dir` without blocking.
    ///
    /// Fails with [`LockError::Held`] (naming the holder's pid when it is
    /// readable) while another process owns it.
    pub fn acquire(state_dir: &Path) -> Result<Self, LockError> {
        paths::ensure_private_dir(state_dir).map_err(|e| LockError::Io {
            path: state_dir.to_path_buf(),
            source: e,
        })?;
        let path = paths::engine_lock_path_in(state_dir);
        let io = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io)?;
        if let Err(e) = paths::set_mode(&path, 0o600) {
            warn!(path = %path.display(), error = %e, "could not restrict engine lock permissions");
        }

        if !try_flock_exclusive(&file).map_err(io)? {
            let mut holder = String::new();
            let pid = file
                .read_to_string(&mut holder)
                .ok()
                .and_then(|_| holder.trim().parse().ok());
            return Err(LockError::Held {
                path: path.clone(),
                pid,
            });
        }

        file.set_len(0).map_err(io)?;
        file.seek(SeekFrom::Start(0)).map_err(io)?;
        writeln!(file, "{}", std::process::id()).map_err(io)?;
        file.flush().map_err(io)?;
        debug!(path = %path.display(), "engine lock acquired");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: `file` owns a valid descriptor for the duration of the call.
    #[allow(unsafe_code)]
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> io::Result<bool> {
    Ok(true)
}
