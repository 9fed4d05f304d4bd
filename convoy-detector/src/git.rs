//! [`GitSource`] backed by the `git` command-line client.
//!
//! The checkout directory is a private clone owned by convoy. `fetch` only
//! moves the remote-tracking ref; the worktree changes only in `checkout`.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use convoy_core::CommitRef;
use tracing::{debug, info};

use crate::{DetectError, GitSource, WorkingTree};

#[derive(Debug, Clone)]
pub struct GitCli {
    repository: String,
    dir: PathBuf,
}

impl GitCli {
    pub fn new(repository: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn is_cloned(&self) -> bool {
        self.dir.join(".git").exists()
    }

    fn clone_repo(&self, branch: &str) -> Result<(), DetectError> {
        if let Some(parent) = self.dir.parent() {
            std::fs::create_dir_all(parent).map_err(|source| DetectError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        info!(repository = %self.repository, branch, dir = %self.dir.display(), "cloning source repository");
        let dir = self.dir.to_string_lossy().into_owned();
        run(
            None,
            &[
                "clone",
                "--quiet",
                "--no-checkout",
                "--branch",
                branch,
                &self.repository,
                &dir,
            ],
        )
        .map(|_| ())
    }

    fn git(&self, args: &[&str]) -> Result<String, DetectError> {
        run(Some(&self.dir), args)
    }

    fn commit_exists(&self, commit: &CommitRef) -> bool {
        let spec = format!("{}^{{commit}}", commit.0);
        self.git(&["cat-file", "-e", &spec]).is_ok()
    }
}

impl GitSource for GitCli {
    fn fetch(&mut self, branch: &str) -> Result<CommitRef, DetectError> {
        let transient = |e: DetectError| DetectError::Transient {
            branch: branch.to_string(),
            message: e.to_string(),
        };
        if !self.is_cloned() {
            self.clone_repo(branch).map_err(transient)?;
        }
        let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
        self.git(&["fetch", "--quiet", "--prune", "origin", &refspec])
            .map_err(transient)?;

        let tracking = format!("refs/remotes/origin/{branch}^{{commit}}");
        let head = self.git(&["rev-parse", "--verify", &tracking])?;
        let head = head.trim();
        if head.len() < 40 || !head.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DetectError::BadCommit(head.to_string()));
        }
        debug!(branch, commit = head, "fetched");
        Ok(CommitRef::from(head))
    }

    fn checkout(&mut self, commit: &CommitRef) -> Result<WorkingTree, DetectError> {
        self.git(&["checkout", "--quiet", "--force", "--detach", &commit.0])?;
        self.git(&["clean", "-ffdxq"])?;
        Ok(WorkingTree {
            root: self.dir.clone(),
            commit: commit.clone(),
        })
    }

    fn changed_paths(
        &self,
        from: Option<&CommitRef>,
        to: &CommitRef,
    ) -> Result<Vec<PathBuf>, DetectError> {
        let listing = match from {
            Some(from) if self.commit_exists(from) => {
                self.git(&["diff", "--name-only", "--no-renames", &from.0, &to.0])?
            }
            _ => self.git(&["ls-tree", "-r", "--name-only", &to.0])?,
        };
        Ok(listing
            .lines()
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect())
    }
}

fn run(dir: Option<&Path>, args: &[&str]) -> Result<String, DetectError> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    // Never block on a credential prompt in an unattended daemon.
    cmd.env("GIT_TERMINAL_PROMPT", "0").args(args);
    let Output {
        status,
        stdout,
        stderr,
    } = cmd.output().map_err(DetectError::Spawn)?;
    if !status.success() {
        return Err(DetectError::Git {
            args: args.join(" "),
            status: status.to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}
