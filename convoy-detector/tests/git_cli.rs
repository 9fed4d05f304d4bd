//! `GitCli` against a real local repository.
//!
//! Skipped (passes trivially) on hosts without a `git` binary.

use std::path::{Path, PathBuf};
use std::process::Command;

use convoy_core::CommitRef;
use convoy_detector::{ChangeDetector, Detection, GitCli, GitSource};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .current_dir(dir)
        .args([
            "-c",
            "user.name=convoy-test",
            "-c",
            "user.email=test@convoy.invalid",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn upstream() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    git(dir.path(), &["init", "--quiet"]);
    git(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);
    dir
}

fn commit(repo: &Path, file: &str, body: &str) -> CommitRef {
    let path = repo.join(file);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir");
    }
    std::fs::write(&path, body).expect("write");
    git(repo, &["add", "--all"]);
    git(repo, &["commit", "--quiet", "-m", file]);
    CommitRef::from(git(repo, &["rev-parse", "HEAD"]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn first_fetch_clones_and_lists_all_paths() {
    if !git_available() {
        return;
    }
    let remote = upstream();
    commit(remote.path(), "web.container", "[Container]\nImage=nginx\n");
    let head = commit(remote.path(), "db/db.container", "[Container]\nImage=postgres\n");

    let work = TempDir::new().expect("tempdir");
    let source = GitCli::new(remote.path().to_string_lossy(), work.path().join("repo"));
    let mut detector = ChangeDetector::new(source, "main");

    match detector.detect(None).expect("detect") {
        Detection::Change {
            new_ref,
            mut changed_paths,
        } => {
            assert_eq!(new_ref, head);
            changed_paths.sort();
            assert_eq!(
                changed_paths,
                vec![PathBuf::from("db/db.container"), PathBuf::from("web.container")]
            );
        }
        other => panic!("expected change, got {other:?}"),
    }
}

#[test]
fn unchanged_remote_reports_no_change_and_leaves_worktree_alone() {
    if !git_available() {
        return;
    }
    let remote = upstream();
    let head = commit(remote.path(), "web.container", "[Container]\nImage=nginx\n");

    let work = TempDir::new().expect("tempdir");
    let dir = work.path().join("repo");
    let mut detector = ChangeDetector::new(GitCli::new(remote.path().to_string_lossy(), &dir), "main");

    detector.detect(None).expect("first detect");
    let again = detector.detect(Some(&head)).expect("second detect");
    assert_eq!(again, Detection::NoChange { head });
    assert!(!dir.join("web.container").exists(), "fetch must not check out files");
}

#[test]
fn advanced_remote_reports_only_changed_paths() {
    if !git_available() {
        return;
    }
    let remote = upstream();
    let first = commit(remote.path(), "web.container", "[Container]\nImage=nginx:1\n");
    commit(remote.path(), "db.container", "[Container]\nImage=postgres\n");
    let work = TempDir::new().expect("tempdir");
    let mut detector = ChangeDetector::new(
        GitCli::new(remote.path().to_string_lossy(), work.path().join("repo")),
        "main",
    );
    detector.detect(None).expect("prime");

    let second = commit(remote.path(), "web.container", "[Container]\nImage=nginx:2\n");
    match detector.detect(Some(&first)).expect("detect") {
        Detection::Change {
            new_ref,
            changed_paths,
        } => {
            assert_eq!(new_ref, second);
            assert_eq!(
                changed_paths,
                vec![PathBuf::from("db.container"), PathBuf::from("web.container")]
            );
        }
        other => panic!("expected change, got {other:?}"),
    }
}

#[test]
fn checkout_materialises_requested_commit() {
    if !git_available() {
        return;
    }
    let remote = upstream();
    let first = commit(remote.path(), "web.container", "v1");
    commit(remote.path(), "web.container", "v2");

    let work = TempDir::new().expect("tempdir");
    let mut source = GitCli::new(remote.path().to_string_lossy(), work.path().join("repo"));
    source.fetch("main").expect("fetch");
    let tree = source.checkout(&first).expect("checkout");
    assert_eq!(tree.commit, first);
    let body = std::fs::read_to_string(tree.root.join("web.container")).expect("read");
    assert_eq!(body, "v1");
}

#[test]
fn unreachable_remote_is_transient() {
    if !git_available() {
        return;
    }
    let work = TempDir::new().expect("tempdir");
    let missing = work.path().join("does-not-exist");
    let mut detector = ChangeDetector::new(
        GitCli::new(missing.to_string_lossy(), work.path().join("repo")),
        "main",
    );
    let err = detector.detect(None).expect_err("must fail");
    assert!(err.is_transient(), "got: {err}");
}
