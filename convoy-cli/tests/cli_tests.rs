use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;

use convoy_core::{CommitRef, DeploymentStatus, EngineLock, EventLevel, Ledger};
use tempfile::TempDir;

fn convoy_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("convoy"));
    cmd.env("HOME", home).env_remove("RUST_LOG");
    cmd
}

fn write_config(home: &Path, repository: &str) -> PathBuf {
    let dir = home.join(".convoy");
    fs::create_dir_all(&dir).expect("config dir");
    let path = dir.join("config.yaml");
    let unit_dir = home.join("units");
    fs::write(
        &path,
        format!(
            "source:\n  repository: {repository}\n  paths: [quadlets]\nunit_dir: {}\n",
            unit_dir.display()
        ),
    )
    .expect("write config");
    path
}

fn ledger_at(home: &Path) -> Ledger {
    Ledger::open(&home.join(".convoy/state/ledger.db")).expect("ledger")
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
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
}

fn upstream_with(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().expect("upstream");
    git(dir.path(), &["init", "--quiet"]);
    git(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);
    for (name, body) in files {
        let path = dir.path().join("quadlets").join(name);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, body).expect("write unit");
    }
    git(dir.path(), &["add", "--all"]);
    git(dir.path(), &["commit", "--quiet", "-m", "units"]);
    dir
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn missing_config_is_reported() {
    let home = TempDir::new().expect("home");
    convoy_cmd(home.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(contains("failed to load configuration"));
}

#[test]
fn every_invalid_field_is_listed() {
    let home = TempDir::new().expect("home");
    let dir = home.path().join(".convoy");
    fs::create_dir_all(&dir).expect("dir");
    fs::write(
        dir.join("config.yaml"),
        "source:\n  repository: \"\"\npoll_interval_secs: 0\n",
    )
    .expect("write");

    convoy_cmd(home.path())
        .arg("history")
        .assert()
        .failure()
        .stderr(contains("source.repository").and(contains("poll_interval_secs")));
}

#[test]
fn config_flag_overrides_default_location() {
    let home = TempDir::new().expect("home");
    let elsewhere = TempDir::new().expect("elsewhere");
    let path = elsewhere.path().join("convoy.yaml");
    fs::write(&path, "source:\n  repository: /srv/units.git\n").expect("write");

    convoy_cmd(home.path())
        .arg("--config")
        .arg(&path)
        .arg("history")
        .assert()
        .success()
        .stdout(contains("No deployments recorded."));
}

// ---------------------------------------------------------------------------
// Ledger views
// ---------------------------------------------------------------------------

#[test]
fn empty_ledger_status() {
    let home = TempDir::new().expect("home");
    write_config(home.path(), "/srv/units.git");

    convoy_cmd(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("Nothing deployed yet.").and(contains("daemon")));

    let output = convoy_cmd(home.path())
        .args(["status", "--json"])
        .output()
        .expect("run status");
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(json["daemon_running"], serde_json::json!(false));
    assert_eq!(json["halted"], serde_json::json!(false));
    assert_eq!(json["totals"]["total"], serde_json::json!(0));
}

#[test]
fn history_and_events_show_recorded_attempts() {
    let home = TempDir::new().expect("home");
    write_config(home.path(), "/srv/units.git");
    {
        let mut ledger = ledger_at(home.path());
        let record = ledger
            .begin(&CommitRef::from("0123456789abcdef0123456789abcdef01234567"))
            .expect("begin");
        ledger
            .append_event(Some(record.id), EventLevel::Error, "validation: web.container: [Container] is missing Image=")
            .expect("event");
        ledger
            .mark_failed(record.id, "validation: 1 error(s)")
            .expect("fail");
    }

    convoy_cmd(home.path())
        .arg("history")
        .assert()
        .success()
        .stdout(contains("01234567").and(contains("validation: 1 error(s)")));

    let output = convoy_cmd(home.path())
        .args(["history", "--json", "--limit", "5"])
        .output()
        .expect("run history");
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(json[0]["status"], serde_json::json!("failed"));

    convoy_cmd(home.path())
        .args(["events", "--limit", "10"])
        .assert()
        .success()
        .stdout(contains("ERROR").and(contains("missing Image=")));
}

#[test]
fn clear_degraded_without_halt_is_a_no_op() {
    let home = TempDir::new().expect("home");
    write_config(home.path(), "/srv/units.git");

    convoy_cmd(home.path())
        .args(["clear-degraded", "--note", "checked"])
        .assert()
        .success()
        .stdout(contains("Nothing to clear"));
}

#[test]
fn reconcile_leaves_a_live_deployment_alone() {
    let home = TempDir::new().expect("home");
    write_config(home.path(), "/srv/units.git");
    let state = home.path().join(".convoy/state");
    let _held = EngineLock::acquire(&state).expect("lock");
    let open = ledger_at(home.path())
        .begin(&CommitRef::from("89abcdef0123456789abcdef0123456789abcdef"))
        .expect("begin");

    convoy_cmd(home.path())
        .arg("reconcile")
        .assert()
        .success()
        .stdout(contains("busy").and(contains(format!("pid {}", std::process::id()))));

    let record = ledger_at(home.path()).get(open.id).expect("record");
    assert_eq!(record.status, DeploymentStatus::Pending);
    assert!(record.reason.is_none());
}

#[test]
fn daemon_status_when_stopped() {
    let home = TempDir::new().expect("home");
    convoy_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));

    convoy_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
}

// ---------------------------------------------------------------------------
// Render and diff against a real repository
// ---------------------------------------------------------------------------

#[test]
fn render_lists_units_without_installing_them() {
    if !git_available() {
        return;
    }
    let upstream = upstream_with(&[(
        "web.container",
        "[Container]\nImage=docker.io/library/nginx:1.27\n\n[X-Health]\nType=tcp\nPort=8080\n",
    )]);
    let home = TempDir::new().expect("home");
    write_config(home.path(), &upstream.path().display().to_string());

    convoy_cmd(home.path())
        .arg("render")
        .assert()
        .success()
        .stdout(contains("web.container").and(contains("tcp 127.0.0.1:8080")));
    assert!(!home.path().join("units").exists());
    // The daemon's checkout is never used for previews.
    assert!(!home.path().join(".convoy/repo").exists());

    convoy_cmd(home.path())
        .arg("diff")
        .assert()
        .success()
        .stdout(contains("+Image=docker.io/library/nginx:1.27"));
}

#[test]
fn render_rejects_invalid_units() {
    if !git_available() {
        return;
    }
    let upstream = upstream_with(&[("web.container", "[Container]\nPublishPort=80:80\n")]);
    let home = TempDir::new().expect("home");
    write_config(home.path(), &upstream.path().display().to_string());

    convoy_cmd(home.path())
        .arg("render")
        .assert()
        .failure()
        .stderr(contains("missing Image=").and(contains("validation error")));
}
