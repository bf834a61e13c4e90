//! CLI tests for the `scheduler` binary.
//!
//! Spawns the binary against a temp workspace and checks JSON output and exit
//! codes for registration, heartbeats through the process sandbox, and queries.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::{Value, json};

use scheduler::exit_codes;

fn scheduler(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_scheduler"))
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("spawn scheduler")
}

fn json_stdout(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout json")
}

fn setup(root: &Path) {
    assert!(scheduler(root, &["init"]).status.success());
    fs::write(
        root.join("count.sh"),
        "echo '{\"status\":\"returned\",\"value\":{\"n\":1},\"checkpoint_put\":{\"pos\":1}}'\n",
    )
    .expect("write codex");
    fs::write(root.join("boom.sh"), "echo 'disk full' >&2\nexit 3\n").expect("write codex");
    let codex_file = root.join("count.sh");
    let add = scheduler(
        root,
        &["codex", "add", "count", codex_file.to_str().expect("utf8")],
    );
    assert!(add.status.success());
    let boom_file = root.join("boom.sh");
    let add = scheduler(
        root,
        &["codex", "add", "boom", boom_file.to_str().expect("utf8")],
    );
    assert!(add.status.success());
}

#[test]
fn heartbeat_runs_registered_pipeline() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    setup(root);

    let register = scheduler(
        root,
        &["register", "nightly", "--step", "count:0", "--now", "100"],
    );
    assert!(register.status.success());

    let early = json_stdout(&scheduler(root, &["heartbeat", "--now", "99"]));
    assert_eq!(early["activity"], json!([]));

    let report = json_stdout(&scheduler(root, &["heartbeat", "--now", "100"]));
    let events: Vec<&str> = report["activity"]
        .as_array()
        .expect("activity")
        .iter()
        .map(|event| event["event"].as_str().expect("event"))
        .collect();
    assert_eq!(
        events,
        vec!["started", "step_succeeded", "completed", "schedule_disabled"]
    );

    let status = json_stdout(&scheduler(root, &["status", "nightly"]));
    assert_eq!(status["status"], "completed");
    assert_eq!(status["cursor"], 1);

    let result = json_stdout(&scheduler(root, &["result", "nightly", "0"]));
    assert_eq!(result["outcome"], "result");
    assert_eq!(result["value"], json!({"n": 1}));

    let pos = json_stdout(&scheduler(root, &["checkpoint", "nightly", "pos"]));
    assert_eq!(pos, json!(1));

    let calls = json_stdout(&scheduler(root, &["calls", "nightly"]));
    assert_eq!(calls.as_array().expect("calls").len(), 1);
}

#[test]
fn failed_step_reports_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    setup(root);

    let register = scheduler(
        root,
        &["register", "fragile", "--step", "boom", "--repeat-every", "60", "--now", "0"],
    );
    assert!(register.status.success());
    json_stdout(&scheduler(root, &["heartbeat", "--now", "0"]));

    let result = json_stdout(&scheduler(root, &["result", "fragile", "0"]));
    assert_eq!(result["outcome"], "error");
    assert!(
        result["error"]
            .as_str()
            .expect("error")
            .contains("disk full")
    );

    let list = json_stdout(&scheduler(root, &["list"]));
    assert_eq!(list[0]["name"], "fragile");
    assert_eq!(list[0]["status"], "idle");
    assert_eq!(list[0]["next_due_at"], 60);
}

#[test]
fn conflicts_and_missing_tasks_have_distinct_exit_codes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    setup(root);

    let first = scheduler(root, &["register", "t", "--step", "count", "--now", "0"]);
    assert!(first.status.success());
    let again = scheduler(root, &["register", "t", "--step", "count", "--now", "0"]);
    assert_eq!(again.status.code(), Some(exit_codes::CONFLICT));

    let missing = scheduler(root, &["status", "nope"]);
    assert_eq!(missing.status.code(), Some(exit_codes::NOT_FOUND));

    let bad_step = scheduler(root, &["register", "u", "--step", "count:soon"]);
    assert_eq!(bad_step.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn commands_require_initialized_workspace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = scheduler(temp.path(), &["list"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("not initialized"));
}
