//! Integration tests for `ward run`.
//!
//! These tests validate the multi-step run lifecycle:
//! - Starting, beginning and completing steps
//! - Verification failures and the retry budget
//! - Guarded edits and rollback on abort
//! - Single active run per project

mod common;

use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use common::{init_project, ward_cmd, write_project_config};

fn setup() -> (TempDir, PathBuf, PathBuf) {
    let temp = TempDir::new().expect("create temp dir");
    let home = temp.path().join("home");
    let project = temp.path().join("project");
    fs::create_dir_all(&home).expect("create home");
    fs::create_dir_all(&project).expect("create project");
    init_project(&home, &project);
    (temp, home, project)
}

fn start_two_step_run(home: &Path, project: &Path) {
    ward_cmd(home)
        .current_dir(project)
        .args([
            "run",
            "start",
            "--goal",
            "split module",
            "--step",
            "extract helper:a.rs",
            "--step",
            "use helper:b.rs",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 step(s)"));
}

fn run_json(home: &Path, project: &Path) -> serde_json::Value {
    let output = ward_cmd(home)
        .current_dir(project)
        .args(["run", "show", "--json"])
        .output()
        .expect("run show");
    assert!(output.status.success());
    serde_json::from_slice(&output.stdout).expect("run state json")
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_retry_budget_exhaustion_halts_run() {
    let (_temp, home, project) = setup();
    write_project_config(&project, "retryBudget: 2\nverify:\n  command: \"false\"\n");
    start_two_step_run(&home, &project);

    for _ in 0..2 {
        ward_cmd(&home)
            .current_dir(&project)
            .args(["run", "begin", "1"])
            .assert()
            .success();
        ward_cmd(&home)
            .current_dir(&project)
            .args(["run", "complete"])
            .assert()
            .code(5)
            .stderr(predicate::str::contains("Verification failed for step 1"))
            .stderr(predicate::str::contains("ward run begin"));
    }

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "begin", "1"])
        .assert()
        .success();
    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "complete"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("force-complete"));

    let state = run_json(&home, &project);
    assert_eq!(state["status"], "active");
    assert_eq!(state["steps"][0]["status"], "failed");
    assert_eq!(state["steps"][1]["status"], "pending");

    // Retrying is no longer possible without a human decision.
    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "begin", "1"])
        .assert()
        .code(6);

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "force-complete", "1", "--note", "accepted by reviewer"])
        .assert()
        .success();
    let state = run_json(&home, &project);
    assert_eq!(state["steps"][0]["status"], "done");
}

#[test]
fn test_second_run_is_rejected() {
    let (_temp, home, project) = setup();
    start_two_step_run(&home, &project);
    let before = fs::read(project.join(".ward").join("run.json")).unwrap();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "start", "--goal", "other", "--step", "x:c.rs"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("split module"));

    let after = fs::read(project.join(".ward").join("run.json")).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_run_completes_and_archives() {
    let (_temp, home, project) = setup();
    start_two_step_run(&home, &project);

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "begin", "1"])
        .assert()
        .success();
    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "complete"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Now on step 2"));

    // Passing step 1 moved step 2 into progress.
    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "complete"])
        .assert()
        .success()
        .stdout(predicate::str::contains("run completed"));

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "show"])
        .assert()
        .code(3);

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "show", "--history"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"))
        .stdout(predicate::str::contains("split module"));
}

#[test]
fn test_edit_gate_and_abort_restores() {
    let (temp, home, project) = setup();
    fs::write(project.join("a.rs"), "old a\n").unwrap();
    start_two_step_run(&home, &project);

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "begin", "1"])
        .assert()
        .success();

    // Gate follows the in-progress step.
    ward_cmd(&home)
        .current_dir(&project)
        .args(["gate", "--path", "a.rs"])
        .assert()
        .code(0);
    ward_cmd(&home)
        .current_dir(&project)
        .args(["gate", "--path", "b.rs"])
        .assert()
        .code(2);

    let expected = temp.path().join("expected.txt");
    let new = temp.path().join("new.txt");
    fs::write(&expected, "old a\n").unwrap();
    fs::write(&new, "new a\n").unwrap();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "edit", "a.rs", "-m", "rewrite"])
        .arg("--expected")
        .arg(&expected)
        .arg("--new")
        .arg(&new)
        .assert()
        .success();
    assert_eq!(fs::read_to_string(project.join("a.rs")).unwrap(), "new a\n");

    // A stale expectation is rejected and the file is left alone.
    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "edit", "a.rs"])
        .arg("--expected")
        .arg(&expected)
        .arg("--new")
        .arg(&new)
        .assert()
        .code(1);

    // Editing a file outside the step is refused.
    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "edit", "b.rs", "--create"])
        .arg("--new")
        .arg(&new)
        .assert()
        .code(1);
    assert!(!project.join("b.rs").exists());

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "abort", "--reason", "wrong approach"])
        .assert()
        .success()
        .stdout(predicate::str::contains("a.rs"));

    assert_eq!(fs::read_to_string(project.join("a.rs")).unwrap(), "old a\n");
    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "show"])
        .assert()
        .code(3);
}

#[test]
fn test_recorded_host_write_is_rolled_back() {
    let (_temp, home, project) = setup();
    start_two_step_run(&home, &project);

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "begin", "1"])
        .assert()
        .success();

    // The host creates a.rs itself, then reports the write.
    fs::write(project.join("a.rs"), "created by host\n").unwrap();
    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "record", "a.rs", "-m", "host write"])
        .assert()
        .success();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "abort", "--reason", "undo"])
        .assert()
        .success();

    assert!(!project.join("a.rs").exists());
}

#[test]
fn test_start_blocked_by_preflight() {
    let (_temp, home, project) = setup();
    fs::write(project.join("a.rs"), "fn a() {}\n").unwrap();

    ward_cmd(&home)
        .current_dir(&project)
        .args([
            "run", "start", "--goal", "rename", "--step", "rename:a.rs", "--refactor", "--strict",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no learned knowledge for file a.rs"));

    assert!(!project.join(".ward").join("run.json").exists());
}

#[test]
fn test_start_from_plan_file() {
    let (temp, home, project) = setup();
    let plan = temp.path().join("plan.json");
    fs::write(
        &plan,
        r#"[{"description":"one","files":["src/a.rs"]},{"description":"two","files":["src/b.rs","src/c.rs"]}]"#,
    )
    .unwrap();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "start", "--goal", "from plan", "--plan"])
        .arg(&plan)
        .assert()
        .success();

    let state = run_json(&home, &project);
    assert_eq!(state["steps"][1]["files"][1], "src/c.rs");
}

#[test]
fn test_heartbeat_without_active_state() {
    let (_temp, home, project) = setup();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "heartbeat"])
        .assert()
        .code(3);
}

#[test]
fn test_begin_step_zero_is_rejected() {
    let (_temp, home, project) = setup();
    start_two_step_run(&home, &project);

    ward_cmd(&home)
        .current_dir(&project)
        .args(["run", "begin", "0"])
        .assert()
        .code(1);
}
