//! Integration tests for `ward quickfix` and `ward gate`.
//!
//! These tests validate the write-interception flow:
//! - Gate decisions for covered and uncovered files
//! - The stdin JSON protocol and exit statuses
//! - Exact restore on quick-fix cancel

mod common;

use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

use common::{init_project, ward_cmd};

fn setup() -> (TempDir, std::path::PathBuf, std::path::PathBuf) {
    let temp = TempDir::new().expect("create temp dir");
    let home = temp.path().join("home");
    let project = temp.path().join("project");
    fs::create_dir_all(&home).expect("create home");
    fs::create_dir_all(&project).expect("create project");
    init_project(&home, &project);
    (temp, home, project)
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_quickfix_gate_and_cancel_restores_bytes() {
    let (_temp, home, project) = setup();
    let original = b"line one\r\nline two\n\xff".to_vec();
    fs::write(project.join("x.txt"), &original).unwrap();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["quickfix", "start", "x.txt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Quick-fix started"));

    // Host writes the file after the gate allowed it.
    ward_cmd(&home)
        .current_dir(&project)
        .args(["gate", "--path", "x.txt"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains(r#"{"decision":"allow"}"#));
    fs::write(project.join("x.txt"), "edited").unwrap();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["gate", "--path", "y.txt"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains(r#""decision":"block""#));

    ward_cmd(&home)
        .current_dir(&project)
        .args(["quickfix", "cancel"])
        .assert()
        .success();

    assert_eq!(fs::read(project.join("x.txt")).unwrap(), original);

    // Nothing covers x.txt any more.
    ward_cmd(&home)
        .current_dir(&project)
        .args(["gate", "--path", "x.txt"])
        .assert()
        .code(2);
}

#[test]
fn test_quickfix_on_new_file_cancel_removes_it() {
    let (_temp, home, project) = setup();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["quickfix", "start", "new.txt"])
        .assert()
        .success();
    fs::write(project.join("new.txt"), "created").unwrap();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["quickfix", "cancel"])
        .assert()
        .success();

    assert!(!project.join("new.txt").exists());
}

#[test]
fn test_quickfix_done_keeps_edit() {
    let (_temp, home, project) = setup();
    fs::write(project.join("x.txt"), "before").unwrap();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["quickfix", "start", "x.txt"])
        .assert()
        .success();
    fs::write(project.join("x.txt"), "after").unwrap();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["quickfix", "done"])
        .assert()
        .success();

    assert_eq!(fs::read_to_string(project.join("x.txt")).unwrap(), "after");
}

#[test]
fn test_second_quickfix_is_rejected() {
    let (_temp, home, project) = setup();
    fs::write(project.join("x.txt"), "x").unwrap();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["quickfix", "start", "x.txt"])
        .assert()
        .success();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["quickfix", "start", "x.txt"])
        .assert()
        .code(1);
}

#[test]
fn test_quickfix_done_without_active_fix() {
    let (_temp, home, project) = setup();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["quickfix", "done"])
        .assert()
        .code(3);
}

#[test]
fn test_gate_reads_json_from_stdin() {
    let (_temp, home, project) = setup();
    fs::write(project.join("x.txt"), "x").unwrap();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["quickfix", "start", "x.txt"])
        .assert()
        .success();

    ward_cmd(&home)
        .current_dir(&project)
        .arg("gate")
        .write_stdin(r#"{"path":"x.txt","actionId":"write-1"}"#)
        .assert()
        .code(0)
        .stdout(predicate::str::contains("allow"));

    ward_cmd(&home)
        .current_dir(&project)
        .arg("gate")
        .write_stdin(r#"{"path":"other/y.txt"}"#)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("no active run or quick-fix covers this file"));
}

#[test]
fn test_gate_rejects_malformed_request() {
    let (_temp, home, project) = setup();

    ward_cmd(&home)
        .current_dir(&project)
        .arg("gate")
        .write_stdin("not json")
        .assert()
        .code(1);
}

#[test]
fn test_gate_blocks_in_uninitialized_project() {
    let temp = TempDir::new().expect("create temp dir");
    let home = temp.path().join("home");
    let project = temp.path().join("project");
    fs::create_dir_all(&home).unwrap();
    fs::create_dir_all(&project).unwrap();

    ward_cmd(&home)
        .current_dir(&project)
        .args(["gate", "--path", "a.txt"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("block"));
}
