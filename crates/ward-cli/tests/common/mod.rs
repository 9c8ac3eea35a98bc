//! Shared test utilities for ward-cli integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use assert_cmd::Command;

/// Get a Command for the ward binary, isolated from the user's home.
///
/// `home` stands in for `$HOME`, so the global config and the project
/// registry are read from (and written to) the test's temp dir.
///
/// # Panics
///
/// Panics if the ward binary cannot be found. This should not happen
/// in a properly configured test environment.
#[allow(deprecated)]
pub fn ward_cmd(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("ward").expect("ward binary should exist");
    cmd.env("HOME", home)
        .env("NO_COLOR", "1")
        .env_remove("WARD_CONFIG")
        .env_remove("WARD_PROJECT")
        .env_remove("WARD_VERBOSE")
        .env_remove("WARD_QUIET")
        .env_remove("WARD_COLOR");
    cmd
}

/// Run `ward init` in `project`.
pub fn init_project(home: &Path, project: &Path) {
    ward_cmd(home)
        .current_dir(project)
        .arg("init")
        .assert()
        .success();
}

/// Replace the project config written by `ward init`.
pub fn write_project_config(project: &Path, yaml: &str) {
    fs::write(project.join(".ward").join("config.yaml"), yaml).expect("write project config");
}
