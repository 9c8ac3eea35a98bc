//! Verification collaborator.
//!
//! After a run step completes, ward asks a [`Verifier`] whether the touched
//! files are in a good state. The call is synchronous and may take as long as
//! the underlying check takes; ward imposes no timeout and never retries.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::constants::{VERIFY_DETAILS_MAX_BYTES, VERIFY_FILES_ENV};
use crate::errors::WardError;

/// Result of one verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub passed: bool,
    pub details: String,
}

impl VerificationOutcome {
    pub fn pass(details: impl Into<String>) -> Self {
        Self {
            passed: true,
            details: details.into(),
        }
    }

    pub fn fail(details: impl Into<String>) -> Self {
        Self {
            passed: false,
            details: details.into(),
        }
    }
}

/// Checks a set of touched files.
pub trait Verifier: Send + Sync {
    /// Verify `files` (project-relative keys).
    ///
    /// An `Err` means the verifier itself could not run; a failing check is
    /// `Ok` with `passed == false`.
    fn run(&self, files: &[String]) -> Result<VerificationOutcome, WardError>;
}

/// Accepts everything. Used when no verify command is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopVerifier;

impl Verifier for NoopVerifier {
    fn run(&self, _files: &[String]) -> Result<VerificationOutcome, WardError> {
        Ok(VerificationOutcome::pass("no verify command configured"))
    }
}

/// Runs a shell command in the project root.
///
/// The touched files are exported newline-separated in `WARD_FILES`. Exit
/// status 0 passes.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    command: String,
    root: PathBuf,
}

impl CommandVerifier {
    pub fn new(command: impl Into<String>, root: &Path) -> Self {
        Self {
            command: command.into(),
            root: root.to_path_buf(),
        }
    }
}

impl Verifier for CommandVerifier {
    fn run(&self, files: &[String]) -> Result<VerificationOutcome, WardError> {
        tracing::info!("Running verification: {}", self.command);

        let output = shell(&self.command)
            .current_dir(&self.root)
            .env(VERIFY_FILES_ENV, files.join("\n"))
            .output()
            .map_err(|e| {
                WardError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to spawn verify command `{}`: {}", self.command, e),
                ))
            })?;

        let mut combined = String::new();
        if !output.stdout.is_empty() {
            combined.push_str(&String::from_utf8_lossy(&output.stdout));
        }
        if !output.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        let details = match (output.status.success(), tail(&combined, VERIFY_DETAILS_MAX_BYTES)) {
            (true, t) if t.is_empty() => "ok".to_string(),
            (false, t) if t.is_empty() => format!("`{}` exited with {}", self.command, output.status),
            (_, t) => t,
        };

        tracing::debug!(passed = output.status.success(), "verification finished");
        Ok(VerificationOutcome {
            passed: output.status.success(),
            details,
        })
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Last `max` bytes of `s`, trimmed, cut on a char boundary.
fn tail(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}
