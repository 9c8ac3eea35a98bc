//! Write-interception gate.
//!
//! The host asks [`decide`] before every file write. The answer is a pure
//! projection over `quickfix.json` and `run.json`: no locks are taken and
//! nothing is written, so the check stays cheap on every write attempt.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::errors::WardError;
use crate::fsutil::read_json;
use crate::quickfix::QuickFixState;
use crate::run::RunState;
use crate::workspace::Workspace;

/// Reason given when nothing covers the path.
pub const NOT_COVERED_REASON: &str = "no active run or quick-fix covers this file";

/// Request sent by the host before a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateRequest {
    pub path: String,
    /// Identifier of the host's tool action. Logged only.
    #[serde(default)]
    pub action_id: Option<String>,
}

/// Allow or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block,
}

/// Response returned to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResponse {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GateResponse {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Block,
            reason: Some(reason.into()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// Decide whether the write described by `request` may proceed.
///
/// First matching rule wins:
/// 1. the active quick-fix targets the path;
/// 2. the active run's in-progress step targets the path;
/// 3. otherwise block.
///
/// State that has outlived its heartbeat no longer covers anything, so the
/// next rule is tried. When nothing covers the path, the block reason names
/// the abandoned state.
pub fn decide(
    workspace: &Workspace,
    settings: &Settings,
    request: &GateRequest,
) -> Result<GateResponse, WardError> {
    let key = match workspace.relative_key(Path::new(&request.path)) {
        Ok(key) => key,
        Err(WardError::InvalidPath(reason)) => {
            return Ok(GateResponse::block(format!("{}: {}", NOT_COVERED_REASON, reason)));
        }
        Err(e) => return Err(e),
    };
    let now = Utc::now();
    let action = request.action_id.as_deref().unwrap_or("-");

    // Abandoned state is not active: it covers nothing, but it explains a block.
    let mut abandoned_reason = None;

    if let Some(fix) = read_json::<QuickFixState>(&workspace.quickfix_path())? {
        if fix.path == key {
            if fix.is_abandoned(now, settings.abandon_after_secs) {
                tracing::debug!(action, "gate: quick-fix on {} is abandoned", key);
                abandoned_reason = Some(format!(
                    "quick-fix on {} was abandoned; run `ward clear-stale`",
                    key
                ));
            } else {
                tracing::debug!(action, "gate: allow {} (quick-fix)", key);
                return Ok(GateResponse::allow());
            }
        }
    }

    if let Some(run) = read_json::<RunState>(&workspace.run_path())? {
        if run.covers(&key) {
            if run.is_abandoned(now, settings.abandon_after_secs) {
                tracing::debug!(action, "gate: run {} is abandoned", run.id);
                abandoned_reason.get_or_insert_with(|| {
                    format!("run {} was abandoned; run `ward clear-stale`", run.id)
                });
            } else {
                tracing::debug!(action, "gate: allow {} (run {})", key, run.id);
                return Ok(GateResponse::allow());
            }
        }
    }

    if let Some(reason) = abandoned_reason {
        return Ok(GateResponse::block(reason));
    }

    tracing::debug!(action, "gate: block {}", key);
    Ok(GateResponse::block(NOT_COVERED_REASON))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quickfix::QuickFixTracker;
    use crate::run::{RunTracker, StepPlan};
    use crate::snapshot::SnapshotStore;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Workspace, Settings) {
        let temp = TempDir::new().unwrap();
        let mut ws = Workspace::from_root(temp.path()).unwrap();
        ws.create_layout().unwrap();
        let settings = Settings::defaults_for(ws.root());
        (temp, ws, settings)
    }

    fn ask(ws: &Workspace, settings: &Settings, path: &str) -> GateResponse {
        let request = GateRequest {
            path: path.to_string(),
            action_id: Some("tool-1".to_string()),
        };
        decide(ws, settings, &request).unwrap()
    }

    #[test]
    fn test_blocks_without_active_state() {
        let (_temp, ws, settings) = setup();
        let response = ask(&ws, &settings, "x.txt");
        assert_eq!(response, GateResponse::block(NOT_COVERED_REASON));
    }

    #[test]
    fn test_quickfix_covers_only_its_target() {
        let (_temp, ws, settings) = setup();
        fs::write(ws.abs_path("x.txt"), "x").unwrap();
        QuickFixTracker::new(&ws, SnapshotStore::new(&ws.snapshots_dir()), &settings)
            .start("x.txt")
            .unwrap();

        assert!(ask(&ws, &settings, "x.txt").is_allowed());
        assert!(ask(&ws, &settings, ws.abs_path("x.txt").to_str().unwrap()).is_allowed());
        assert!(!ask(&ws, &settings, "y.txt").is_allowed());
    }

    #[test]
    fn test_run_covers_in_progress_step_only() {
        let (_temp, ws, settings) = setup();
        let tracker = RunTracker::new(&ws, SnapshotStore::new(&ws.snapshots_dir()), &settings);
        tracker
            .start("g", vec![StepPlan::new("one", &["a.rs"]), StepPlan::new("two", &["b.rs"])], None)
            .unwrap();

        // Nothing is in progress yet.
        assert!(!ask(&ws, &settings, "a.rs").is_allowed());

        tracker.begin_step(0).unwrap();
        assert!(ask(&ws, &settings, "a.rs").is_allowed());
        assert!(!ask(&ws, &settings, "b.rs").is_allowed());
    }

    #[test]
    fn test_abandoned_run_blocks() {
        let (_temp, ws, settings) = setup();
        let tracker = RunTracker::new(&ws, SnapshotStore::new(&ws.snapshots_dir()), &settings);
        tracker.start("g", vec![StepPlan::new("one", &["a.rs"])], None).unwrap();
        let mut state = tracker.begin_step(0).unwrap();
        state.heartbeat_at = Utc::now() - chrono::Duration::days(5);
        crate::fsutil::write_json(&ws.run_path(), &state).unwrap();

        let response = ask(&ws, &settings, "a.rs");
        assert!(!response.is_allowed());
        assert!(response.reason.unwrap().contains("abandoned"));
    }

    #[test]
    fn test_abandoned_quickfix_falls_through_to_live_run() {
        let (_temp, ws, settings) = setup();
        fs::write(ws.abs_path("a.rs"), "a").unwrap();
        let mut fix = QuickFixTracker::new(&ws, SnapshotStore::new(&ws.snapshots_dir()), &settings)
            .start("a.rs")
            .unwrap();
        fix.heartbeat_at = Utc::now() - chrono::Duration::days(5);
        crate::fsutil::write_json(&ws.quickfix_path(), &fix).unwrap();

        let response = ask(&ws, &settings, "a.rs");
        assert!(!response.is_allowed());
        assert!(response.reason.unwrap().contains("quick-fix on a.rs was abandoned"));

        let tracker = RunTracker::new(&ws, SnapshotStore::new(&ws.snapshots_dir()), &settings);
        tracker.start("g", vec![StepPlan::new("one", &["a.rs"])], None).unwrap();
        tracker.begin_step(0).unwrap();

        assert_eq!(ask(&ws, &settings, "a.rs"), GateResponse::allow());
    }

    #[test]
    fn test_outside_path_blocks() {
        let (_temp, ws, settings) = setup();
        assert!(!ask(&ws, &settings, "../elsewhere.txt").is_allowed());
    }

    #[test]
    fn test_wire_shape() {
        assert_eq!(
            serde_json::to_string(&GateResponse::allow()).unwrap(),
            r#"{"decision":"allow"}"#
        );
        assert_eq!(
            serde_json::to_string(&GateResponse::block("nope")).unwrap(),
            r#"{"decision":"block","reason":"nope"}"#
        );
        let request: GateRequest =
            serde_json::from_str(r#"{"path":"a.rs","actionId":"w-1"}"#).unwrap();
        assert_eq!(request.action_id.as_deref(), Some("w-1"));
    }
}
