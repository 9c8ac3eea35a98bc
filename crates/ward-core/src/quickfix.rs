//! Quick-fix state machine.
//!
//! A quick-fix is a single-file transactional edit without planning or
//! verification: `none -> active -> done | cancelled`. The original bytes
//! are snapshotted on start so that `cancel` can put them back exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::constants::QUICKFIX_LOCK;
use crate::errors::WardError;
use crate::fsutil::{append_jsonl, read_json, read_jsonl, remove_if_exists, write_json};
use crate::lock::StateLock;
use crate::snapshot::{SnapshotId, SnapshotStore};
use crate::workspace::Workspace;

/// Status of a quick-fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuickFixStatus {
    Active,
    Done,
    Cancelled,
    Abandoned,
}

impl std::fmt::Display for QuickFixStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Done => write!(f, "done"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Persisted quick-fix state (`.ward/quickfix.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickFixState {
    /// Target file, project-relative.
    pub path: String,
    /// Original content; `None` when the file did not exist at start.
    pub snapshot: Option<SnapshotId>,
    pub status: QuickFixStatus,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl QuickFixState {
    pub fn is_abandoned(&self, now: DateTime<Utc>, abandon_after_secs: u64) -> bool {
        abandon_after_secs > 0
            && self.status == QuickFixStatus::Active
            && (now - self.heartbeat_at).num_seconds() > abandon_after_secs as i64
    }
}

/// Operations on a project's quick-fix state.
#[derive(Debug, Clone)]
pub struct QuickFixTracker {
    workspace: Workspace,
    snapshots: SnapshotStore,
    settings: Settings,
}

impl QuickFixTracker {
    pub fn new(workspace: &Workspace, snapshots: SnapshotStore, settings: &Settings) -> Self {
        Self {
            workspace: workspace.clone(),
            snapshots,
            settings: settings.clone(),
        }
    }

    fn lock(&self) -> Result<StateLock, WardError> {
        StateLock::acquire(
            &self.workspace.locks_dir(),
            QUICKFIX_LOCK,
            self.settings.lock_timeout(),
        )
    }

    /// Read the active quick-fix without locking.
    pub fn load(&self) -> Result<Option<QuickFixState>, WardError> {
        read_json(&self.workspace.quickfix_path())
    }

    /// Clear the active state and append it to the history log.
    fn finish(&self, mut state: QuickFixState, status: QuickFixStatus) -> Result<QuickFixState, WardError> {
        state.status = status;
        state.finished_at = Some(Utc::now());
        append_jsonl(&self.workspace.quickfix_history_path(), &state)?;
        remove_if_exists(&self.workspace.quickfix_path())?;
        Ok(state)
    }

    /// Start a quick-fix on `key`, snapshotting its current bytes.
    pub fn start(&self, key: &str) -> Result<QuickFixState, WardError> {
        let _lock = self.lock()?;
        let now = Utc::now();

        if let Some(existing) = self.load()? {
            if existing.is_abandoned(now, self.settings.abandon_after_secs) {
                tracing::warn!(
                    "Quick-fix on {} has had no heartbeat since {}; archiving it as abandoned",
                    existing.path,
                    existing.heartbeat_at
                );
                self.finish(existing, QuickFixStatus::Abandoned)?;
            } else {
                return Err(WardError::QuickFixAlreadyActive {
                    path: existing.path,
                });
            }
        }

        let snapshot = self.snapshots.capture(&self.workspace.abs_path(key))?;
        let state = QuickFixState {
            path: key.to_string(),
            snapshot,
            status: QuickFixStatus::Active,
            started_at: now,
            heartbeat_at: now,
            finished_at: None,
        };
        write_json(&self.workspace.quickfix_path(), &state)?;
        tracing::info!("Started quick-fix on {}", key);
        Ok(state)
    }

    /// Accept the edit. The snapshot stays until garbage collection.
    pub fn mark_done(&self) -> Result<QuickFixState, WardError> {
        let _lock = self.lock()?;
        let state = self.load()?.ok_or(WardError::NoActiveQuickFix)?;
        let state = self.finish(state, QuickFixStatus::Done)?;
        tracing::info!("Quick-fix on {} done", state.path);
        Ok(state)
    }

    /// Restore the target file bit-for-bit and clear the state.
    pub fn cancel(&self) -> Result<QuickFixState, WardError> {
        let _lock = self.lock()?;
        let state = self.load()?.ok_or(WardError::NoActiveQuickFix)?;
        self.snapshots
            .restore(state.snapshot.as_ref(), &self.workspace.abs_path(&state.path))?;
        let state = self.finish(state, QuickFixStatus::Cancelled)?;
        tracing::info!("Quick-fix on {} cancelled, original restored", state.path);
        Ok(state)
    }

    pub fn heartbeat(&self) -> Result<QuickFixState, WardError> {
        let _lock = self.lock()?;
        let mut state = self.load()?.ok_or(WardError::NoActiveQuickFix)?;
        state.heartbeat_at = Utc::now();
        write_json(&self.workspace.quickfix_path(), &state)?;
        Ok(state)
    }

    /// Archive the active quick-fix as abandoned without restoring.
    ///
    /// Without `force`, only state whose heartbeat expired is archived.
    pub fn clear_abandoned(&self, force: bool) -> Result<Option<QuickFixState>, WardError> {
        let _lock = self.lock()?;
        let Some(state) = self.load()? else {
            return Ok(None);
        };
        if !force && !state.is_abandoned(Utc::now(), self.settings.abandon_after_secs) {
            return Ok(None);
        }
        Ok(Some(self.finish(state, QuickFixStatus::Abandoned)?))
    }

    /// Drop an unparsable `quickfix.json`. Returns whether anything was removed.
    pub fn discard_unreadable(&self) -> Result<bool, WardError> {
        let _lock = self.lock()?;
        if self.load().is_ok() {
            return Ok(false);
        }
        tracing::warn!("Removing unreadable quick-fix state");
        remove_if_exists(&self.workspace.quickfix_path())
    }

    /// Finished quick-fixes, oldest first.
    pub fn history(&self) -> Result<Vec<QuickFixState>, WardError> {
        read_jsonl(&self.workspace.quickfix_history_path())
    }
}
