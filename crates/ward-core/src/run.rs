//! Run state machine.
//!
//! A run tracks one multi-step, multi-file change: the plan, each step's
//! status, every edit made, and the outcome of the last verification.
//!
//! ```text
//! none -> active -> (begin / edit / complete)* -> completed | aborted
//! ```
//!
//! The active run lives in `.ward/run.json`. Every mutation is a
//! read-modify-write under the `run` lock, persisted atomically. Finished
//! runs are moved to `.ward/history/runs/<id>.json`, never deleted.
//!
//! Rollback relies on snapshots: the first time a step that names a file
//! begins, the file's bytes are captured as its baseline, and every edit
//! records the snapshot of the content it replaced. [`RunTracker::abort`]
//! replays those in exact reverse order.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Settings;
use crate::constants::RUN_LOCK;
use crate::errors::WardError;
use crate::fsutil::{atomic_write, read_json, read_optional, remove_if_exists, write_json};
use crate::hash::file_fingerprint;
use crate::lock::StateLock;
use crate::snapshot::{SnapshotId, SnapshotStore};
use crate::verify::Verifier;
use crate::workspace::Workspace;

// ============================================================================
// RunId
// ============================================================================

/// A unique identifier for a run (UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a new unique run ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the run ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

// ============================================================================
// Plan and Steps
// ============================================================================

/// One planned step, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPlan {
    pub description: String,
    /// Project-relative target files.
    pub files: Vec<String>,
}

impl StepPlan {
    pub fn new(description: impl Into<String>, files: &[&str]) -> Self {
        Self {
            description: description.into(),
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in-progress"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A step of an active run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub description: String,
    pub files: Vec<String>,
    pub status: StepStatus,
    /// Failed verification attempts.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    fn covers(&self, key: &str) -> bool {
        self.files.iter().any(|f| f == key)
    }
}

// ============================================================================
// Run records
// ============================================================================

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Completed,
    Aborted,
    /// Archived after its heartbeat expired or by `clear-stale`.
    Abandoned,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// How an edit reached the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditSource {
    /// Written through [`RunTracker::edit_file`].
    Edit,
    /// Written by the host and reported through [`RunTracker::record_write`].
    Recorded,
}

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    /// Strictly increasing within a run, starting at 1.
    pub seq: u64,
    /// 0-based index of the step the edit belongs to.
    pub step: usize,
    pub path: String,
    /// Content replaced by this edit (`None`: the file did not exist).
    pub before: Option<SnapshotId>,
    /// Content written by this edit (`None`: the file was deleted).
    pub after: Option<SnapshotId>,
    pub description: String,
    pub source: EditSource,
    pub at: DateTime<Utc>,
}

/// Verification outcome attached to the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepVerification {
    /// 0-based step index.
    pub step: usize,
    pub passed: bool,
    pub details: String,
    pub at: DateTime<Utc>,
}

/// Persisted state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub id: RunId,
    pub goal: String,
    pub status: RunStatus,
    pub steps: Vec<Step>,
    /// Files touched so far (edited, recorded, or reported at completion).
    pub touched: BTreeSet<String>,
    /// First captured content per file (`None`: did not exist).
    pub baselines: BTreeMap<String, Option<SnapshotId>>,
    pub edits: Vec<EditRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verification: Option<StepVerification>,
    pub retry_budget: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl RunState {
    /// Index of the in-progress step, if any.
    pub fn current_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status == StepStatus::InProgress)
    }

    /// True iff every step is done.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Done)
    }

    /// Whether the in-progress step targets `key`.
    pub fn covers(&self, key: &str) -> bool {
        self.current_step()
            .map_or(false, |idx| self.steps[idx].covers(key))
    }

    /// Whether the heartbeat is older than `abandon_after_secs` (0 disables).
    pub fn is_abandoned(&self, now: DateTime<Utc>, abandon_after_secs: u64) -> bool {
        abandon_after_secs > 0
            && self.status == RunStatus::Active
            && (now - self.heartbeat_at).num_seconds() > abandon_after_secs as i64
    }

    /// Every snapshot this run may need for rollback.
    pub fn referenced_snapshots(&self) -> HashSet<SnapshotId> {
        let mut out: HashSet<SnapshotId> = self.baselines.values().flatten().cloned().collect();
        for edit in &self.edits {
            out.extend(edit.before.iter().cloned());
            out.extend(edit.after.iter().cloned());
        }
        out
    }

    /// Snapshot the file held after the run's last recorded change to it.
    fn last_known(&self, key: &str) -> Option<SnapshotId> {
        match self.edits.iter().rev().find(|e| e.path == key) {
            Some(edit) => edit.after.clone(),
            None => self.baselines.get(key).cloned().flatten(),
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.heartbeat_at = now;
    }
}

/// Result of [`RunTracker::complete_step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCompletion {
    /// 0-based index of the completed step.
    pub step: usize,
    pub passed: bool,
    pub details: String,
    /// Failed attempts of the step after this completion.
    pub attempts: u32,
    /// Step auto-advanced into progress, if any.
    pub next_step: Option<usize>,
    /// The run finished and was archived.
    pub run_completed: bool,
}

/// Result of [`RunTracker::abort`].
#[derive(Debug, Clone)]
pub struct AbortSummary {
    pub run: RunState,
    /// Files put back, in the order they were restored.
    pub restored: Vec<String>,
}

// ============================================================================
// WriteSink
// ============================================================================

/// Performs the actual file write for [`RunTracker::edit_file`].
pub trait WriteSink: Send + Sync {
    fn write(&self, path: &Path, data: &[u8]) -> Result<(), WardError>;
}

/// Writes straight to disk with temp-file-then-rename.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsWriteSink;

impl WriteSink for FsWriteSink {
    fn write(&self, path: &Path, data: &[u8]) -> Result<(), WardError> {
        atomic_write(path, data)
    }
}

// ============================================================================
// RunTracker
// ============================================================================

/// Operations on a project's run state.
#[derive(Debug, Clone)]
pub struct RunTracker {
    workspace: Workspace,
    snapshots: SnapshotStore,
    settings: Settings,
}

impl RunTracker {
    pub fn new(workspace: &Workspace, snapshots: SnapshotStore, settings: &Settings) -> Self {
        Self {
            workspace: workspace.clone(),
            snapshots,
            settings: settings.clone(),
        }
    }

    fn lock(&self) -> Result<StateLock, WardError> {
        StateLock::acquire(&self.workspace.locks_dir(), RUN_LOCK, self.settings.lock_timeout())
    }

    /// Read the active run without locking. `None` when no run is active.
    pub fn load(&self) -> Result<Option<RunState>, WardError> {
        read_json(&self.workspace.run_path())
    }

    fn load_active(&self) -> Result<RunState, WardError> {
        self.load()?.ok_or(WardError::NoActiveRun)
    }

    fn save(&self, state: &RunState) -> Result<(), WardError> {
        write_json(&self.workspace.run_path(), state)
    }

    fn archive(&self, state: &RunState) -> Result<(), WardError> {
        let path = self
            .workspace
            .run_history_dir()
            .join(format!("{}.json", state.id));
        write_json(&path, state)?;
        remove_if_exists(&self.workspace.run_path())?;
        tracing::info!("Archived run {} as {}", state.id, state.status);
        Ok(())
    }

    /// Start a new run with an externally supplied plan.
    ///
    /// An abandoned run is archived first; any other active run makes this
    /// fail with [`WardError::RunAlreadyActive`] without touching its state.
    pub fn start(
        &self,
        goal: &str,
        plan: Vec<StepPlan>,
        retry_budget: Option<u32>,
    ) -> Result<RunState, WardError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(WardError::InvalidArgument("A run needs a goal.".to_string()));
        }
        if plan.is_empty() {
            return Err(WardError::InvalidArgument(
                "A run needs at least one step.".to_string(),
            ));
        }

        let mut steps = Vec::with_capacity(plan.len());
        for (idx, step) in plan.into_iter().enumerate() {
            let mut files: Vec<String> = Vec::new();
            for file in step.files {
                if !files.contains(&file) {
                    files.push(file);
                }
            }
            if files.is_empty() {
                return Err(WardError::InvalidArgument(format!(
                    "Step {} (`{}`) names no target files.",
                    idx + 1,
                    step.description
                )));
            }
            steps.push(Step {
                description: step.description,
                files,
                status: StepStatus::Pending,
                attempts: 0,
                notes: Vec::new(),
                started_at: None,
                finished_at: None,
            });
        }

        let _lock = self.lock()?;
        let now = Utc::now();

        if let Some(mut existing) = self.load()? {
            if existing.is_abandoned(now, self.settings.abandon_after_secs) {
                tracing::warn!(
                    "Run {} has had no heartbeat since {}; archiving it as abandoned",
                    existing.id,
                    existing.heartbeat_at
                );
                existing.status = RunStatus::Abandoned;
                existing.finished_at = Some(now);
                self.archive(&existing)?;
            } else {
                return Err(WardError::RunAlreadyActive {
                    id: existing.id.to_string(),
                    goal: existing.goal,
                });
            }
        }

        let state = RunState {
            id: RunId::generate(),
            goal: goal.to_string(),
            status: RunStatus::Active,
            steps,
            touched: BTreeSet::new(),
            baselines: BTreeMap::new(),
            edits: Vec::new(),
            last_verification: None,
            retry_budget: retry_budget.unwrap_or(self.settings.retry_budget),
            created_at: now,
            updated_at: now,
            heartbeat_at: now,
            finished_at: None,
            abort_reason: None,
        };
        self.save(&state)?;
        tracing::info!("Started run {} with {} steps", state.id, state.steps.len());
        Ok(state)
    }

    /// Capture baselines for a step's files and mark it in progress.
    fn enter_step(&self, state: &mut RunState, index: usize, now: DateTime<Utc>) -> Result<(), WardError> {
        for file in state.steps[index].files.clone() {
            if !state.baselines.contains_key(&file) {
                let captured = self.snapshots.capture(&self.workspace.abs_path(&file))?;
                state.baselines.insert(file, captured);
            }
        }
        let step = &mut state.steps[index];
        step.status = StepStatus::InProgress;
        step.started_at = Some(now);
        step.finished_at = None;
        Ok(())
    }

    /// Move a pending (or failed) step into progress.
    pub fn begin_step(&self, index: usize) -> Result<RunState, WardError> {
        let _lock = self.lock()?;
        let mut state = self.load_active()?;

        let Some(step) = state.steps.get(index) else {
            return Err(WardError::InvalidArgument(format!(
                "Run has {} steps; there is no step {}.",
                state.steps.len(),
                index + 1
            )));
        };

        if let Some(current) = state.current_step() {
            return Err(WardError::InvalidTransition(format!(
                "step {} is already in progress",
                current + 1
            )));
        }

        match step.status {
            StepStatus::Pending => {}
            StepStatus::Failed if step.attempts > state.retry_budget => {
                return Err(WardError::RetryBudgetExhausted {
                    step: index + 1,
                    attempts: step.attempts,
                    budget: state.retry_budget,
                });
            }
            StepStatus::Failed => {}
            other => {
                return Err(WardError::InvalidTransition(format!(
                    "step {} is {}",
                    index + 1,
                    other
                )));
            }
        }

        let now = Utc::now();
        self.enter_step(&mut state, index, now)?;
        state.touch(now);
        self.save(&state)?;
        tracing::info!("Run {}: began step {}", state.id, index + 1);
        Ok(state)
    }

    /// Replace a target file's content and record the edit.
    ///
    /// `expected_old` must match the live bytes (`None`: the file must not
    /// exist), otherwise nothing is written and state is unchanged.
    pub fn edit_file(
        &self,
        key: &str,
        expected_old: Option<&[u8]>,
        new_content: &[u8],
        description: &str,
        sink: &dyn WriteSink,
    ) -> Result<EditRecord, WardError> {
        let _lock = self.lock()?;
        let mut state = self.load_active()?;
        let step = self.require_covering_step(&state, key)?;

        let abs = self.workspace.abs_path(key);
        let live = read_optional(&abs)?;
        if live.as_deref() != expected_old {
            return Err(WardError::ContentMismatch(key.to_string()));
        }

        let before = match &live {
            Some(bytes) => Some(self.snapshots.store(bytes)?),
            None => None,
        };
        let after = self.snapshots.store(new_content)?;

        sink.write(&abs, new_content)?;

        let now = Utc::now();
        let record = EditRecord {
            seq: next_seq(&state),
            step,
            path: key.to_string(),
            before,
            after: Some(after),
            description: description.to_string(),
            source: EditSource::Edit,
            at: now,
        };
        state.edits.push(record.clone());
        state.touched.insert(key.to_string());
        state.touch(now);
        self.save(&state)?;

        tracing::info!("Run {}: edit #{} on {}", state.id, record.seq, key);
        Ok(record)
    }

    /// Record a write the host performed itself.
    pub fn record_write(&self, key: &str, description: &str) -> Result<EditRecord, WardError> {
        let _lock = self.lock()?;
        let mut state = self.load_active()?;
        let step = self.require_covering_step(&state, key)?;

        let before = state.last_known(key);
        let after = self.snapshots.capture(&self.workspace.abs_path(key))?;

        let now = Utc::now();
        let record = EditRecord {
            seq: next_seq(&state),
            step,
            path: key.to_string(),
            before,
            after,
            description: description.to_string(),
            source: EditSource::Recorded,
            at: now,
        };
        state.edits.push(record.clone());
        state.touched.insert(key.to_string());
        state.touch(now);
        self.save(&state)?;

        tracing::info!("Run {}: recorded write #{} on {}", state.id, record.seq, key);
        Ok(record)
    }

    fn require_covering_step(&self, state: &RunState, key: &str) -> Result<usize, WardError> {
        let step = state.current_step().ok_or_else(|| {
            WardError::InvalidTransition("no step is in progress; run `ward run begin` first".to_string())
        })?;
        if !state.steps[step].covers(key) {
            return Err(WardError::FileNotInStep {
                path: key.to_string(),
                step: step + 1,
            });
        }
        Ok(step)
    }

    /// Finish the in-progress step and verify it.
    ///
    /// The run lock is released while `verifier` runs. On pass the step is
    /// done and the next pending step begins; when none remain the run is
    /// completed and archived. On failure the step is marked failed and the
    /// run halts; past the retry budget this returns
    /// [`WardError::RetryBudgetExhausted`] after persisting the failure.
    pub fn complete_step(
        &self,
        files_touched: &[String],
        notes: Option<&str>,
        verifier: &dyn Verifier,
    ) -> Result<StepCompletion, WardError> {
        let (run_id, step, attempts, verify_files) = {
            let _lock = self.lock()?;
            let state = self.load_active()?;
            let step = state.current_step().ok_or_else(|| {
                WardError::InvalidTransition("no step is in progress".to_string())
            })?;

            let mut files: BTreeSet<String> = files_touched.iter().cloned().collect();
            if files.is_empty() {
                files.extend(state.steps[step].files.iter().cloned());
                files.extend(
                    state
                        .edits
                        .iter()
                        .filter(|e| e.step == step)
                        .map(|e| e.path.clone()),
                );
            }
            (
                state.id.clone(),
                step,
                state.steps[step].attempts,
                files.into_iter().collect::<Vec<_>>(),
            )
        };

        tracing::debug!("Run {}: verifying step {} ({} files)", run_id, step + 1, verify_files.len());
        let outcome = verifier.run(&verify_files)?;

        let _lock = self.lock()?;
        let mut state = self.load()?.filter(|s| s.id == run_id).ok_or_else(|| {
            WardError::StaleState(format!(
                "run {} was aborted or replaced while step {} was being verified",
                run_id,
                step + 1
            ))
        })?;
        {
            let current = &state.steps[step];
            if current.status != StepStatus::InProgress || current.attempts != attempts {
                return Err(WardError::StaleState(format!(
                    "step {} changed while it was being verified",
                    step + 1
                )));
            }
        }

        let now = Utc::now();
        state.touched.extend(files_touched.iter().cloned());
        if let Some(note) = notes.filter(|n| !n.trim().is_empty()) {
            state.steps[step].notes.push(note.to_string());
        }
        state.last_verification = Some(StepVerification {
            step,
            passed: outcome.passed,
            details: outcome.details.clone(),
            at: now,
        });
        state.touch(now);

        if !outcome.passed {
            let current = &mut state.steps[step];
            current.status = StepStatus::Failed;
            current.attempts += 1;
            current.finished_at = Some(now);
            let attempts = current.attempts;
            self.save(&state)?;
            tracing::warn!(
                "Run {}: step {} failed verification (attempt {}, budget {})",
                state.id,
                step + 1,
                attempts,
                state.retry_budget
            );

            if attempts > state.retry_budget {
                return Err(WardError::RetryBudgetExhausted {
                    step: step + 1,
                    attempts,
                    budget: state.retry_budget,
                });
            }
            return Ok(StepCompletion {
                step,
                passed: false,
                details: outcome.details,
                attempts,
                next_step: None,
                run_completed: false,
            });
        }

        state.steps[step].status = StepStatus::Done;
        state.steps[step].finished_at = Some(now);
        let attempts = state.steps[step].attempts;

        let next_step = state
            .steps
            .iter()
            .enumerate()
            .skip(step + 1)
            .chain(state.steps.iter().enumerate().take(step))
            .find(|(_, s)| s.status == StepStatus::Pending)
            .map(|(idx, _)| idx);

        if let Some(next) = next_step {
            self.enter_step(&mut state, next, now)?;
        }

        let run_completed = state.is_complete();
        if run_completed {
            state.status = RunStatus::Completed;
            state.finished_at = Some(now);
            self.archive(&state)?;
        } else {
            self.save(&state)?;
        }

        tracing::info!(
            "Run {}: step {} passed{}",
            state.id,
            step + 1,
            if run_completed { ", run complete" } else { "" }
        );
        Ok(StepCompletion {
            step,
            passed: true,
            details: outcome.details,
            attempts,
            next_step,
            run_completed,
        })
    }

    /// Mark a step done without verification (human override).
    pub fn force_complete_step(&self, index: usize, note: &str) -> Result<RunState, WardError> {
        let _lock = self.lock()?;
        let mut state = self.load_active()?;
        let step_count = state.steps.len();

        let Some(step) = state.steps.get_mut(index) else {
            return Err(WardError::InvalidArgument(format!(
                "Run has {} steps; there is no step {}.",
                step_count,
                index + 1
            )));
        };
        if step.status == StepStatus::Done {
            return Err(WardError::InvalidTransition(format!(
                "step {} is already done",
                index + 1
            )));
        }

        let now = Utc::now();
        step.status = StepStatus::Done;
        step.finished_at = Some(now);
        step.notes.push(format!("force-completed: {}", note));
        state.touch(now);

        if state.is_complete() {
            state.status = RunStatus::Completed;
            state.finished_at = Some(now);
            self.archive(&state)?;
        } else {
            self.save(&state)?;
        }
        tracing::warn!("Run {}: step {} force-completed", state.id, index + 1);
        Ok(state)
    }

    /// True iff a run is active and every step is done.
    pub fn is_complete(&self) -> Result<bool, WardError> {
        Ok(self.load_active()?.is_complete())
    }

    /// Roll back every change of the active run and archive it as aborted.
    ///
    /// Edits are undone in exact reverse order, so a file edited several
    /// times ends up as it was before its first edit. Afterwards every file
    /// whose content differs from its baseline is put back to the baseline.
    pub fn abort(&self, reason: &str) -> Result<AbortSummary, WardError> {
        let _lock = self.lock()?;
        let mut state = self.load_active()?;

        let needed: BTreeSet<&SnapshotId> = state
            .edits
            .iter()
            .filter_map(|e| e.before.as_ref())
            .chain(state.baselines.values().flatten())
            .collect();
        let missing: Vec<&str> = needed
            .into_iter()
            .filter(|id| !self.snapshots.exists(id))
            .map(|id| id.short())
            .collect();
        if !missing.is_empty() {
            return Err(WardError::StaleState(format!(
                "run {} cannot be rolled back; missing snapshots: {}",
                state.id,
                missing.join(", ")
            )));
        }

        let mut restored = Vec::new();
        for edit in state.edits.iter().rev() {
            self.snapshots
                .restore(edit.before.as_ref(), &self.workspace.abs_path(&edit.path))?;
            restored.push(edit.path.clone());
        }

        // Baselines are the final word: they also undo host writes that
        // were never recorded, including ones an edit later built on.
        for (path, baseline) in &state.baselines {
            let abs = self.workspace.abs_path(path);
            let live = file_fingerprint(&abs)?;
            if live.as_deref() != baseline.as_ref().map(|b| b.as_str()) {
                self.snapshots.restore(baseline.as_ref(), &abs)?;
                restored.push(path.clone());
            }
        }

        let now = Utc::now();
        state.status = RunStatus::Aborted;
        state.abort_reason = Some(reason.to_string());
        state.finished_at = Some(now);
        state.touch(now);
        self.archive(&state)?;

        tracing::info!(
            "Run {} aborted ({} restores): {}",
            state.id,
            restored.len(),
            reason
        );
        Ok(AbortSummary {
            run: state,
            restored,
        })
    }

    /// Refresh the active run's liveness timestamp.
    pub fn heartbeat(&self) -> Result<RunState, WardError> {
        let _lock = self.lock()?;
        let mut state = self.load_active()?;
        state.heartbeat_at = Utc::now();
        self.save(&state)?;
        Ok(state)
    }

    /// Archive the active run as abandoned, without rollback.
    ///
    /// Without `force`, only a run whose heartbeat expired is archived.
    pub fn clear_abandoned(&self, force: bool) -> Result<Option<RunState>, WardError> {
        let _lock = self.lock()?;
        let Some(mut state) = self.load()? else {
            return Ok(None);
        };
        let now = Utc::now();
        if !force && !state.is_abandoned(now, self.settings.abandon_after_secs) {
            return Ok(None);
        }
        state.status = RunStatus::Abandoned;
        state.finished_at = Some(now);
        self.archive(&state)?;
        Ok(Some(state))
    }

    /// Move an unparsable `run.json` aside so a new run can start.
    pub fn quarantine(&self) -> Result<Option<std::path::PathBuf>, WardError> {
        let _lock = self.lock()?;
        let path = self.workspace.run_path();
        if !path.exists() || self.load().is_ok() {
            return Ok(None);
        }
        let target = self.workspace.run_history_dir().join(format!(
            "unreadable-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        fs::create_dir_all(self.workspace.run_history_dir())?;
        fs::rename(&path, &target)?;
        tracing::warn!("Moved unreadable run state to {}", target.display());
        Ok(Some(target))
    }

    /// Problems with the active run's snapshot references.
    pub fn integrity_problems(&self, state: &RunState) -> Vec<String> {
        let mut ids: Vec<SnapshotId> = state.referenced_snapshots().into_iter().collect();
        ids.sort();
        ids.into_iter()
            .filter(|id| !self.snapshots.exists(id))
            .map(|id| format!("run {} references missing snapshot {}", state.id, id.short()))
            .collect()
    }

    /// Archived runs, newest first.
    pub fn history(&self) -> Result<Vec<RunState>, WardError> {
        let dir = self.workspace.run_history_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            match read_json::<RunState>(&path) {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable archived run {}: {}", path.display(), e),
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }
}

fn next_seq(state: &RunState) -> u64 {
    state.edits.last().map(|e| e.seq + 1).unwrap_or(1)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{NoopVerifier, VerificationOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FailingVerifier;

    impl Verifier for FailingVerifier {
        fn run(&self, _files: &[String]) -> Result<VerificationOutcome, WardError> {
            Ok(VerificationOutcome::fail("tests failed"))
        }
    }

    struct CountingVerifier(AtomicUsize);

    impl Verifier for CountingVerifier {
        fn run(&self, _files: &[String]) -> Result<VerificationOutcome, WardError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(VerificationOutcome::pass("ok"))
        }
    }

    fn setup() -> (TempDir, Workspace, RunTracker) {
        let temp = TempDir::new().unwrap();
        let mut ws = Workspace::from_root(temp.path()).unwrap();
        ws.create_layout().unwrap();
        let mut settings = Settings::defaults_for(ws.root());
        settings.lock_timeout_ms = 200;
        let tracker = RunTracker::new(&ws, SnapshotStore::new(&ws.snapshots_dir()), &settings);
        (temp, ws, tracker)
    }

    fn write(ws: &Workspace, key: &str, content: &str) {
        fs::write(ws.abs_path(key), content).unwrap();
    }

    fn read(ws: &Workspace, key: &str) -> String {
        fs::read_to_string(ws.abs_path(key)).unwrap()
    }

    #[test]
    fn test_start_creates_pending_steps() {
        let (_temp, _ws, tracker) = setup();
        let state = tracker
            .start("add logging", vec![StepPlan::new("one", &["a.rs"]), StepPlan::new("two", &["b.rs"])], None)
            .unwrap();

        assert_eq!(state.status, RunStatus::Active);
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(state.retry_budget, 2);
        assert_eq!(tracker.load().unwrap().unwrap().id, state.id);
    }

    #[test]
    fn test_second_start_fails_and_leaves_state_untouched() {
        let (_temp, ws, tracker) = setup();
        tracker.start("first", vec![StepPlan::new("s", &["a.rs"])], None).unwrap();
        let before = fs::read(ws.run_path()).unwrap();

        let err = tracker
            .start("second", vec![StepPlan::new("s", &["b.rs"])], None)
            .unwrap_err();
        assert!(matches!(err, WardError::RunAlreadyActive { .. }));
        assert_eq!(fs::read(ws.run_path()).unwrap(), before);
    }

    #[test]
    fn test_start_validates_plan() {
        let (_temp, _ws, tracker) = setup();
        assert!(tracker.start("goal", vec![], None).is_err());
        assert!(tracker.start("  ", vec![StepPlan::new("s", &["a"])], None).is_err());
        assert!(tracker.start("goal", vec![StepPlan::new("s", &[])], None).is_err());
        assert!(tracker.load().unwrap().is_none());
    }

    #[test]
    fn test_begin_step_rules() {
        let (_temp, _ws, tracker) = setup();
        tracker
            .start("g", vec![StepPlan::new("one", &["a.rs"]), StepPlan::new("two", &["b.rs"])], None)
            .unwrap();

        assert!(matches!(tracker.begin_step(5), Err(WardError::InvalidArgument(_))));
        let state = tracker.begin_step(0).unwrap();
        assert_eq!(state.steps[0].status, StepStatus::InProgress);
        assert!(matches!(tracker.begin_step(1), Err(WardError::InvalidTransition(_))));
        assert!(matches!(tracker.begin_step(0), Err(WardError::InvalidTransition(_))));
    }

    #[test]
    fn test_begin_without_run() {
        let (_temp, _ws, tracker) = setup();
        assert!(matches!(tracker.begin_step(0), Err(WardError::NoActiveRun)));
    }

    #[test]
    fn test_edit_file_checks_expected_content() {
        let (_temp, ws, tracker) = setup();
        write(&ws, "a.rs", "old");
        tracker.start("g", vec![StepPlan::new("s", &["a.rs"])], None).unwrap();
        tracker.begin_step(0).unwrap();
        let before = fs::read(ws.run_path()).unwrap();

        let err = tracker
            .edit_file("a.rs", Some(b"stale view"), b"new", "edit", &FsWriteSink)
            .unwrap_err();
        assert!(matches!(err, WardError::ContentMismatch(_)));
        assert_eq!(read(&ws, "a.rs"), "old");
        assert_eq!(fs::read(ws.run_path()).unwrap(), before);

        let record = tracker
            .edit_file("a.rs", Some(b"old"), b"new", "edit", &FsWriteSink)
            .unwrap();
        assert_eq!(record.seq, 1);
        assert_eq!(read(&ws, "a.rs"), "new");
        assert!(tracker.load().unwrap().unwrap().touched.contains("a.rs"));
    }

    #[test]
    fn test_edit_outside_step_rejected() {
        let (_temp, ws, tracker) = setup();
        write(&ws, "b.rs", "b");
        tracker.start("g", vec![StepPlan::new("s", &["a.rs"])], None).unwrap();
        tracker.begin_step(0).unwrap();

        let err = tracker
            .edit_file("b.rs", Some(b"b"), b"x", "edit", &FsWriteSink)
            .unwrap_err();
        assert!(matches!(err, WardError::FileNotInStep { step: 1, .. }));
    }

    #[test]
    fn test_edit_creates_new_file() {
        let (_temp, ws, tracker) = setup();
        tracker.start("g", vec![StepPlan::new("s", &["new.rs"])], None).unwrap();
        tracker.begin_step(0).unwrap();

        let record = tracker
            .edit_file("new.rs", None, b"fn main() {}", "create", &FsWriteSink)
            .unwrap();
        assert!(record.before.is_none());
        assert_eq!(read(&ws, "new.rs"), "fn main() {}");

        tracker.abort("undo").unwrap();
        assert!(!ws.abs_path("new.rs").exists());
    }

    #[test]
    fn test_abort_restores_in_reverse_order() {
        let (_temp, ws, tracker) = setup();
        write(&ws, "a.txt", "A0");
        write(&ws, "b.txt", "B0");
        tracker
            .start("g", vec![StepPlan::new("both", &["a.txt", "b.txt"])], None)
            .unwrap();
        tracker.begin_step(0).unwrap();

        tracker.edit_file("a.txt", Some(b"A0"), b"A1", "E1", &FsWriteSink).unwrap();
        tracker.edit_file("b.txt", Some(b"B0"), b"B1", "E2", &FsWriteSink).unwrap();
        tracker.edit_file("a.txt", Some(b"A1"), b"A2", "E3", &FsWriteSink).unwrap();

        let summary = tracker.abort("changed my mind").unwrap();
        assert_eq!(read(&ws, "a.txt"), "A0");
        assert_eq!(read(&ws, "b.txt"), "B0");
        assert_eq!(summary.restored, vec!["a.txt", "b.txt", "a.txt"]);
        assert_eq!(summary.run.status, RunStatus::Aborted);

        assert!(tracker.load().unwrap().is_none());
        let history = tracker.history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].abort_reason.as_deref(), Some("changed my mind"));
    }

    #[test]
    fn test_abort_restores_unrecorded_host_writes_from_baseline() {
        let (_temp, ws, tracker) = setup();
        write(&ws, "a.txt", "A0");
        tracker.start("g", vec![StepPlan::new("s", &["a.txt", "c.txt"])], None).unwrap();
        tracker.begin_step(0).unwrap();

        // Host writes directly without telling the tracker.
        write(&ws, "a.txt", "host edit");
        write(&ws, "c.txt", "host created");

        let summary = tracker.abort("rollback").unwrap();
        assert_eq!(read(&ws, "a.txt"), "A0");
        assert!(!ws.abs_path("c.txt").exists());
        assert_eq!(summary.restored.len(), 2);
    }

    #[test]
    fn test_abort_undoes_host_write_that_an_edit_built_on() {
        let (_temp, ws, tracker) = setup();
        write(&ws, "a.txt", "A0");
        tracker.start("g", vec![StepPlan::new("s", &["a.txt"])], None).unwrap();
        tracker.begin_step(0).unwrap();

        // Unrecorded host write, then a guarded edit on top of it.
        write(&ws, "a.txt", "HOST");
        tracker.edit_file("a.txt", Some(b"HOST"), b"A1", "E1", &FsWriteSink).unwrap();

        let summary = tracker.abort("rollback").unwrap();
        assert_eq!(read(&ws, "a.txt"), "A0");
        assert_eq!(summary.restored, vec!["a.txt", "a.txt"]);
    }

    #[test]
    fn test_record_write_chains_snapshots() {
        let (_temp, ws, tracker) = setup();
        write(&ws, "a.txt", "v0");
        tracker.start("g", vec![StepPlan::new("s", &["a.txt"])], None).unwrap();
        tracker.begin_step(0).unwrap();

        write(&ws, "a.txt", "v1");
        let first = tracker.record_write("a.txt", "host write").unwrap();
        write(&ws, "a.txt", "v2");
        let second = tracker.record_write("a.txt", "host write").unwrap();

        assert_eq!(first.source, EditSource::Recorded);
        assert_eq!(second.before, first.after);
        assert_eq!(second.seq, 2);

        tracker.abort("undo").unwrap();
        assert_eq!(read(&ws, "a.txt"), "v0");
    }

    #[test]
    fn test_complete_step_advances_and_completes() {
        let (_temp, ws, tracker) = setup();
        write(&ws, "a.rs", "a");
        write(&ws, "b.rs", "b");
        tracker
            .start("g", vec![StepPlan::new("one", &["a.rs"]), StepPlan::new("two", &["b.rs"])], None)
            .unwrap();
        tracker.begin_step(0).unwrap();

        let first = tracker.complete_step(&[], Some("did it"), &NoopVerifier).unwrap();
        assert!(first.passed);
        assert_eq!(first.next_step, Some(1));
        assert!(!first.run_completed);

        let state = tracker.load().unwrap().unwrap();
        assert_eq!(state.steps[0].status, StepStatus::Done);
        assert_eq!(state.steps[0].notes, vec!["did it".to_string()]);
        assert_eq!(state.steps[1].status, StepStatus::InProgress);
        assert!(state.baselines.contains_key("b.rs"));
        assert!(!tracker.is_complete().unwrap());

        let second = tracker.complete_step(&["b.rs".to_string()], None, &NoopVerifier).unwrap();
        assert!(second.run_completed);
        assert!(tracker.load().unwrap().is_none());
        assert_eq!(tracker.history().unwrap()[0].status, RunStatus::Completed);
    }

    #[test]
    fn test_failed_step_halts_and_can_be_retried() {
        let (_temp, _ws, tracker) = setup();
        tracker
            .start("g", vec![StepPlan::new("one", &["a.rs"]), StepPlan::new("two", &["b.rs"])], None)
            .unwrap();
        tracker.begin_step(0).unwrap();

        let outcome = tracker.complete_step(&[], None, &FailingVerifier).unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.next_step, None);

        let state = tracker.load().unwrap().unwrap();
        assert_eq!(state.steps[0].status, StepStatus::Failed);
        assert_eq!(state.steps[1].status, StepStatus::Pending);
        assert_eq!(state.last_verification.as_ref().map(|v| v.passed), Some(false));

        tracker.begin_step(0).unwrap();
        let retry = tracker.complete_step(&[], None, &NoopVerifier).unwrap();
        assert!(retry.passed);
    }

    #[test]
    fn test_retry_budget_exhaustion() {
        let (_temp, _ws, tracker) = setup();
        tracker
            .start("g", vec![StepPlan::new("one", &["a.rs"]), StepPlan::new("two", &["b.rs"])], Some(2))
            .unwrap();

        for attempt in 1..=2 {
            tracker.begin_step(0).unwrap();
            let outcome = tracker.complete_step(&[], None, &FailingVerifier).unwrap();
            assert_eq!(outcome.attempts, attempt);
        }

        tracker.begin_step(0).unwrap();
        let err = tracker.complete_step(&[], None, &FailingVerifier).unwrap_err();
        assert!(matches!(
            err,
            WardError::RetryBudgetExhausted { step: 1, attempts: 3, budget: 2 }
        ));

        let state = tracker.load().unwrap().unwrap();
        assert_eq!(state.status, RunStatus::Active);
        assert_eq!(state.steps[0].status, StepStatus::Failed);
        assert_eq!(state.steps[1].status, StepStatus::Pending);

        // Only a human decision moves it on.
        assert!(matches!(
            tracker.begin_step(0),
            Err(WardError::RetryBudgetExhausted { .. })
        ));
        let forced = tracker.force_complete_step(0, "accepted manually").unwrap();
        assert_eq!(forced.steps[0].status, StepStatus::Done);
        assert_eq!(forced.status, RunStatus::Active);
    }

    #[test]
    fn test_lock_not_held_during_verification() {
        struct HeartbeatVerifier<'a>(&'a RunTracker);
        impl Verifier for HeartbeatVerifier<'_> {
            fn run(&self, _files: &[String]) -> Result<VerificationOutcome, WardError> {
                self.0.heartbeat()?;
                Ok(VerificationOutcome::pass("ok"))
            }
        }
        // Verifier must be Send + Sync; a shared reference to RunTracker is.

        let (_temp, _ws, tracker) = setup();
        tracker.start("g", vec![StepPlan::new("s", &["a.rs"])], None).unwrap();
        tracker.begin_step(0).unwrap();

        let outcome = tracker.complete_step(&[], None, &HeartbeatVerifier(&tracker)).unwrap();
        assert!(outcome.run_completed);
    }

    #[test]
    fn test_abort_during_verification_is_stale_state() {
        struct AbortingVerifier<'a>(&'a RunTracker);
        impl Verifier for AbortingVerifier<'_> {
            fn run(&self, _files: &[String]) -> Result<VerificationOutcome, WardError> {
                self.0.abort("operator pulled the plug")?;
                Ok(VerificationOutcome::pass("ok"))
            }
        }

        let (_temp, _ws, tracker) = setup();
        tracker.start("g", vec![StepPlan::new("s", &["a.rs"])], None).unwrap();
        tracker.begin_step(0).unwrap();

        let err = tracker
            .complete_step(&[], None, &AbortingVerifier(&tracker))
            .unwrap_err();
        assert!(matches!(err, WardError::StaleState(_)));
    }

    #[test]
    fn test_verifier_called_once_per_completion() {
        let (_temp, _ws, tracker) = setup();
        tracker.start("g", vec![StepPlan::new("s", &["a.rs"])], None).unwrap();
        tracker.begin_step(0).unwrap();
        let verifier = CountingVerifier(AtomicUsize::new(0));
        tracker.complete_step(&[], None, &verifier).unwrap();
        assert_eq!(verifier.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abandoned_run_is_archived_on_start() {
        let (_temp, ws, tracker) = setup();
        tracker.start("old", vec![StepPlan::new("s", &["a.rs"])], None).unwrap();

        let mut state = tracker.load().unwrap().unwrap();
        state.heartbeat_at = Utc::now() - chrono::Duration::days(3);
        write_json(&ws.run_path(), &state).unwrap();

        let fresh = tracker.start("new", vec![StepPlan::new("s", &["b.rs"])], None).unwrap();
        assert_eq!(fresh.goal, "new");
        let history = tracker.history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Abandoned);
    }

    #[test]
    fn test_clear_abandoned_respects_force() {
        let (_temp, _ws, tracker) = setup();
        tracker.start("g", vec![StepPlan::new("s", &["a.rs"])], None).unwrap();
        assert!(tracker.clear_abandoned(false).unwrap().is_none());
        assert!(tracker.load().unwrap().is_some());

        let cleared = tracker.clear_abandoned(true).unwrap().unwrap();
        assert_eq!(cleared.status, RunStatus::Abandoned);
        assert!(tracker.load().unwrap().is_none());
    }

    #[test]
    fn test_quarantine_unreadable_state() {
        let (_temp, ws, tracker) = setup();
        fs::write(ws.run_path(), "{ truncated").unwrap();
        assert!(tracker.load().is_err());

        let moved = tracker.quarantine().unwrap().unwrap();
        assert!(moved.exists());
        assert!(tracker.load().unwrap().is_none());
    }

    #[test]
    fn test_abort_refuses_when_snapshot_missing() {
        let (_temp, ws, tracker) = setup();
        write(&ws, "a.txt", "A0");
        tracker.start("g", vec![StepPlan::new("s", &["a.txt"])], None).unwrap();
        tracker.begin_step(0).unwrap();
        tracker.edit_file("a.txt", Some(b"A0"), b"A1", "E1", &FsWriteSink).unwrap();

        fs::remove_dir_all(ws.snapshots_dir()).unwrap();
        let err = tracker.abort("x").unwrap_err();
        assert!(matches!(err, WardError::StaleState(_)));
        // Nothing was rolled back or archived.
        assert_eq!(read(&ws, "a.txt"), "A1");
        assert!(tracker.load().unwrap().is_some());

        let state = tracker.load().unwrap().unwrap();
        assert!(!tracker.integrity_problems(&state).is_empty());
    }
}
