//! The ward engine.
//!
//! [`WardEngine`] is the single entry point used by the CLI. It resolves
//! projects, loads configuration, wires the collaborators (verifier,
//! dependency graph, registry) and delegates to the state machines.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{GlobalConfig, ProjectConfig, Settings};
use crate::constants::{KNOWLEDGE_LOCK, QUICKFIX_LOCK, RUN_LOCK};
use crate::errors::WardError;
use crate::fsutil::{atomic_write, remove_if_exists, write_json};
use crate::gate::{self, GateRequest, GateResponse};
use crate::graph::{load_graph, DependencyGraph};
use crate::knowledge::{Freshness, KnowledgeFacts, KnowledgeRecord, KnowledgeStore, LearnOutcome};
use crate::lock::StateLock;
use crate::preflight::{self, OperationKind, PreflightReport};
use crate::quickfix::{QuickFixState, QuickFixTracker};
use crate::registry::{FileRegistry, ProjectEntry, Registry};
use crate::run::{
    AbortSummary, EditRecord, FsWriteSink, RunState, RunTracker, StepCompletion, StepPlan,
};
use crate::snapshot::{GcSummary, SnapshotId, SnapshotStore};
use crate::verify::{CommandVerifier, NoopVerifier, Verifier};
use crate::workspace::Workspace;

const PROJECT_CONFIG_TEMPLATE: &str = "\
# ward project configuration. Every key is optional.
#
# retryBudget: 2
# abandonAfterSecs: 86400
# snapshotGraceSecs: 86400
# lockTimeoutMs: 5000
# verify:
#   command: cargo test
# graph:
#   path: .ward/graph.json
";

// ============================================================================
// Report types
// ============================================================================

/// Snapshot of a project's state for `ward status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub root: PathBuf,
    pub initialized: bool,
    pub run: Option<RunState>,
    pub run_abandoned: bool,
    pub quickfix: Option<QuickFixState>,
    pub quickfix_abandoned: bool,
    pub knowledge_files: usize,
    pub stale_files: Vec<String>,
    /// Problems that need `ward doctor` / `ward clear-stale`.
    pub problems: Vec<String>,
}

/// Options for [`WardEngine::start_run`].
#[derive(Debug, Clone, Default)]
pub struct StartRunOptions {
    pub retry_budget: Option<u32>,
    pub skip_preflight: bool,
    pub strict: bool,
    pub refactor: bool,
}

/// Result of [`WardEngine::doctor`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorReport {
    pub problems: Vec<String>,
    pub warnings: Vec<String>,
}

impl DoctorReport {
    pub fn is_healthy(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Result of [`WardEngine::clear_stale`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearStaleSummary {
    pub archived_run: Option<String>,
    pub quarantined_run: Option<PathBuf>,
    pub archived_quickfix: Option<String>,
    pub discarded_quickfix: bool,
    pub preflight_removed: bool,
}

impl ClearStaleSummary {
    pub fn is_empty(&self) -> bool {
        self.archived_run.is_none()
            && self.quarantined_run.is_none()
            && self.archived_quickfix.is_none()
            && !self.discarded_quickfix
            && !self.preflight_removed
    }
}

// ============================================================================
// WardEngine
// ============================================================================

/// Main entry point for ward operations.
///
/// # Example
///
/// ```ignore
/// use ward_core::WardEngine;
/// use std::path::Path;
///
/// let engine = WardEngine::with_defaults()?;
/// let mut workspace = engine.resolve_workspace(Path::new("."))?;
/// engine.init_workspace(&mut workspace)?;
/// let report = engine.status(&workspace)?;
/// ```
pub struct WardEngine {
    global_config: GlobalConfig,
    verifier: Option<Arc<dyn Verifier>>,
    graph: Option<Arc<dyn DependencyGraph>>,
}

impl fmt::Debug for WardEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WardEngine")
            .field("global_config", &self.global_config)
            .field("custom_verifier", &self.verifier.is_some())
            .field("custom_graph", &self.graph.is_some())
            .finish()
    }
}

impl WardEngine {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn from_global_config(global_config: GlobalConfig) -> Self {
        Self {
            global_config,
            verifier: None,
            graph: None,
        }
    }

    /// Load `~/.ward/config.yaml` (or defaults when absent).
    pub fn with_defaults() -> Result<Self, WardError> {
        Ok(Self::from_global_config(GlobalConfig::load_default()?))
    }

    /// Load the global configuration from a specific file.
    pub fn with_config(path: &Path) -> Result<Self, WardError> {
        Ok(Self::from_global_config(GlobalConfig::from_path(path)?))
    }

    /// Replace the configured verifier for every project.
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Replace the graph loaded from `graph.json` for every project.
    pub fn with_graph(mut self, graph: Arc<dyn DependencyGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn global_config(&self) -> &GlobalConfig {
        &self.global_config
    }

    // -------------------------------------------------------------------------
    // Projects and configuration
    // -------------------------------------------------------------------------

    /// Resolve the project containing `dir`.
    pub fn resolve_workspace(&self, dir: &Path) -> Result<Workspace, WardError> {
        Workspace::resolve(dir)
    }

    /// The configured project registry.
    pub fn registry(&self) -> Result<FileRegistry, WardError> {
        let path = self
            .global_config
            .registry_path()
            .ok_or_else(|| WardError::InvalidConfiguration {
                message: "cannot locate the project registry (no home directory)".to_string(),
                hint: "Set registryPath in the global config".to_string(),
            })?;
        Ok(FileRegistry::new(&path))
    }

    /// Resolve a registered project by name.
    pub fn resolve_project(&self, registry: &dyn Registry, name: &str) -> Result<Workspace, WardError> {
        let entry = registry.resolve(name)?;
        tracing::debug!("Project {} resolved to {}", name, entry.root.display());
        Workspace::from_root(&entry.root)
    }

    /// Register `workspace` under `name`.
    pub fn register_project(
        &self,
        workspace: &Workspace,
        name: &str,
        language: Option<String>,
    ) -> Result<ProjectEntry, WardError> {
        let language = match language {
            Some(l) => Some(l),
            None => self.load_project_config(workspace)?.language,
        };
        let entry = ProjectEntry {
            root: workspace.root().to_path_buf(),
            language,
        };
        self.registry()?.register(name, entry.clone())?;
        Ok(entry)
    }

    pub fn load_project_config(&self, workspace: &Workspace) -> Result<ProjectConfig, WardError> {
        ProjectConfig::load_from_workspace(workspace.root())
    }

    /// Effective settings for a project.
    pub fn settings(&self, workspace: &Workspace) -> Result<Settings, WardError> {
        Ok(self
            .load_project_config(workspace)?
            .resolve(&self.global_config, workspace.root()))
    }

    /// Create `.ward/` and a commented config template. Idempotent.
    ///
    /// Returns `false` when the project was already initialized.
    pub fn init_workspace(&self, workspace: &mut Workspace) -> Result<bool, WardError> {
        let existed = workspace.is_initialized();
        workspace.create_layout()?;

        let config_path = ProjectConfig::config_path_for_workspace(workspace.root());
        if !config_path.exists() {
            atomic_write(&config_path, PROJECT_CONFIG_TEMPLATE.as_bytes())?;
        }

        if existed {
            tracing::debug!("Project at {} already initialized", workspace.root().display());
        } else {
            tracing::info!("Initialized ward at {}", workspace.root().display());
        }
        Ok(!existed)
    }

    // -------------------------------------------------------------------------
    // Component wiring
    // -------------------------------------------------------------------------

    fn snapshots(&self, workspace: &Workspace) -> SnapshotStore {
        SnapshotStore::new(&workspace.snapshots_dir())
    }

    fn knowledge(&self, workspace: &Workspace, settings: &Settings) -> KnowledgeStore {
        KnowledgeStore::new(workspace, self.snapshots(workspace), settings.lock_timeout())
    }

    fn runs(&self, workspace: &Workspace, settings: &Settings) -> RunTracker {
        RunTracker::new(workspace, self.snapshots(workspace), settings)
    }

    fn quickfixes(&self, workspace: &Workspace, settings: &Settings) -> QuickFixTracker {
        QuickFixTracker::new(workspace, self.snapshots(workspace), settings)
    }

    fn graph(&self, settings: &Settings) -> Result<Arc<dyn DependencyGraph>, WardError> {
        match &self.graph {
            Some(graph) => Ok(graph.clone()),
            None => load_graph(&settings.graph_path),
        }
    }

    fn verifier(&self, workspace: &Workspace, settings: &Settings) -> Arc<dyn Verifier> {
        if let Some(verifier) = &self.verifier {
            return verifier.clone();
        }
        match &settings.verify_command {
            Some(command) => Arc::new(CommandVerifier::new(command.clone(), workspace.root())),
            None => Arc::new(NoopVerifier),
        }
    }

    /// Initialized-project guard plus settings, shared by every stateful operation.
    fn prepare(&self, workspace: &Workspace) -> Result<Settings, WardError> {
        workspace.ensure_initialized()?;
        self.settings(workspace)
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub fn status(&self, workspace: &Workspace) -> Result<StatusReport, WardError> {
        let mut report = StatusReport {
            root: workspace.root().to_path_buf(),
            initialized: workspace.is_initialized(),
            run: None,
            run_abandoned: false,
            quickfix: None,
            quickfix_abandoned: false,
            knowledge_files: 0,
            stale_files: Vec::new(),
            problems: Vec::new(),
        };
        if !workspace.is_initialized() {
            return Ok(report);
        }

        let settings = self.settings(workspace)?;
        let now = Utc::now();

        match self.runs(workspace, &settings).load() {
            Ok(run) => {
                report.run_abandoned = run
                    .as_ref()
                    .map_or(false, |r| r.is_abandoned(now, settings.abandon_after_secs));
                report.run = run;
            }
            Err(e) => report.problems.push(format!("run state is unreadable: {}", e)),
        }
        match self.quickfixes(workspace, &settings).load() {
            Ok(fix) => {
                report.quickfix_abandoned = fix
                    .as_ref()
                    .map_or(false, |q| q.is_abandoned(now, settings.abandon_after_secs));
                report.quickfix = fix;
            }
            Err(e) => report.problems.push(format!("quick-fix state is unreadable: {}", e)),
        }

        let records = self.knowledge(workspace, &settings).list()?;
        report.knowledge_files = records.len();
        report.stale_files = records
            .into_iter()
            .filter(|(_, f)| f.is_stale())
            .map(|(r, _)| r.path)
            .collect();

        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Preflight
    // -------------------------------------------------------------------------

    /// Run the preflight checks and record the report in `preflight.json`.
    ///
    /// The persisted report is advisory; failing to write it only logs.
    pub fn preflight(
        &self,
        workspace: &Workspace,
        files: &[String],
        operation: OperationKind,
        strict: bool,
    ) -> Result<PreflightReport, WardError> {
        let settings = self.prepare(workspace)?;
        let graph = self.graph(&settings)?;
        let report = preflight::check(
            workspace,
            &self.knowledge(workspace, &settings),
            graph.as_ref(),
            files,
            operation,
            strict,
        )?;

        if let Err(e) = write_json(&workspace.preflight_path(), &report) {
            tracing::warn!("Could not record preflight report: {}", e);
        }
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Knowledge
    // -------------------------------------------------------------------------

    /// Learn a file, attaching the graph's module facts when available.
    pub fn learn(
        &self,
        workspace: &Workspace,
        key: &str,
        facts: KnowledgeFacts,
    ) -> Result<LearnOutcome, WardError> {
        let settings = self.prepare(workspace)?;
        let module = self.graph(&settings)?.module_facts(key);
        self.knowledge(workspace, &settings).learn(key, facts, module)
    }

    /// Stored record for a file, with its current freshness.
    pub fn recall(
        &self,
        workspace: &Workspace,
        key: &str,
    ) -> Result<(KnowledgeRecord, Freshness), WardError> {
        let settings = self.prepare(workspace)?;
        let store = self.knowledge(workspace, &settings);
        let record = store
            .recall(key)?
            .ok_or_else(|| WardError::KnowledgeNotFound(key.to_string()))?;
        let freshness = store
            .freshness(key)?
            .ok_or_else(|| WardError::KnowledgeNotFound(key.to_string()))?;
        Ok((record, freshness))
    }

    /// Freshness per key (`None`: never learned).
    pub fn stale(
        &self,
        workspace: &Workspace,
        keys: &[String],
    ) -> Result<Vec<(String, Option<Freshness>)>, WardError> {
        let settings = self.prepare(workspace)?;
        let store = self.knowledge(workspace, &settings);
        keys.iter()
            .map(|k| Ok((k.clone(), store.freshness(k)?)))
            .collect()
    }

    pub fn knowledge_list(
        &self,
        workspace: &Workspace,
    ) -> Result<Vec<(KnowledgeRecord, Freshness)>, WardError> {
        let settings = self.prepare(workspace)?;
        self.knowledge(workspace, &settings).list()
    }

    pub fn forget(&self, workspace: &Workspace, key: &str) -> Result<bool, WardError> {
        let settings = self.prepare(workspace)?;
        self.knowledge(workspace, &settings).purge(key)
    }

    // -------------------------------------------------------------------------
    // Runs
    // -------------------------------------------------------------------------

    /// Start a run, gated by preflight over the plan's existing files.
    pub fn start_run(
        &self,
        workspace: &Workspace,
        goal: &str,
        plan: Vec<StepPlan>,
        options: &StartRunOptions,
    ) -> Result<RunState, WardError> {
        let settings = self.prepare(workspace)?;

        if !options.skip_preflight {
            let files: Vec<String> = plan
                .iter()
                .flat_map(|s| s.files.iter().cloned())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .filter(|k| workspace.abs_path(k).is_file())
                .collect();
            let operation = if options.refactor {
                OperationKind::Refactor
            } else {
                OperationKind::Modify
            };
            let report = self.preflight(workspace, &files, operation, options.strict)?;
            if !report.ready {
                return Err(WardError::Blocked {
                    blockers: report.blockers,
                });
            }
        }

        self.runs(workspace, &settings)
            .start(goal, plan, options.retry_budget)
    }

    pub fn show_run(&self, workspace: &Workspace) -> Result<RunState, WardError> {
        let settings = self.prepare(workspace)?;
        self.runs(workspace, &settings).load()?.ok_or(WardError::NoActiveRun)
    }

    pub fn run_history(&self, workspace: &Workspace) -> Result<Vec<RunState>, WardError> {
        let settings = self.prepare(workspace)?;
        self.runs(workspace, &settings).history()
    }

    /// Begin a step (0-based).
    pub fn begin_step(&self, workspace: &Workspace, index: usize) -> Result<RunState, WardError> {
        let settings = self.prepare(workspace)?;
        self.runs(workspace, &settings).begin_step(index)
    }

    pub fn edit_file(
        &self,
        workspace: &Workspace,
        key: &str,
        expected_old: Option<&[u8]>,
        new_content: &[u8],
        description: &str,
    ) -> Result<EditRecord, WardError> {
        let settings = self.prepare(workspace)?;
        self.runs(workspace, &settings)
            .edit_file(key, expected_old, new_content, description, &FsWriteSink)
    }

    pub fn record_write(
        &self,
        workspace: &Workspace,
        key: &str,
        description: &str,
    ) -> Result<EditRecord, WardError> {
        let settings = self.prepare(workspace)?;
        self.runs(workspace, &settings).record_write(key, description)
    }

    /// Complete the in-progress step and run the configured verifier.
    pub fn complete_step(
        &self,
        workspace: &Workspace,
        files_touched: &[String],
        notes: Option<&str>,
    ) -> Result<StepCompletion, WardError> {
        let settings = self.prepare(workspace)?;
        let verifier = self.verifier(workspace, &settings);
        self.runs(workspace, &settings)
            .complete_step(files_touched, notes, verifier.as_ref())
    }

    pub fn force_complete_step(
        &self,
        workspace: &Workspace,
        index: usize,
        note: &str,
    ) -> Result<RunState, WardError> {
        let settings = self.prepare(workspace)?;
        self.runs(workspace, &settings).force_complete_step(index, note)
    }

    pub fn is_run_complete(&self, workspace: &Workspace) -> Result<bool, WardError> {
        let settings = self.prepare(workspace)?;
        self.runs(workspace, &settings).is_complete()
    }

    pub fn abort_run(&self, workspace: &Workspace, reason: &str) -> Result<AbortSummary, WardError> {
        let settings = self.prepare(workspace)?;
        self.runs(workspace, &settings).abort(reason)
    }

    /// Refresh the liveness timestamp of whatever is active.
    ///
    /// Returns `(run_refreshed, quickfix_refreshed)`.
    pub fn heartbeat(&self, workspace: &Workspace) -> Result<(bool, bool), WardError> {
        let settings = self.prepare(workspace)?;
        let run = match self.runs(workspace, &settings).heartbeat() {
            Ok(_) => true,
            Err(WardError::NoActiveRun) => false,
            Err(e) => return Err(e),
        };
        let quickfix = match self.quickfixes(workspace, &settings).heartbeat() {
            Ok(_) => true,
            Err(WardError::NoActiveQuickFix) => false,
            Err(e) => return Err(e),
        };
        if !run && !quickfix {
            return Err(WardError::NoActiveRun);
        }
        Ok((run, quickfix))
    }

    // -------------------------------------------------------------------------
    // Quick-fix
    // -------------------------------------------------------------------------

    pub fn start_quickfix(&self, workspace: &Workspace, key: &str) -> Result<QuickFixState, WardError> {
        let settings = self.prepare(workspace)?;
        self.quickfixes(workspace, &settings).start(key)
    }

    pub fn quickfix_done(&self, workspace: &Workspace) -> Result<QuickFixState, WardError> {
        let settings = self.prepare(workspace)?;
        self.quickfixes(workspace, &settings).mark_done()
    }

    pub fn quickfix_cancel(&self, workspace: &Workspace) -> Result<QuickFixState, WardError> {
        let settings = self.prepare(workspace)?;
        self.quickfixes(workspace, &settings).cancel()
    }

    // -------------------------------------------------------------------------
    // Write gate
    // -------------------------------------------------------------------------

    /// Decide a host write request. An uninitialized project blocks everything.
    pub fn gate(&self, workspace: &Workspace, request: &GateRequest) -> Result<GateResponse, WardError> {
        if !workspace.is_initialized() {
            return Ok(GateResponse::block(gate::NOT_COVERED_REASON));
        }
        let settings = self.settings(workspace)?;
        gate::decide(workspace, &settings, request)
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Collect unreferenced snapshots older than the grace window.
    ///
    /// Holds the run, quick-fix and knowledge locks (in that order) while
    /// computing the live set and deleting.
    pub fn gc(
        &self,
        workspace: &Workspace,
        grace: Option<Duration>,
        dry_run: bool,
    ) -> Result<GcSummary, WardError> {
        let settings = self.prepare(workspace)?;
        let locks = workspace.locks_dir();
        let timeout = settings.lock_timeout();
        let _run_lock = StateLock::acquire(&locks, RUN_LOCK, timeout)?;
        let _quickfix_lock = StateLock::acquire(&locks, QUICKFIX_LOCK, timeout)?;
        let _knowledge_lock = StateLock::acquire(&locks, KNOWLEDGE_LOCK, timeout)?;

        let mut live: HashSet<SnapshotId> = HashSet::new();
        let refuse = |what: &str, e: WardError| {
            WardError::StaleState(format!(
                "{} is unreadable ({}); run `ward doctor` before collecting snapshots",
                what, e
            ))
        };

        if let Some(run) = self.runs(workspace, &settings).load().map_err(|e| refuse("run state", e))? {
            live.extend(run.referenced_snapshots());
        }
        if let Some(fix) = self
            .quickfixes(workspace, &settings)
            .load()
            .map_err(|e| refuse("quick-fix state", e))?
        {
            live.extend(fix.snapshot);
        }
        live.extend(self.knowledge(workspace, &settings).referenced_snapshots()?);

        let grace = grace.unwrap_or_else(|| Duration::from_secs(settings.snapshot_grace_secs));
        let summary = self.snapshots(workspace).collect_garbage(&live, grace, dry_run)?;
        tracing::debug!(
            "GC: scanned {}, removed {}, kept {} live / {} recent{}",
            summary.scanned,
            summary.removed,
            summary.kept_live,
            summary.kept_recent,
            if dry_run { " (dry run)" } else { "" }
        );
        Ok(summary)
    }

    /// Report abandoned state, unreadable state files and dangling snapshot references.
    pub fn doctor(&self, workspace: &Workspace) -> Result<DoctorReport, WardError> {
        let settings = self.prepare(workspace)?;
        let mut report = DoctorReport {
            warnings: self.global_config.validate()?,
            ..DoctorReport::default()
        };
        let now = Utc::now();
        let snapshots = self.snapshots(workspace);

        let runs = self.runs(workspace, &settings);
        match runs.load() {
            Ok(Some(run)) => {
                if run.is_abandoned(now, settings.abandon_after_secs) {
                    report.problems.push(abandoned_problem("run", &run.id.to_string(), run.heartbeat_at));
                }
                report.problems.extend(runs.integrity_problems(&run));
            }
            Ok(None) => {}
            Err(e) => report.problems.push(format!("run state is unreadable: {}", e)),
        }

        match self.quickfixes(workspace, &settings).load() {
            Ok(Some(fix)) => {
                if fix.is_abandoned(now, settings.abandon_after_secs) {
                    report.problems.push(abandoned_problem("quick-fix on", &fix.path, fix.heartbeat_at));
                }
                if let Some(id) = &fix.snapshot {
                    if !snapshots.exists(id) {
                        report.problems.push(format!(
                            "quick-fix on {} references missing snapshot {}",
                            fix.path,
                            id.short()
                        ));
                    }
                }
            }
            Ok(None) => {}
            Err(e) => report.problems.push(format!("quick-fix state is unreadable: {}", e)),
        }

        report
            .problems
            .extend(self.knowledge(workspace, &settings).integrity_problems()?);

        if !settings.graph_path.exists() {
            report.warnings.push(format!(
                "no dependency graph at {}; impact sets will be empty",
                settings.graph_path.display()
            ));
        }
        Ok(report)
    }

    /// Clear abandoned or unreadable state without rollback.
    ///
    /// With `force`, any active run or quick-fix is archived as abandoned.
    /// The advisory `preflight.json` is always removed.
    pub fn clear_stale(&self, workspace: &Workspace, force: bool) -> Result<ClearStaleSummary, WardError> {
        let settings = self.prepare(workspace)?;
        let mut summary = ClearStaleSummary::default();

        let runs = self.runs(workspace, &settings);
        summary.quarantined_run = runs.quarantine()?;
        summary.archived_run = runs.clear_abandoned(force)?.map(|r| r.id.to_string());

        let quickfixes = self.quickfixes(workspace, &settings);
        summary.discarded_quickfix = quickfixes.discard_unreadable()?;
        summary.archived_quickfix = quickfixes.clear_abandoned(force)?.map(|q| q.path);

        summary.preflight_removed = remove_if_exists(&workspace.preflight_path())?;
        Ok(summary)
    }
}

fn abandoned_problem(what: &str, name: &str, heartbeat: DateTime<Utc>) -> String {
    format!(
        "{} {} is abandoned (last heartbeat {}); run `ward clear-stale`",
        what,
        name,
        heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeListGraph;
    use crate::verify::VerificationOutcome;
    use std::fs;
    use tempfile::TempDir;

    struct AlwaysFail;

    impl Verifier for AlwaysFail {
        fn run(&self, _files: &[String]) -> Result<VerificationOutcome, WardError> {
            Ok(VerificationOutcome::fail("boom"))
        }
    }

    fn setup() -> (TempDir, Workspace, WardEngine) {
        let temp = TempDir::new().unwrap();
        let engine = WardEngine::from_global_config(GlobalConfig::default());
        let mut ws = engine.resolve_workspace(temp.path()).unwrap();
        assert!(engine.init_workspace(&mut ws).unwrap());
        (temp, ws, engine)
    }

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_init_is_idempotent_and_writes_template() {
        let (_temp, mut ws, engine) = setup();
        assert!(!engine.init_workspace(&mut ws).unwrap());
        assert!(ProjectConfig::config_path_for_workspace(ws.root()).exists());
        assert_eq!(engine.load_project_config(&ws).unwrap(), ProjectConfig::default());
    }

    #[test]
    fn test_operations_require_init() {
        let temp = TempDir::new().unwrap();
        let engine = WardEngine::from_global_config(GlobalConfig::default());
        let ws = engine.resolve_workspace(temp.path()).unwrap();
        assert!(matches!(engine.show_run(&ws), Err(WardError::NotInitialized)));
        let gate = engine
            .gate(&ws, &GateRequest { path: "a".into(), action_id: None })
            .unwrap();
        assert!(!gate.is_allowed());
    }

    #[test]
    fn test_preflight_records_report() {
        let (_temp, ws, engine) = setup();
        let report = engine
            .preflight(&ws, &keys(&["a.py"]), OperationKind::Refactor, true)
            .unwrap();
        assert!(!report.ready);
        assert!(ws.preflight_path().exists());

        let summary = engine.clear_stale(&ws, false).unwrap();
        assert!(summary.preflight_removed);
        assert!(!ws.preflight_path().exists());
    }

    #[test]
    fn test_learn_attaches_module_facts() {
        let temp = TempDir::new().unwrap();
        let graph_json = r#"{"edges":[],"modules":{"a.py":{"interfaces":["main"],"imports":[],"lineCount":3}}}"#;
        let engine = WardEngine::from_global_config(GlobalConfig::default());
        let mut ws = engine.resolve_workspace(temp.path()).unwrap();
        engine.init_workspace(&mut ws).unwrap();
        fs::write(ws.ward_dir().join("graph.json"), graph_json).unwrap();
        fs::write(ws.abs_path("a.py"), "def main(): pass\n").unwrap();

        let outcome = engine.learn(&ws, "a.py", KnowledgeFacts::default()).unwrap();
        assert_eq!(outcome.record.module.unwrap().interfaces, vec!["main".to_string()]);

        let (_, freshness) = engine.recall(&ws, "a.py").unwrap();
        assert_eq!(freshness, Freshness::Fresh);
        assert!(matches!(engine.recall(&ws, "b.py"), Err(WardError::KnowledgeNotFound(_))));
    }

    #[test]
    fn test_start_run_blocked_by_preflight() {
        let (_temp, ws, engine) = setup();
        fs::write(ws.abs_path("a.py"), "x").unwrap();
        let options = StartRunOptions {
            strict: true,
            refactor: true,
            ..StartRunOptions::default()
        };

        let err = engine
            .start_run(&ws, "refactor a", vec![StepPlan::new("s", &["a.py"])], &options)
            .unwrap_err();
        match err {
            WardError::Blocked { blockers } => {
                assert_eq!(blockers, vec!["no learned knowledge for file a.py".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(engine.show_run(&ws).is_err());

        let skip = StartRunOptions {
            skip_preflight: true,
            ..options
        };
        assert!(engine
            .start_run(&ws, "refactor a", vec![StepPlan::new("s", &["a.py"])], &skip)
            .is_ok());
    }

    #[test]
    fn test_plain_run_ignores_files_to_be_created() {
        let (_temp, ws, engine) = setup();
        let run = engine
            .start_run(
                &ws,
                "add module",
                vec![StepPlan::new("create", &["new.rs"])],
                &StartRunOptions::default(),
            )
            .unwrap();
        assert_eq!(run.steps.len(), 1);
    }

    #[test]
    fn test_retry_budget_surfaces_through_engine() {
        let temp = TempDir::new().unwrap();
        let engine =
            WardEngine::from_global_config(GlobalConfig::default()).with_verifier(Arc::new(AlwaysFail));
        let mut ws = engine.resolve_workspace(temp.path()).unwrap();
        engine.init_workspace(&mut ws).unwrap();

        engine
            .start_run(
                &ws,
                "two steps",
                vec![StepPlan::new("one", &["a.rs"]), StepPlan::new("two", &["b.rs"])],
                &StartRunOptions { retry_budget: Some(2), ..StartRunOptions::default() },
            )
            .unwrap();

        let mut last = None;
        for _ in 0..3 {
            engine.begin_step(&ws, 0).unwrap();
            last = Some(engine.complete_step(&ws, &[], None));
        }
        assert!(matches!(last, Some(Err(WardError::RetryBudgetExhausted { .. }))));
    }

    #[test]
    fn test_gc_keeps_live_snapshots() {
        let (_temp, ws, engine) = setup();
        fs::write(ws.abs_path("a.txt"), "original").unwrap();
        let fix = engine.start_quickfix(&ws, "a.txt").unwrap();
        SnapshotStore::new(&ws.snapshots_dir()).store(b"orphan").unwrap();

        let summary = engine.gc(&ws, Some(Duration::ZERO), false).unwrap();
        assert_eq!(summary.removed, 1);
        assert!(SnapshotStore::new(&ws.snapshots_dir()).exists(&fix.snapshot.unwrap()));
    }

    #[test]
    fn test_doctor_reports_unreadable_and_clear_stale_fixes_it() {
        let (_temp, ws, engine) = setup();
        fs::write(ws.run_path(), "not json").unwrap();
        fs::write(ws.quickfix_path(), "{").unwrap();

        let report = engine.doctor(&ws).unwrap();
        assert_eq!(report.problems.len(), 2);
        assert!(engine.gc(&ws, None, true).is_err());

        let summary = engine.clear_stale(&ws, false).unwrap();
        assert!(summary.quarantined_run.is_some());
        assert!(summary.discarded_quickfix);
        assert!(engine.doctor(&ws).unwrap().is_healthy());
    }

    #[test]
    fn test_custom_graph_feeds_preflight() {
        let temp = TempDir::new().unwrap();
        let engine = WardEngine::from_global_config(GlobalConfig::default())
            .with_graph(Arc::new(EdgeListGraph::from_edges([("app.py", "lib.py")])));
        let mut ws = engine.resolve_workspace(temp.path()).unwrap();
        engine.init_workspace(&mut ws).unwrap();
        fs::write(ws.abs_path("lib.py"), "").unwrap();

        let report = engine
            .preflight(&ws, &keys(&["lib.py"]), OperationKind::Modify, false)
            .unwrap();
        assert_eq!(report.impact_set, keys(&["app.py"]));
    }

    #[test]
    fn test_status_summarizes_state() {
        let (_temp, ws, engine) = setup();
        fs::write(ws.abs_path("a.py"), "v1").unwrap();
        engine.learn(&ws, "a.py", KnowledgeFacts::default()).unwrap();
        fs::write(ws.abs_path("a.py"), "v2").unwrap();

        let status = engine.status(&ws).unwrap();
        assert!(status.initialized);
        assert_eq!(status.knowledge_files, 1);
        assert_eq!(status.stale_files, keys(&["a.py"]));
        assert!(status.run.is_none());
    }
}
