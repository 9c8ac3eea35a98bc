//! Common constants used throughout ward-core.
//!
//! This module centralizes directory names, file names, and default
//! configuration values so the on-disk layout is defined in one place.

// ============================================================================
// Directory Names
// ============================================================================

/// The name of the ward state directory within a project.
///
/// All ward-managed data lives under `.ward/` at the project root.
pub const WARD_DIR: &str = ".ward";

/// Subdirectory holding one JSON record per learned file.
pub const KNOWLEDGE_DIR: &str = "knowledge";

/// Subdirectory holding content-addressed snapshot blobs.
///
/// Layout: `.ward/snapshots/{first 2 hex}/{remaining hex}`
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// Subdirectory holding archived runs and quick-fix history.
pub const HISTORY_DIR: &str = "history";

/// Subdirectory holding advisory lock files.
pub const LOCKS_DIR: &str = "locks";

/// The name of the global ward configuration directory (`~/.ward`).
pub const WARD_HOME_DIR: &str = ".ward";

// ============================================================================
// State Files
// ============================================================================

/// Active run record. Absent when no run is active.
pub const RUN_FILENAME: &str = "run.json";

/// Active quick-fix record. Absent when no quick-fix is active.
pub const QUICKFIX_FILENAME: &str = "quickfix.json";

/// Last computed preflight report (advisory only).
pub const PREFLIGHT_FILENAME: &str = "preflight.json";

/// Append-only log of finished quick-fixes, under `history/`.
pub const QUICKFIX_HISTORY_FILENAME: &str = "quickfix.jsonl";

/// Archived runs, under `history/`.
pub const RUN_HISTORY_DIR: &str = "runs";

/// Default dependency graph file, relative to `.ward/`.
pub const GRAPH_FILENAME: &str = "graph.json";

// ============================================================================
// Lock Names
// ============================================================================

/// Lock guarding `run.json`.
pub const RUN_LOCK: &str = "run";

/// Lock guarding `quickfix.json`.
pub const QUICKFIX_LOCK: &str = "quickfix";

/// Lock guarding the knowledge directory.
pub const KNOWLEDGE_LOCK: &str = "knowledge";

// ============================================================================
// Configuration
// ============================================================================

/// The name of the global configuration file.
pub const GLOBAL_CONFIG_FILENAME: &str = "config.yaml";

/// The name of the project-level configuration file (inside `.ward/`).
pub const PROJECT_CONFIG_FILENAME: &str = "config.yaml";

/// The name of the project registry file (inside `~/.ward/`).
pub const REGISTRY_FILENAME: &str = "registry.yaml";

/// Failed verification attempts tolerated per step.
pub const DEFAULT_RETRY_BUDGET: u32 = 2;

/// Heartbeat age (seconds) after which active state counts as abandoned.
pub const DEFAULT_ABANDON_AFTER_SECS: u64 = 24 * 60 * 60;

/// Minimum age (seconds) of an unreferenced snapshot before GC may remove it.
pub const DEFAULT_SNAPSHOT_GRACE_SECS: u64 = 24 * 60 * 60;

/// How long a state mutation waits for its lock.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Environment variable carrying the touched files to the verify command.
pub const VERIFY_FILES_ENV: &str = "WARD_FILES";

/// Maximum number of bytes of verifier output kept as step details.
pub const VERIFY_DETAILS_MAX_BYTES: usize = 4_000;
