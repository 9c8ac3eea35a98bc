//! # ward-core
//!
//! **Edit guard rails** for assistant-driven code changes – core library.
//!
//! This crate decides whether a file is ready to be changed, tracks multi-step
//! runs and single-file quick-fixes with full rollback, answers the host's
//! write-interception questions, and keeps versioned per-file knowledge.
//! It is designed to be consumed by the `ward` CLI.
//!
//! ## Main Types
//!
//! - [`WardEngine`] – the main entry point for all ward operations
//! - [`Workspace`] – a resolved project and its `.ward/` state directory
//! - [`WardError`] – domain-specific error type
//!
//! ## Modules
//!
//! - [`config`] – configuration types (GlobalConfig, ProjectConfig, Settings)
//! - [`engine`] – the WardEngine implementation
//! - [`preflight`] – readiness checks before an edit
//! - [`run`] – the multi-step run state machine
//! - [`quickfix`] – the single-file quick-fix state machine
//! - [`gate`] – the write-interception decision
//! - [`knowledge`] – versioned per-file knowledge
//! - [`snapshot`] – content-addressed snapshot store
//! - [`graph`], [`verify`], [`registry`] – external collaborators
//!
//! ## Example
//!
//! ```ignore
//! use ward_core::{WardEngine, StepPlan, StartRunOptions};
//! use std::path::Path;
//!
//! let engine = WardEngine::with_defaults()?;
//! let mut workspace = engine.resolve_workspace(Path::new("."))?;
//! engine.init_workspace(&mut workspace)?;
//!
//! let plan = vec![StepPlan::new("extract helper", &["src/util.rs"])];
//! let run = engine.start_run(&workspace, "tidy utils", plan, &StartRunOptions::default())?;
//! engine.begin_step(&workspace, 0)?;
//! ```

// Modules
pub mod config;
pub mod constants;
pub mod engine;
pub mod errors;
pub mod fsutil;
pub mod gate;
pub mod graph;
pub mod hash;
pub mod knowledge;
pub mod lock;
pub mod preflight;
pub mod quickfix;
pub mod registry;
pub mod run;
pub mod snapshot;
pub mod vcs;
pub mod verify;
pub mod workspace;

// Re-exports for convenience
pub use config::{GlobalConfig, GraphConfig, ProjectConfig, Settings, VerifyConfig};
pub use engine::{ClearStaleSummary, DoctorReport, StartRunOptions, StatusReport, WardEngine};
pub use errors::{ErrorKind, WardError};
pub use gate::{Decision, GateRequest, GateResponse};
pub use graph::{DependencyGraph, EdgeListGraph, EmptyGraph, GraphFile, ModuleFacts};
pub use knowledge::{
    Freshness, KnowledgeFacts, KnowledgeRecord, KnowledgeStore, KnowledgeVersion, LearnOutcome,
};
pub use preflight::{OperationKind, PreflightReport};
pub use quickfix::{QuickFixState, QuickFixStatus, QuickFixTracker};
pub use registry::{FileRegistry, ProjectEntry, Registry};
pub use run::{
    AbortSummary, EditRecord, EditSource, FsWriteSink, RunId, RunState, RunStatus, RunTracker,
    Step, StepCompletion, StepPlan, StepStatus, StepVerification, WriteSink,
};
pub use snapshot::{GcSummary, SnapshotId, SnapshotStore};
pub use verify::{CommandVerifier, NoopVerifier, VerificationOutcome, Verifier};
pub use workspace::Workspace;
