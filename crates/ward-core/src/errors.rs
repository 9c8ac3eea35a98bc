//! Error types for ward-core.

use thiserror::Error;

/// Coarse classification of a [`WardError`].
///
/// Callers (the CLI in particular) use this to pick a distinguishable exit
/// code without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid operation for the current state or bad input. State unchanged.
    User,
    /// Preflight or write-gate denial, recoverable by satisfying the blockers.
    Blocked,
    /// The operation needs an active run or quick-fix and there is none.
    NoActiveState,
    /// Persisted state references something that no longer resolves.
    StaleState,
    /// Verification failed for the current step; the step can be retried.
    Verification,
    /// A step failed more often than its retry budget allows.
    RetryBudget,
    /// Local disk I/O or serialization failure.
    Io,
}

/// Domain-specific errors for ward operations.
#[derive(Error, Debug)]
pub enum WardError {
    /// The project has not been initialized with `ward init`.
    #[error("Project not initialized. Run `ward init`.")]
    NotInitialized,

    /// Global configuration file is invalid.
    #[error("Global config invalid: {0}")]
    InvalidGlobalConfig(String),

    /// Project configuration is invalid.
    #[error("Project config invalid: {0}")]
    InvalidProjectConfig(String),

    /// A configuration value is invalid.
    #[error("Invalid configuration: {message}. {hint}")]
    InvalidConfiguration {
        /// Description of the invalid configuration.
        message: String,
        /// Actionable hint on how to fix it.
        hint: String,
    },

    /// A path or file was not found.
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// An invalid path was provided (disk root, escapes the project, ...).
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid argument provided to an operation.
    #[error("{0}")]
    InvalidArgument(String),

    /// The named project is not present in the registry.
    #[error("Project `{0}` is not registered. Run `ward register {0}` from its root.")]
    ProjectNotRegistered(String),

    /// A run is already active for this project.
    #[error("Run {id} is already active (goal: {goal}). Complete or abort it first.")]
    RunAlreadyActive {
        /// Identifier of the active run.
        id: String,
        /// Goal of the active run.
        goal: String,
    },

    /// A quick-fix is already active for this project.
    #[error("Quick-fix on `{path}` is already active. Run `ward quickfix done` or `ward quickfix cancel` first.")]
    QuickFixAlreadyActive {
        /// Target file of the active quick-fix.
        path: String,
    },

    /// No run is active.
    #[error("No active run.")]
    NoActiveRun,

    /// No quick-fix is active.
    #[error("No active quick-fix.")]
    NoActiveQuickFix,

    /// The requested transition is not valid from the current state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The file is not part of the in-progress step.
    #[error("File `{path}` is not a target of step {step}.")]
    FileNotInStep {
        /// Project-relative path.
        path: String,
        /// 1-based step number.
        step: usize,
    },

    /// The live file content does not match what the caller expected.
    #[error("Content of `{0}` changed since it was read; re-read the file and retry.")]
    ContentMismatch(String),

    /// No knowledge has been learned for the file.
    #[error("No learned knowledge for file {0}")]
    KnowledgeNotFound(String),

    /// Preflight or the write gate refused the operation.
    #[error("Blocked: {}", blockers.join("; "))]
    Blocked {
        /// Human-readable blocker descriptions, in check order.
        blockers: Vec<String>,
    },

    /// Persisted state refers to a snapshot or record that no longer resolves.
    ///
    /// Requires manual cleanup (`ward doctor`, `ward clear-stale`); the
    /// offending state is never discarded implicitly.
    #[error("Stale state: {0}")]
    StaleState(String),

    /// Verification failed for a step. The step is marked failed and may be retried.
    #[error("Verification failed for step {step}: {details}")]
    VerificationFailed {
        /// 1-based step number.
        step: usize,
        /// Output reported by the verifier.
        details: String,
    },

    /// A step failed verification more times than the retry budget allows.
    #[error("Step {step} failed verification {attempts} times (retry budget {budget}). Abort the run or force-complete the step.")]
    RetryBudgetExhausted {
        /// 1-based step number.
        step: usize,
        /// Failed attempts so far.
        attempts: u32,
        /// Configured retry budget.
        budget: u32,
    },

    /// Timed out waiting for a state file lock.
    #[error("Timed out waiting for lock {0}; another ward process is mutating this state.")]
    LockTimeout(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl WardError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Blocked { .. } => ErrorKind::Blocked,
            Self::NoActiveRun | Self::NoActiveQuickFix => ErrorKind::NoActiveState,
            Self::StaleState(_) => ErrorKind::StaleState,
            Self::VerificationFailed { .. } => ErrorKind::Verification,
            Self::RetryBudgetExhausted { .. } => ErrorKind::RetryBudget,
            Self::Io(_) | Self::Json(_) | Self::Yaml(_) | Self::LockTimeout(_) => ErrorKind::Io,
            _ => ErrorKind::User,
        }
    }
}
