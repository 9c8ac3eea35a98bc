//! Preflight readiness gate.
//!
//! [`check`] decides whether a set of files is ready for an edit operation.
//! It is a pure read over the filesystem and the knowledge store: every check
//! runs, every blocker is collected, and nothing is written. Persisting the
//! report to `preflight.json` is the engine's (advisory) concern.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::WardError;
use crate::graph::DependencyGraph;
use crate::knowledge::{Freshness, KnowledgeStore};
use crate::workspace::Workspace;

/// The kind of edit being prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Change existing files in place.
    Modify,
    /// Restructure code across files; requires up-to-date knowledge.
    Refactor,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Modify => write!(f, "modify"),
            Self::Refactor => write!(f, "refactor"),
        }
    }
}

impl FromStr for OperationKind {
    type Err = WardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "modify" => Ok(Self::Modify),
            "refactor" => Ok(Self::Refactor),
            _ => Err(WardError::InvalidArgument(format!(
                "Unknown operation kind '{}'. Use 'modify' or 'refactor'.",
                s
            ))),
        }
    }
}

/// Readiness verdict for one preflight invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    /// True iff `blockers` is empty.
    pub ready: bool,
    pub operation: OperationKind,
    pub strict: bool,
    /// Target files, as project-relative keys.
    pub files: Vec<String>,
    /// Blocker descriptions, in check order.
    pub blockers: Vec<String>,
    /// Non-blocking findings (stale knowledge for a plain modify).
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Files transitively dependent on the targets. Informational only.
    pub impact_set: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Blocker text for a missing target file.
pub fn missing_file_blocker(path: &str) -> String {
    format!("file not found: {}", path)
}

/// Blocker text for a file without knowledge under strict refactor.
pub fn no_knowledge_blocker(path: &str) -> String {
    format!("no learned knowledge for file {}", path)
}

/// Blocker (or warning) text for stale knowledge.
pub fn stale_knowledge_blocker(path: &str) -> String {
    format!("knowledge stale for file {}, re-learn required", path)
}

/// Run all readiness checks for `files`.
///
/// 1. `modify`: every file must exist.
/// 2. `refactor` + `strict`: every file must have a knowledge record.
/// 3. Every file with a record must be fresh. Staleness blocks under
///    `strict` or `refactor`; for a plain non-strict modify it is a warning.
/// 4. The impact set is attached; it never blocks.
pub fn check(
    workspace: &Workspace,
    knowledge: &KnowledgeStore,
    graph: &dyn DependencyGraph,
    files: &[String],
    operation: OperationKind,
    strict: bool,
) -> Result<PreflightReport, WardError> {
    let mut blockers = Vec::new();
    let mut warnings = Vec::new();

    if operation == OperationKind::Modify {
        for file in files {
            if !workspace.abs_path(file).is_file() {
                blockers.push(missing_file_blocker(file));
            }
        }
    }

    let staleness_blocks = strict || operation == OperationKind::Refactor;

    for file in files {
        let freshness = match knowledge.freshness(file) {
            Ok(f) => f,
            Err(WardError::Json(e)) => {
                blockers.push(format!("knowledge record for {} is unreadable: {}", file, e));
                continue;
            }
            Err(e) => return Err(e),
        };

        match freshness {
            None => {
                if operation == OperationKind::Refactor && strict {
                    blockers.push(no_knowledge_blocker(file));
                }
            }
            Some(Freshness::Fresh) => {}
            Some(Freshness::Stale) | Some(Freshness::Missing) => {
                if staleness_blocks {
                    blockers.push(stale_knowledge_blocker(file));
                } else {
                    warnings.push(stale_knowledge_blocker(file));
                }
            }
        }
    }

    let impact_set: Vec<String> = graph.impact_set(files).into_iter().collect();

    let report = PreflightReport {
        ready: blockers.is_empty(),
        operation,
        strict,
        files: files.to_vec(),
        blockers,
        warnings,
        impact_set,
        checked_at: Utc::now(),
    };

    tracing::debug!(
        ready = report.ready,
        blockers = report.blockers.len(),
        impact = report.impact_set.len(),
        "preflight {} complete",
        operation
    );
    Ok(report)
}
