//! Versioned knowledge store.
//!
//! Each learned file gets one JSON record in `.ward/knowledge/`, named by the
//! hash of its project-relative path. A record carries the extracted facts
//! plus an ordered list of versions; every version points at a full snapshot
//! of the file as it was when learned.
//!
//! Freshness is never repaired implicitly: [`KnowledgeStore::recall`] returns
//! what was stored, and staleness is only surfaced through
//! [`KnowledgeStore::freshness`] / [`KnowledgeStore::is_stale`].

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::KNOWLEDGE_LOCK;
use crate::errors::WardError;
use crate::fsutil::{read_json, read_optional, remove_if_exists, write_json};
use crate::graph::ModuleFacts;
use crate::hash::{file_fingerprint, fingerprint};
use crate::lock::StateLock;
use crate::snapshot::{SnapshotId, SnapshotStore};
use crate::vcs::current_revision;
use crate::workspace::Workspace;

// ============================================================================
// Types
// ============================================================================

/// Facts extracted from a file by the assistant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeFacts {
    /// Short summary of the file.
    #[serde(default)]
    pub summary: String,
    /// Why the file exists.
    #[serde(default)]
    pub purpose: String,
    /// Exported symbol name -> description.
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    /// Things to watch out for when editing the file.
    #[serde(default)]
    pub caveats: Vec<String>,
}

/// One learned version of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeVersion {
    /// Strictly increasing per file, starting at 1.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    /// Revision-control state at learn time (opaque).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcs_ref: Option<String>,
    /// Fingerprint of the file bytes at this version.
    pub fingerprint: String,
    /// Full content snapshot at this version.
    pub snapshot: SnapshotId,
}

/// Everything ward knows about one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeRecord {
    /// Project-relative path.
    pub path: String,
    #[serde(flatten)]
    pub facts: KnowledgeFacts,
    /// Fingerprint of the content the current facts describe.
    pub fingerprint: String,
    /// Parser facts from the dependency graph, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<ModuleFacts>,
    pub versions: Vec<KnowledgeVersion>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeRecord {
    /// The newest version. Records always have at least one.
    pub fn latest(&self) -> Option<&KnowledgeVersion> {
        self.versions.last()
    }

    /// Current version number (0 for a malformed record without versions).
    pub fn current_version(&self) -> u32 {
        self.latest().map(|v| v.version).unwrap_or(0)
    }
}

/// Freshness of a learned file against the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Live bytes match the latest version.
    Fresh,
    /// Live bytes differ from the latest version.
    Stale,
    /// The file no longer exists.
    Missing,
}

impl Freshness {
    /// Stale or missing.
    pub fn is_stale(&self) -> bool {
        !matches!(self, Self::Fresh)
    }
}

impl std::fmt::Display for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Stale => write!(f, "stale"),
            Self::Missing => write!(f, "missing"),
        }
    }
}

/// Result of [`KnowledgeStore::learn`].
#[derive(Debug, Clone)]
pub struct LearnOutcome {
    pub record: KnowledgeRecord,
    /// Whether a new version was appended (false when content was unchanged).
    pub appended: bool,
}

// ============================================================================
// KnowledgeStore
// ============================================================================

/// Knowledge records for one project.
#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    dir: PathBuf,
    locks_dir: PathBuf,
    workspace: Workspace,
    snapshots: SnapshotStore,
    lock_timeout: Duration,
}

impl KnowledgeStore {
    pub fn new(workspace: &Workspace, snapshots: SnapshotStore, lock_timeout: Duration) -> Self {
        Self {
            dir: workspace.knowledge_dir(),
            locks_dir: workspace.locks_dir(),
            workspace: workspace.clone(),
            snapshots,
            lock_timeout,
        }
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint(key.as_bytes())))
    }

    /// Learn (or re-learn) a file.
    ///
    /// Creates the record at version 1, appends a version when the content
    /// changed since the latest one, and otherwise only refreshes the facts.
    ///
    /// # Errors
    ///
    /// Returns [`WardError::PathNotFound`] if the file does not exist.
    pub fn learn(
        &self,
        key: &str,
        facts: KnowledgeFacts,
        module: Option<ModuleFacts>,
    ) -> Result<LearnOutcome, WardError> {
        let _lock = StateLock::acquire(&self.locks_dir, KNOWLEDGE_LOCK, self.lock_timeout)?;

        let abs = self.workspace.abs_path(key);
        let bytes = read_optional(&abs)?.ok_or_else(|| WardError::PathNotFound(key.to_string()))?;
        let live = fingerprint(&bytes);
        let now = Utc::now();
        let path = self.record_path(key);

        let existing: Option<KnowledgeRecord> = read_json(&path)?;

        if let Some(mut record) = existing.clone() {
            if record.latest().map(|v| v.fingerprint.as_str()) == Some(live.as_str()) {
                record.facts = facts;
                if module.is_some() {
                    record.module = module;
                }
                record.updated_at = now;
                write_json(&path, &record)?;
                tracing::debug!("Refreshed facts for {} (v{} unchanged)", key, record.current_version());
                return Ok(LearnOutcome {
                    record,
                    appended: false,
                });
            }
        }

        let snapshot = self.snapshots.store(&bytes)?;
        let version = KnowledgeVersion {
            version: existing.as_ref().map(|r| r.current_version() + 1).unwrap_or(1),
            created_at: now,
            vcs_ref: current_revision(self.workspace.root()),
            fingerprint: live.clone(),
            snapshot,
        };

        let record = match existing {
            Some(mut record) => {
                record.facts = facts;
                if module.is_some() {
                    record.module = module;
                }
                record.fingerprint = live;
                record.versions.push(version);
                record.updated_at = now;
                record
            }
            None => KnowledgeRecord {
                path: key.to_string(),
                facts,
                fingerprint: live,
                module,
                versions: vec![version],
                updated_at: now,
            },
        };

        write_json(&path, &record)?;
        tracing::info!("Learned {} (v{})", key, record.current_version());
        Ok(LearnOutcome {
            record,
            appended: true,
        })
    }

    /// Get the stored record for a file. Never refreshes anything.
    pub fn recall(&self, key: &str) -> Result<Option<KnowledgeRecord>, WardError> {
        read_json(&self.record_path(key))
    }

    /// Compare live bytes with the latest version. `None` if never learned.
    pub fn freshness(&self, key: &str) -> Result<Option<Freshness>, WardError> {
        let Some(record) = self.recall(key)? else {
            return Ok(None);
        };
        Ok(Some(Self::freshness_of(&record, &self.workspace.abs_path(key))?))
    }

    fn freshness_of(record: &KnowledgeRecord, abs: &Path) -> Result<Freshness, WardError> {
        let stored = record.latest().map(|v| v.fingerprint.as_str());
        Ok(match file_fingerprint(abs)? {
            None => Freshness::Missing,
            Some(live) if Some(live.as_str()) == stored => Freshness::Fresh,
            Some(_) => Freshness::Stale,
        })
    }

    /// True if the file changed since it was learned, or no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`WardError::KnowledgeNotFound`] if the file was never learned.
    pub fn is_stale(&self, key: &str) -> Result<bool, WardError> {
        self.freshness(key)?
            .map(|f| f.is_stale())
            .ok_or_else(|| WardError::KnowledgeNotFound(key.to_string()))
    }

    /// All records with their freshness, sorted by path.
    ///
    /// Unreadable record files are skipped with a warning; `ward doctor`
    /// reports them.
    pub fn list(&self) -> Result<Vec<(KnowledgeRecord, Freshness)>, WardError> {
        let mut out = Vec::new();
        for (file, parsed) in self.scan()? {
            match parsed {
                Ok(record) => {
                    let freshness =
                        Self::freshness_of(&record, &self.workspace.abs_path(&record.path))?;
                    out.push((record, freshness));
                }
                Err(e) => tracing::warn!("Skipping unreadable knowledge record {}: {}", file.display(), e),
            }
        }
        out.sort_by(|a, b| a.0.path.cmp(&b.0.path));
        Ok(out)
    }

    /// Manually delete a record. Snapshots stay until the next GC.
    pub fn purge(&self, key: &str) -> Result<bool, WardError> {
        let _lock = StateLock::acquire(&self.locks_dir, KNOWLEDGE_LOCK, self.lock_timeout)?;
        let removed = remove_if_exists(&self.record_path(key))?;
        if removed {
            tracing::info!("Purged knowledge for {}", key);
        }
        Ok(removed)
    }

    /// Every snapshot referenced by any version of any record.
    pub fn referenced_snapshots(&self) -> Result<HashSet<SnapshotId>, WardError> {
        let mut live = HashSet::new();
        for (file, parsed) in self.scan()? {
            match parsed {
                Ok(record) => live.extend(record.versions.into_iter().map(|v| v.snapshot)),
                // An unreadable record may still reference blobs; refuse to
                // collect rather than guess.
                Err(e) => {
                    return Err(WardError::StaleState(format!(
                        "knowledge record {} is unreadable ({}); fix or remove it before collecting snapshots",
                        file.display(),
                        e
                    )))
                }
            }
        }
        Ok(live)
    }

    /// Integrity problems: unreadable records and versions whose snapshot is gone.
    pub fn integrity_problems(&self) -> Result<Vec<String>, WardError> {
        let mut problems = Vec::new();
        for (file, parsed) in self.scan()? {
            match parsed {
                Ok(record) => {
                    if record.versions.is_empty() {
                        problems.push(format!("knowledge for {} has no versions", record.path));
                    }
                    for version in &record.versions {
                        if !self.snapshots.exists(&version.snapshot) {
                            problems.push(format!(
                                "knowledge for {} v{} references missing snapshot {}",
                                record.path,
                                version.version,
                                version.snapshot.short()
                            ));
                        }
                    }
                }
                Err(e) => problems.push(format!(
                    "knowledge record {} is unreadable: {}",
                    file.display(),
                    e
                )),
            }
        }
        Ok(problems)
    }

    fn scan(&self) -> Result<Vec<(PathBuf, Result<KnowledgeRecord, WardError>)>, WardError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_record = path.extension().map_or(false, |e| e == "json")
                && !path
                    .file_name()
                    .map_or(true, |n| n.to_string_lossy().starts_with('.'));
            if !is_record {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(WardError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(WardError::from));
            out.push((path, parsed));
        }
        Ok(out)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Workspace, KnowledgeStore) {
        let temp = TempDir::new().unwrap();
        let mut ws = Workspace::from_root(temp.path()).unwrap();
        ws.create_layout().unwrap();
        let store = KnowledgeStore::new(
            &ws,
            SnapshotStore::new(&ws.snapshots_dir()),
            Duration::from_secs(1),
        );
        (temp, ws, store)
    }

    fn facts(summary: &str) -> KnowledgeFacts {
        KnowledgeFacts {
            summary: summary.to_string(),
            purpose: "testing".to_string(),
            exports: [("main".to_string(), "entry point".to_string())].into_iter().collect(),
            caveats: vec!["keeps global state".to_string()],
        }
    }

    #[test]
    fn test_learn_creates_version_one() {
        let (_temp, ws, store) = setup();
        fs::write(ws.abs_path("a.py"), "print('a')\n").unwrap();

        let outcome = store.learn("a.py", facts("first"), None).unwrap();
        assert!(outcome.appended);
        assert_eq!(outcome.record.current_version(), 1);
        assert_eq!(outcome.record.fingerprint, fingerprint(b"print('a')\n"));
        assert_eq!(store.freshness("a.py").unwrap(), Some(Freshness::Fresh));
    }

    #[test]
    fn test_learn_twice_unchanged_is_idempotent() {
        let (_temp, ws, store) = setup();
        fs::write(ws.abs_path("a.py"), "x = 1\n").unwrap();

        store.learn("a.py", facts("first"), None).unwrap();
        let second = store.learn("a.py", facts("second"), None).unwrap();

        assert!(!second.appended);
        assert_eq!(second.record.versions.len(), 1);
        assert_eq!(second.record.facts.summary, "second");
        assert_eq!(store.recall("a.py").unwrap().unwrap().versions.len(), 1);
    }

    #[test]
    fn test_relearn_after_change_appends_version() {
        let (_temp, ws, store) = setup();
        let abs = ws.abs_path("a.py");
        fs::write(&abs, "v1").unwrap();
        store.learn("a.py", facts("v1"), None).unwrap();

        fs::write(&abs, "v2").unwrap();
        let outcome = store.learn("a.py", facts("v2"), None).unwrap();

        assert!(outcome.appended);
        let versions: Vec<u32> = outcome.record.versions.iter().map(|v| v.version).collect();
        assert_eq!(versions, vec![1, 2]);

        // The first version's snapshot still holds the old bytes.
        let snaps = SnapshotStore::new(&ws.snapshots_dir());
        assert_eq!(snaps.load(&outcome.record.versions[0].snapshot).unwrap(), b"v1");
    }

    #[test]
    fn test_external_change_makes_record_stale() {
        let (_temp, ws, store) = setup();
        let abs = ws.abs_path("a.py");
        fs::write(&abs, "original").unwrap();
        store.learn("a.py", facts("x"), None).unwrap();

        fs::write(&abs, "changed underneath").unwrap();
        assert!(store.is_stale("a.py").unwrap());

        // Recall does not repair staleness.
        let record = store.recall("a.py").unwrap().unwrap();
        assert_eq!(record.fingerprint, fingerprint(b"original"));
        assert!(store.is_stale("a.py").unwrap());
    }

    #[test]
    fn test_missing_file_is_stale() {
        let (_temp, ws, store) = setup();
        let abs = ws.abs_path("gone.py");
        fs::write(&abs, "soon gone").unwrap();
        store.learn("gone.py", facts("x"), None).unwrap();
        fs::remove_file(&abs).unwrap();

        assert_eq!(store.freshness("gone.py").unwrap(), Some(Freshness::Missing));
        assert!(store.is_stale("gone.py").unwrap());
    }

    #[test]
    fn test_unlearned_file() {
        let (_temp, _ws, store) = setup();
        assert!(store.recall("nope.py").unwrap().is_none());
        assert!(matches!(
            store.is_stale("nope.py"),
            Err(WardError::KnowledgeNotFound(_))
        ));
    }

    #[test]
    fn test_learn_missing_file_fails() {
        let (_temp, _ws, store) = setup();
        assert!(matches!(
            store.learn("nope.py", facts("x"), None),
            Err(WardError::PathNotFound(_))
        ));
    }

    #[test]
    fn test_list_and_purge() {
        let (_temp, ws, store) = setup();
        fs::write(ws.abs_path("b.rs"), "b").unwrap();
        fs::write(ws.abs_path("a.rs"), "a").unwrap();
        store.learn("b.rs", facts("b"), None).unwrap();
        store.learn("a.rs", facts("a"), None).unwrap();

        let listed: Vec<String> = store.list().unwrap().into_iter().map(|(r, _)| r.path).collect();
        assert_eq!(listed, vec!["a.rs".to_string(), "b.rs".to_string()]);

        assert!(store.purge("a.rs").unwrap());
        assert!(!store.purge("a.rs").unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_module_facts_kept_when_not_supplied() {
        let (_temp, ws, store) = setup();
        fs::write(ws.abs_path("m.rs"), "m").unwrap();
        let module = ModuleFacts {
            interfaces: vec!["run".into()],
            imports: vec![],
            line_count: 1,
        };
        store.learn("m.rs", facts("m"), Some(module.clone())).unwrap();
        let again = store.learn("m.rs", facts("m2"), None).unwrap();
        assert_eq!(again.record.module, Some(module));
    }

    #[test]
    fn test_integrity_problems_report_missing_snapshot() {
        let (_temp, ws, store) = setup();
        fs::write(ws.abs_path("a.rs"), "a").unwrap();
        let record = store.learn("a.rs", facts("a"), None).unwrap().record;
        let snap = &record.versions[0].snapshot;
        let blob = ws
            .snapshots_dir()
            .join(&snap.as_str()[..2])
            .join(&snap.as_str()[2..]);
        fs::remove_file(blob).unwrap();

        let problems = store.integrity_problems().unwrap();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("missing snapshot"));
    }
}
