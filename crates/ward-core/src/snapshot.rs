//! Content-addressed snapshot store.
//!
//! Whole-file byte captures live in `.ward/snapshots/` under a 2-character
//! prefix directory scheme, keyed by the SHA-256 of their content. Blobs are
//! immutable once written and shared by every owner that references them
//! (run edit records, run baselines, quick-fix state, knowledge versions).
//!
//! Nothing is ever deleted implicitly. [`SnapshotStore::collect_garbage`] is
//! the only removal path, and it skips anything in the caller's live set or
//! younger than the grace window. Storing an existing blob refreshes its
//! mtime, which restarts that window.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::errors::WardError;
use crate::fsutil::{atomic_write, remove_if_exists};
use crate::hash::{fingerprint, is_fingerprint};

// ============================================================================
// SnapshotId
// ============================================================================

/// Content hash identifying a snapshot blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Id of the given content.
    pub fn of(data: &[u8]) -> Self {
        Self(fingerprint(data))
    }

    /// Get the full hash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for display.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = WardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_fingerprint(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(WardError::InvalidArgument(format!(
                "`{}` is not a snapshot id (expected 64 lowercase hex characters)",
                s
            )))
        }
    }
}

// ============================================================================
// GcSummary
// ============================================================================

/// Outcome of a garbage-collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcSummary {
    /// Blobs examined.
    pub scanned: u64,
    /// Blobs removed (or that would be removed in a dry run).
    pub removed: u64,
    /// Bytes freed by removed blobs.
    pub bytes_freed: u64,
    /// Blobs kept because live state references them.
    pub kept_live: u64,
    /// Unreferenced blobs kept because they are inside the grace window.
    pub kept_recent: u64,
    /// Whether this was a dry run.
    pub dry_run: bool,
}

// ============================================================================
// SnapshotStore
// ============================================================================

/// The snapshot store rooted at `.ward/snapshots/`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Create a store rooted at the given directory.
    pub fn new(snapshots_dir: &Path) -> Self {
        Self {
            root: snapshots_dir.to_path_buf(),
        }
    }

    /// Store bytes and return their id.
    ///
    /// An existing blob is not rewritten; its mtime is refreshed instead.
    pub fn store(&self, data: &[u8]) -> Result<SnapshotId, WardError> {
        let id = SnapshotId::of(data);
        let path = self.blob_path(&id)?;

        if path.exists() {
            touch(&path)?;
            return Ok(id);
        }

        atomic_write(&path, data)?;
        tracing::debug!("Stored snapshot {} ({} bytes)", id.short(), data.len());
        Ok(id)
    }

    /// Capture a file's current bytes. `None` when the file does not exist.
    pub fn capture(&self, file: &Path) -> Result<Option<SnapshotId>, WardError> {
        match fs::read(file) {
            Ok(bytes) => Ok(Some(self.store(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load a blob, verifying its content against the id.
    ///
    /// # Errors
    ///
    /// Returns [`WardError::StaleState`] when the blob is missing or corrupt.
    pub fn load(&self, id: &SnapshotId) -> Result<Vec<u8>, WardError> {
        let path = self.blob_path(id)?;
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WardError::StaleState(format!(
                    "snapshot {} no longer exists",
                    id
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if SnapshotId::of(&data) != *id {
            return Err(WardError::StaleState(format!(
                "snapshot {} is corrupt (content hash mismatch)",
                id
            )));
        }
        Ok(data)
    }

    /// Check whether a blob exists.
    pub fn exists(&self, id: &SnapshotId) -> bool {
        self.blob_path(id).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Put `target` back to a captured state.
    ///
    /// `Some(id)` writes the blob's bytes atomically; `None` means the file
    /// did not exist at capture time, so it is removed.
    pub fn restore(&self, snapshot: Option<&SnapshotId>, target: &Path) -> Result<(), WardError> {
        match snapshot {
            Some(id) => {
                let data = self.load(id)?;
                atomic_write(target, &data)?;
                tracing::debug!("Restored {} from snapshot {}", target.display(), id.short());
            }
            None => {
                if remove_if_exists(target)? {
                    tracing::debug!("Removed {} (absent at capture time)", target.display());
                }
            }
        }
        Ok(())
    }

    /// Remove blobs that are neither live nor younger than `grace`.
    ///
    /// The caller is responsible for computing `live` while holding the locks
    /// of every state file that can reference snapshots.
    pub fn collect_garbage(
        &self,
        live: &HashSet<SnapshotId>,
        grace: Duration,
        dry_run: bool,
    ) -> Result<GcSummary, WardError> {
        let mut summary = GcSummary {
            dry_run,
            ..GcSummary::default()
        };

        if !self.root.is_dir() {
            return Ok(summary);
        }

        let cutoff = SystemTime::now()
            .checked_sub(grace)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().into_owned();

            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let metadata = entry.metadata()?;
                let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());

                // Leftover temp files from interrupted writes.
                if name.starts_with('.') {
                    if modified < cutoff && !dry_run {
                        let _ = fs::remove_file(entry.path());
                    }
                    continue;
                }

                summary.scanned += 1;
                let id = match format!("{}{}", prefix, name).parse::<SnapshotId>() {
                    Ok(id) => id,
                    Err(_) => {
                        tracing::warn!("Ignoring unexpected file in snapshot store: {}", entry.path().display());
                        continue;
                    }
                };

                if live.contains(&id) {
                    summary.kept_live += 1;
                    continue;
                }
                if modified > cutoff {
                    summary.kept_recent += 1;
                    continue;
                }

                if !dry_run {
                    fs::remove_file(entry.path())?;
                }
                summary.removed += 1;
                summary.bytes_freed += metadata.len();
            }

            if !dry_run && fs::read_dir(shard.path())?.next().is_none() {
                let _ = fs::remove_dir(shard.path());
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            removed = summary.removed,
            bytes_freed = summary.bytes_freed,
            dry_run,
            "snapshot gc complete"
        );
        Ok(summary)
    }

    /// Filesystem path for a blob: `ab/cdef...`.
    fn blob_path(&self, id: &SnapshotId) -> Result<PathBuf, WardError> {
        if !is_fingerprint(id.as_str()) {
            return Err(WardError::StaleState(format!(
                "malformed snapshot id `{}` in state",
                id.as_str()
            )));
        }
        let (prefix, rest) = id.as_str().split_at(2);
        Ok(self.root.join(prefix).join(rest))
    }
}

fn touch(path: &Path) -> Result<(), WardError> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(SystemTime::now())?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
