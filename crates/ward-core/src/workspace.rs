//! Project detection and path handling.
//!
//! This module provides the [`Workspace`] type which represents a resolved
//! project on disk, including its root path and `.ward` state directory, and
//! the conversion of caller-supplied paths into project-relative keys.

use std::path::{Component, Path, PathBuf};

use crate::constants::{
    HISTORY_DIR, KNOWLEDGE_DIR, LOCKS_DIR, PREFLIGHT_FILENAME, QUICKFIX_FILENAME,
    QUICKFIX_HISTORY_FILENAME, RUN_FILENAME, RUN_HISTORY_DIR, SNAPSHOTS_DIR, WARD_DIR,
};
use crate::errors::WardError;

// ============================================================================
// Helper Functions
// ============================================================================

/// Check if a path is a disk root (e.g., C:\ on Windows, / on Unix).
///
/// Ward refuses to keep state at the root of a filesystem.
fn is_disk_root(path: &Path) -> bool {
    if path.parent().is_some() {
        return false;
    }

    #[cfg(windows)]
    {
        if let Some(s) = path.to_str() {
            if s.len() >= 2 && s.chars().nth(1) == Some(':') {
                return true;
            }
        }
    }

    #[cfg(not(windows))]
    {
        if path == Path::new("/") {
            return true;
        }
    }

    path.canonicalize().ok().map_or(false, |p| p.parent().is_none())
}

/// Resolve `.` and `..` components without touching the filesystem.
///
/// Returns `None` when `..` would climb above the first component.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

/// Canonicalize the longest existing ancestor of `path` and re-append the rest.
///
/// Handles symlinked prefixes (e.g. `/tmp` -> `/private/tmp`) for files that
/// do not exist yet. A dangling symlink has no resolvable target and yields
/// `None`.
fn canonicalize_existing_prefix(path: &Path) -> Option<PathBuf> {
    let mut existing = path;
    let mut rest: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return Some(out);
        }
        if existing.symlink_metadata().is_ok() {
            return None;
        }
        rest.push(existing.file_name()?);
        existing = existing.parent()?;
    }
}

fn key_from_relative(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

// ============================================================================
// Workspace
// ============================================================================

/// A resolved ward project.
///
/// # Example
///
/// ```ignore
/// use ward_core::Workspace;
/// use std::path::Path;
///
/// let workspace = Workspace::from_root(Path::new("/path/to/project"))?;
/// let key = workspace.relative_key(Path::new("src/lib.rs"))?;
/// assert_eq!(key, "src/lib.rs");
/// ```
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Absolute, canonical path to the project root.
    root: PathBuf,

    /// Path to the state directory (`.ward`).
    ward_dir: PathBuf,

    /// Whether a `.git` directory exists at the project root.
    has_git: bool,

    /// Whether `.ward` exists.
    initialized: bool,
}

impl Workspace {
    /// Create a `Workspace` from a root directory path.
    ///
    /// # Errors
    ///
    /// Returns [`WardError::PathNotFound`] if the path does not exist or is not
    /// a directory, and [`WardError::InvalidPath`] for a disk root.
    pub fn from_root(root: &Path) -> Result<Self, WardError> {
        let root = root
            .canonicalize()
            .map_err(|_| WardError::PathNotFound(root.display().to_string()))?;

        if !root.is_dir() {
            return Err(WardError::PathNotFound(root.display().to_string()));
        }

        if is_disk_root(&root) {
            return Err(WardError::InvalidPath(format!(
                "Cannot keep ward state at disk root: {}. \
                 Run ward from a project directory instead.",
                root.display()
            )));
        }

        let ward_dir = root.join(WARD_DIR);
        let has_git = root.join(".git").is_dir();
        let initialized = ward_dir.is_dir();

        Ok(Self {
            root,
            ward_dir,
            has_git,
            initialized,
        })
    }

    /// Resolve a project by walking up from the given directory.
    ///
    /// Searches for a directory containing `.ward` or `.git`. When neither
    /// is found, the start directory itself is returned as a candidate so
    /// that `ward init` works anywhere.
    pub fn resolve(start_dir: &Path) -> Result<Self, WardError> {
        let start = start_dir
            .canonicalize()
            .map_err(|_| WardError::PathNotFound(start_dir.display().to_string()))?;

        let mut current = start.as_path();

        loop {
            if is_disk_root(current) {
                break;
            }

            if current.join(WARD_DIR).is_dir() || current.join(".git").is_dir() {
                return Self::from_root(current);
            }

            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }

        Self::from_root(&start)
    }

    /// Get the absolute path to the project root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path to the `.ward` directory.
    pub fn ward_dir(&self) -> &Path {
        &self.ward_dir
    }

    /// Check if this project has a `.git` directory.
    pub fn has_git(&self) -> bool {
        self.has_git
    }

    /// Check if `ward init` has been run here.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Fail with [`WardError::NotInitialized`] unless `.ward` exists.
    pub fn ensure_initialized(&self) -> Result<(), WardError> {
        if self.ward_dir.is_dir() {
            Ok(())
        } else {
            Err(WardError::NotInitialized)
        }
    }

    /// Create the `.ward` directory tree. Idempotent.
    pub fn create_layout(&mut self) -> Result<(), WardError> {
        for dir in [
            self.knowledge_dir(),
            self.snapshots_dir(),
            self.run_history_dir(),
            self.locks_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        self.initialized = true;
        Ok(())
    }

    /// `.ward/knowledge/`
    pub fn knowledge_dir(&self) -> PathBuf {
        self.ward_dir.join(KNOWLEDGE_DIR)
    }

    /// `.ward/snapshots/`
    pub fn snapshots_dir(&self) -> PathBuf {
        self.ward_dir.join(SNAPSHOTS_DIR)
    }

    /// `.ward/history/`
    pub fn history_dir(&self) -> PathBuf {
        self.ward_dir.join(HISTORY_DIR)
    }

    /// `.ward/history/runs/`
    pub fn run_history_dir(&self) -> PathBuf {
        self.history_dir().join(RUN_HISTORY_DIR)
    }

    /// `.ward/history/quickfix.jsonl`
    pub fn quickfix_history_path(&self) -> PathBuf {
        self.history_dir().join(QUICKFIX_HISTORY_FILENAME)
    }

    /// `.ward/locks/`
    pub fn locks_dir(&self) -> PathBuf {
        self.ward_dir.join(LOCKS_DIR)
    }

    /// `.ward/run.json`
    pub fn run_path(&self) -> PathBuf {
        self.ward_dir.join(RUN_FILENAME)
    }

    /// `.ward/quickfix.json`
    pub fn quickfix_path(&self) -> PathBuf {
        self.ward_dir.join(QUICKFIX_FILENAME)
    }

    /// `.ward/preflight.json`
    pub fn preflight_path(&self) -> PathBuf {
        self.ward_dir.join(PREFLIGHT_FILENAME)
    }

    /// Convert a caller-supplied path into a project-relative key.
    ///
    /// Relative paths are taken relative to the project root. The result uses
    /// `/` separators and never contains `.` or `..`.
    ///
    /// # Errors
    ///
    /// Returns [`WardError::InvalidPath`] when the path escapes the project,
    /// names the root itself, or points inside `.ward`.
    pub fn relative_key(&self, path: &Path) -> Result<String, WardError> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        let outside = || {
            WardError::InvalidPath(format!(
                "{} is outside the project root {}",
                path.display(),
                self.root.display()
            ))
        };

        let normalized = normalize_lexically(&joined).ok_or_else(outside)?;

        // Symlinks are resolved first: a link inside the project may point outside it.
        let resolved = canonicalize_existing_prefix(&normalized).ok_or_else(outside)?;
        let key = key_from_relative(resolved.strip_prefix(&self.root).map_err(|_| outside())?);

        if key.is_empty() {
            return Err(WardError::InvalidPath(format!(
                "{} refers to the project root, not a file",
                path.display()
            )));
        }

        if key == WARD_DIR || key.starts_with(&format!("{}/", WARD_DIR)) {
            return Err(WardError::InvalidPath(format!(
                "{} is inside the ward state directory",
                path.display()
            )));
        }

        tracing::debug!("Resolved {} to key {}", path.display(), key);
        Ok(key)
    }

    /// Absolute filesystem path for a project-relative key.
    pub fn abs_path(&self, key: &str) -> PathBuf {
        let mut out = self.root.clone();
        for part in key.split('/') {
            out.push(part);
        }
        out
    }
}

// ============================================================================
// Tests
// ============================================================================
