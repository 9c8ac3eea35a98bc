//! Per-state-file exclusive locks.
//!
//! Each mutable state file (`run.json`, `quickfix.json`, the knowledge
//! directory) has its own lock file under `.ward/locks/`. A state mutation
//! holds the lock for its whole read-modify-write. Locks are advisory
//! `flock(2)`-style locks from `fs2`, so the OS releases them if the process
//! dies.
//!
//! Acquisition order, when more than one is needed: run, quickfix, knowledge.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::errors::WardError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An exclusive lock on one ward state file, released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Acquire `<locks_dir>/<name>.lock`, polling until `timeout` expires.
    pub fn acquire(locks_dir: &Path, name: &str, timeout: Duration) -> Result<Self, WardError> {
        std::fs::create_dir_all(locks_dir)?;
        let path = locks_dir.join(format!("{}.lock", name));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let start = Instant::now();
        let mut logged = false;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file, path }),
                Err(_) if start.elapsed() >= timeout => {
                    return Err(WardError::LockTimeout(path.display().to_string()));
                }
                Err(_) => {
                    if !logged {
                        tracing::debug!("Waiting for lock {}", path.display());
                        logged = true;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
