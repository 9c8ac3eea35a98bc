//! Project registry.
//!
//! Maps a project name to its root directory and declared language so that
//! commands can target a project by name (`--project`, `WARD_PROJECT`)
//! instead of by working directory.
//!
//! The default registry lives at `~/.ward/registry.yaml`:
//!
//! ```yaml
//! projects:
//!   billing:
//!     root: /home/me/src/billing
//!     language: python
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::WardError;
use crate::fsutil::atomic_write;

/// One registered project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEntry {
    pub root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Resolves project names to roots.
pub trait Registry: Send + Sync {
    /// Look up a project by name.
    fn resolve(&self, name: &str) -> Result<ProjectEntry, WardError>;

    /// All registered projects, sorted by name.
    fn list(&self) -> Result<Vec<(String, ProjectEntry)>, WardError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    projects: BTreeMap<String, ProjectEntry>,
}

/// Registry backed by a YAML file.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<RegistryFile, WardError> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(RegistryFile::default()),
            Ok(content) => serde_yaml::from_str(&content).map_err(|e| {
                WardError::InvalidConfiguration {
                    message: format!("Cannot parse registry {}: {}", self.path.display(), e),
                    hint: "Fix or remove the file, then re-register projects with `ward register`."
                        .to_string(),
                }
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Add or replace a project entry.
    pub fn register(&self, name: &str, entry: ProjectEntry) -> Result<(), WardError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(WardError::InvalidArgument(
                "Project name cannot be empty.".to_string(),
            ));
        }
        let mut file = self.read()?;
        if let Some(previous) = file.projects.insert(name.to_string(), entry) {
            tracing::info!("Replacing registry entry {} (was {})", name, previous.root.display());
        }
        let yaml = serde_yaml::to_string(&file)?;
        atomic_write(&self.path, yaml.as_bytes())?;
        tracing::debug!("Registry written to {}", self.path.display());
        Ok(())
    }
}

impl Registry for FileRegistry {
    fn resolve(&self, name: &str) -> Result<ProjectEntry, WardError> {
        self.read()?
            .projects
            .remove(name)
            .ok_or_else(|| WardError::ProjectNotRegistered(name.to_string()))
    }

    fn list(&self) -> Result<Vec<(String, ProjectEntry)>, WardError> {
        Ok(self.read()?.projects.into_iter().collect())
    }
}
