//! Configuration types for ward.
//!
//! - [`GlobalConfig`]: user-level configuration stored in `~/.ward/config.yaml`
//! - [`ProjectConfig`]: project-level overrides stored in `.ward/config.yaml`
//! - [`Settings`]: the resolved values an operation actually runs with

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_ABANDON_AFTER_SECS, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_RETRY_BUDGET,
    DEFAULT_SNAPSHOT_GRACE_SECS, GLOBAL_CONFIG_FILENAME, GRAPH_FILENAME, PROJECT_CONFIG_FILENAME,
    REGISTRY_FILENAME, WARD_DIR, WARD_HOME_DIR,
};
use crate::errors::WardError;

/// Parse a YAML config file; a missing or blank file yields `T::default()`.
fn read_yaml_or_default<T>(path: &Path, invalid: fn(String) -> WardError) -> Result<T, WardError>
where
    T: DeserializeOwned + Default,
{
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("Config not found at {}, using defaults", path.display());
            return Ok(T::default());
        }
        Err(e) => return Err(invalid(format!("Failed to read {}: {}", path.display(), e))),
    };

    // Blank YAML is null, not an empty mapping.
    if content.trim().is_empty() {
        return Ok(T::default());
    }

    serde_yaml::from_str(&content)
        .map_err(|e| invalid(format!("Failed to parse {}: {}", path.display(), e)))
}

// ============================================================================
// VerifyConfig
// ============================================================================

/// Verification collaborator configuration.
///
/// # Example YAML
///
/// ```yaml
/// verify:
///   command: cargo test --quiet
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyConfig {
    /// Shell command run after each step. `None` means every step passes.
    #[serde(default)]
    pub command: Option<String>,
}

// ============================================================================
// GlobalConfig
// ============================================================================

/// Global (user-level) configuration for ward.
///
/// Loaded from `~/.ward/config.yaml`. Every value here can be overridden
/// per project by [`ProjectConfig`].
///
/// # Example YAML
///
/// ```yaml
/// retryBudget: 2
/// abandonAfterSecs: 86400
/// snapshotGraceSecs: 86400
/// lockTimeoutMs: 5000
/// verify:
///   command: make test
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Failed verification attempts tolerated per step.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Heartbeat age after which active state is abandoned. 0 disables.
    #[serde(default = "default_abandon_after_secs")]
    pub abandon_after_secs: u64,

    /// Minimum age of an unreferenced snapshot before GC may free it.
    #[serde(default = "default_snapshot_grace_secs")]
    pub snapshot_grace_secs: u64,

    /// How long state mutations wait for their lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Default verification command.
    #[serde(default)]
    pub verify: VerifyConfig,

    /// Override for the registry file location.
    #[serde(default)]
    pub registry_path: Option<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            abandon_after_secs: default_abandon_after_secs(),
            snapshot_grace_secs: default_snapshot_grace_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            verify: VerifyConfig::default(),
            registry_path: None,
        }
    }
}

impl GlobalConfig {
    /// Load the global configuration from the default location.
    ///
    /// Falls back to defaults when the home directory cannot be determined
    /// or the file does not exist.
    pub fn load_default() -> Result<Self, WardError> {
        match Self::default_path() {
            Some(path) => Self::from_path(&path),
            None => {
                tracing::debug!("Could not determine home directory, using default config");
                Ok(Self::default())
            }
        }
    }

    /// Load the global configuration from a specific path.
    ///
    /// If the file does not exist, returns a default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`WardError::InvalidGlobalConfig`] if the file exists but cannot be parsed.
    /// Returns [`WardError::InvalidConfiguration`] if validation fails.
    pub fn from_path(path: &Path) -> Result<Self, WardError> {
        let config: Self = read_yaml_or_default(path, WardError::InvalidGlobalConfig)?;
        for warning in config.validate()? {
            tracing::warn!("Config warning: {}", warning);
        }
        Ok(config)
    }

    /// Get the default global config directory (`~/.ward`).
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(WARD_HOME_DIR))
    }

    /// Get the default global config file path (`~/.ward/config.yaml`).
    pub fn default_path() -> Option<PathBuf> {
        Self::default_dir().map(|d| d.join(GLOBAL_CONFIG_FILENAME))
    }

    /// Resolve the registry file path (`registryPath` or `~/.ward/registry.yaml`).
    pub fn registry_path(&self) -> Option<PathBuf> {
        self.registry_path
            .clone()
            .or_else(|| Self::default_dir().map(|d| d.join(REGISTRY_FILENAME)))
    }

    /// Validate the global configuration.
    ///
    /// Returns a list of warnings for non-fatal issues.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<Vec<String>, WardError> {
        let mut warnings = Vec::new();

        if self.lock_timeout_ms == 0 {
            return Err(WardError::InvalidConfiguration {
                message: "lockTimeoutMs cannot be 0".to_string(),
                hint: "Set lockTimeoutMs to at least 100 (recommended: 5000)".to_string(),
            });
        }

        if self.retry_budget == 0 {
            warnings.push(
                "retryBudget is 0; the first failed verification ends the run".to_string(),
            );
        }

        if self.snapshot_grace_secs < 60 {
            warnings.push(format!(
                "snapshotGraceSecs ({}) is very short; snapshots of finished quick-fixes may be collected almost immediately",
                self.snapshot_grace_secs
            ));
        }

        if let Some(command) = &self.verify.command {
            if command.trim().is_empty() {
                warnings.push("verify.command is empty; verification will always pass".to_string());
            }
        }

        Ok(warnings)
    }
}

// ============================================================================
// ProjectConfig
// ============================================================================

/// Graph collaborator configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphConfig {
    /// Graph file, relative to the project root. Defaults to `.ward/graph.json`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Project-level configuration overrides.
///
/// Stored in `.ward/config.yaml`. All fields are optional; unset fields
/// inherit from [`GlobalConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Declared language of the project (informational).
    #[serde(default)]
    pub language: Option<String>,

    #[serde(default)]
    pub retry_budget: Option<u32>,

    #[serde(default)]
    pub abandon_after_secs: Option<u64>,

    #[serde(default)]
    pub snapshot_grace_secs: Option<u64>,

    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,

    /// Project verification command (overrides the global one).
    #[serde(default)]
    pub verify: Option<VerifyConfig>,

    #[serde(default)]
    pub graph: GraphConfig,
}

impl ProjectConfig {
    /// Load the project configuration from a project root.
    ///
    /// Looks for `.ward/config.yaml`. If the file does not exist, returns a
    /// default (empty) configuration.
    ///
    /// # Errors
    ///
    /// Returns [`WardError::InvalidProjectConfig`] if the file exists but cannot be parsed.
    pub fn load_from_workspace(workspace_root: &Path) -> Result<Self, WardError> {
        let path = Self::config_path_for_workspace(workspace_root);
        Self::from_path(&path)
    }

    /// Load the project configuration from a specific path.
    pub fn from_path(path: &Path) -> Result<Self, WardError> {
        let config: Self = read_yaml_or_default(path, WardError::InvalidProjectConfig)?;

        if config.lock_timeout_ms == Some(0) {
            return Err(WardError::InvalidConfiguration {
                message: "project lockTimeoutMs cannot be 0".to_string(),
                hint: "Remove the override or set it to at least 100".to_string(),
            });
        }

        Ok(config)
    }

    /// Get the config file path for a given project root.
    pub fn config_path_for_workspace(workspace_root: &Path) -> PathBuf {
        workspace_root.join(WARD_DIR).join(PROJECT_CONFIG_FILENAME)
    }

    /// Merge this project's overrides over the global configuration.
    pub fn resolve(&self, global: &GlobalConfig, workspace_root: &Path) -> Settings {
        let verify = self
            .verify
            .clone()
            .filter(|v| v.command.is_some())
            .unwrap_or_else(|| global.verify.clone());

        let graph_path = match &self.graph.path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => workspace_root.join(p),
            None => workspace_root.join(WARD_DIR).join(GRAPH_FILENAME),
        };

        Settings {
            retry_budget: self.retry_budget.unwrap_or(global.retry_budget),
            abandon_after_secs: self.abandon_after_secs.unwrap_or(global.abandon_after_secs),
            snapshot_grace_secs: self.snapshot_grace_secs.unwrap_or(global.snapshot_grace_secs),
            lock_timeout_ms: self.lock_timeout_ms.unwrap_or(global.lock_timeout_ms),
            verify_command: verify.command.filter(|c| !c.trim().is_empty()),
            graph_path,
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Fully resolved settings for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub retry_budget: u32,
    pub abandon_after_secs: u64,
    pub snapshot_grace_secs: u64,
    pub lock_timeout_ms: u64,
    pub verify_command: Option<String>,
    pub graph_path: PathBuf,
}

impl Settings {
    /// Settings with built-in defaults for a project root. Used by tests and
    /// by callers that do not load configuration files.
    pub fn defaults_for(workspace_root: &Path) -> Self {
        ProjectConfig::default().resolve(&GlobalConfig::default(), workspace_root)
    }

    /// Lock wait as a [`std::time::Duration`].
    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_timeout_ms)
    }
}

fn default_retry_budget() -> u32 {
    DEFAULT_RETRY_BUDGET
}

fn default_abandon_after_secs() -> u64 {
    DEFAULT_ABANDON_AFTER_SECS
}

fn default_snapshot_grace_secs() -> u64 {
    DEFAULT_SNAPSHOT_GRACE_SECS
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

// ============================================================================
// Tests
// ============================================================================
