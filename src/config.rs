//! Provisioner configuration file handling.
//!
//! The configuration is a JSON document describing where state lives, how
//! transient failures are retried, and the ordered list of steps to run.
//! Every field has a default, so `{}` is a valid (empty) plan.

use crate::package_query::PackageManagerKind;
use crate::progress::validate_step_name;
use crate::restore::ReloadHook;
use crate::retry::RetryPolicy;
use crate::steps::{StepActionSpec, StepSpec};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding `state_dir`
pub const STATE_DIR_ENV: &str = "PROVISIONER_STATE_DIR";

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/provisioner/config.json";

pub const DEFAULT_STATE_DIR: &str = "/var/lib/provisioner";

/// Provisioning configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Directory holding progress, lock, backups and the pending queue
    pub state_dir: PathBuf,

    // Per-file overrides; relative paths resolve against state_dir
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_file: Option<PathBuf>,

    pub retry: RetryPolicy,
    /// Default for `--cleanup-backups` without a count
    pub backup_keep_count: usize,
    pub package_manager: PackageManagerKind,
    pub reload_hooks: Vec<ReloadHook>,
    pub steps: Vec<StepSpec>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            progress_file: None,
            lock_file: None,
            backup_dir: None,
            pending_file: None,
            retry: RetryPolicy::default(),
            backup_keep_count: 5,
            package_manager: PackageManagerKind::default(),
            reload_hooks: Vec::new(),
            steps: Vec::new(),
        }
    }
}

impl ProvisionConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Load `path` if given, else the default file if it exists, else defaults.
    /// Environment overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load_from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).is_file() => {
                Self::load_from_file(DEFAULT_CONFIG_PATH)?
            }
            None => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    /// Apply `PROVISIONER_STATE_DIR`
    pub fn with_env_overrides(self) -> Self {
        self.with_state_dir_override(std::env::var_os(STATE_DIR_ENV).map(PathBuf::from))
    }

    /// Replace `state_dir` when an override is given
    pub fn with_state_dir_override(mut self, state_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = state_dir.filter(|d| !d.as_os_str().is_empty()) {
            self.state_dir = dir;
        }
        self
    }

    fn resolve(&self, over: &Option<PathBuf>, default_name: &str) -> PathBuf {
        match over {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => self.state_dir.join(p),
            None => self.state_dir.join(default_name),
        }
    }

    pub fn progress_path(&self) -> PathBuf {
        self.resolve(&self.progress_file, "progress")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.resolve(&self.lock_file, "provisioner.lock")
    }

    pub fn backup_root(&self) -> PathBuf {
        self.resolve(&self.backup_dir, "backups")
    }

    pub fn pending_path(&self) -> PathBuf {
        self.resolve(&self.pending_file, "pending.jsonl")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            anyhow::bail!("state_dir must be specified");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.backup_keep_count == 0 {
            anyhow::bail!("backup_keep_count must be at least 1");
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            validate_step_name(&step.name)?;
            if !names.insert(step.name.as_str()) {
                anyhow::bail!("Duplicate step name: {}", step.name);
            }
            match &step.action {
                StepActionSpec::Command { command, .. } | StepActionSpec::Defer { command } => {
                    if command.is_empty() {
                        anyhow::bail!("Step '{}' has an empty command", step.name);
                    }
                }
                StepActionSpec::Packages { packages } => {
                    if packages.is_empty() {
                        anyhow::bail!("Step '{}' lists no packages", step.name);
                    }
                }
                StepActionSpec::WriteFile { path, mode, .. } => {
                    if !path.is_absolute() {
                        anyhow::bail!("Step '{}' must write to an absolute path", step.name);
                    }
                    if mode.is_some_and(|m| m > 0o7777) {
                        anyhow::bail!("Step '{}' has an invalid file mode", step.name);
                    }
                }
            }
        }

        for hook in &self.reload_hooks {
            if hook.name.trim().is_empty() {
                anyhow::bail!("Reload hooks must be named");
            }
            if hook.command.is_empty() {
                anyhow::bail!("Reload hook '{}' has an empty command", hook.name);
            }
        }

        Ok(())
    }
}
