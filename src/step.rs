//! Installation steps and the context they run in.
//!
//! A step is a name plus an action. The orchestrator only cares whether the
//! action succeeded; everything else (which packages, which files) belongs to
//! the step. Actions must be idempotent: an interrupted step is run again in
//! full on the next run.

use crate::backup::BackupEntry;
use crate::error::Result;
use crate::mutation_guard::MutationGuard;
use crate::retry::RetryPolicy;
use std::fmt;
use std::path::Path;

/// Signature of a step action
pub type StepAction = Box<dyn FnMut(&mut StepContext<'_>) -> anyhow::Result<()>>;

/// One named unit of provisioning work
pub struct InstallationStep {
    name: String,
    description: String,
    action: StepAction,
}

impl InstallationStep {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnMut(&mut StepContext<'_>) -> anyhow::Result<()> + 'static,
    {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            action: Box::new(action),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn execute(&mut self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        (self.action)(ctx)
    }
}

impl fmt::Debug for InstallationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationStep")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// What a running step may use: the run's mutation guard and retry policy
pub struct StepContext<'a> {
    step: &'a str,
    guard: &'a mut MutationGuard,
    retry: RetryPolicy,
}

impl<'a> StepContext<'a> {
    pub fn new(step: &'a str, guard: &'a mut MutationGuard, retry: RetryPolicy) -> Self {
        Self { step, guard, retry }
    }

    /// Name of the running step
    pub fn step(&self) -> &str {
        self.step
    }

    /// Retry policy configured for this run
    /// Snapshot a file the step is about to change by other means
    /// (e.g. a package manager rewriting it)
    pub fn guard(&mut self, path: &Path) -> Result<Option<BackupEntry>> {
        self.guard.guard(path)
    }

    /// Replace a file's contents behind a backup
    pub fn write_file(&mut self, path: &Path, contents: impl AsRef<[u8]>) -> Result<Option<BackupEntry>> {
        self.guard.write(path, contents)
    }

    /// Append to a file behind a backup
    pub fn append_file(&mut self, path: &Path, contents: impl AsRef<[u8]>) -> Result<Option<BackupEntry>> {
        self.guard.append(path, contents)
    }

    /// Delete a file behind a backup
    pub fn remove_file(&mut self, path: &Path) -> Result<Option<BackupEntry>> {
        self.guard.remove(path)
    }

    /// Run a transient operation under the run's retry policy
    pub fn retry<T, E, F>(&self, operation: &str, op: F) -> Result<T>
    where
        E: fmt::Display,
        F: FnMut(u32) -> std::result::Result<T, E>,
    {
        self.retry.retry(operation, op)
    }
}
