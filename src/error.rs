//! Error handling module for the provisioner
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Component boundaries (guard, progress, backup, restore, lock, orchestrator)
//! return these types; step bodies and glue code use `anyhow` and are folded
//! into [`ProvisionError::StepFailed`] by the orchestrator.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for "another provisioning run holds the lock".
pub const EXIT_LOCK_HELD: i32 = 3;

/// Exit code for every other failure.
pub const EXIT_FAILURE: i32 = 1;

/// What made a step fail, as far as the orchestrator can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FailureCause {
    /// The step's own action reported failure
    Action,
    /// A guarded mutation could not be backed up, so it was not performed
    Backup,
    /// A retried sub-operation never succeeded
    RetryExhausted,
}

/// Main error type for the provisioner
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Another run already holds the run lock
    #[error("Another provisioning run is already in progress (lock {path:?}{})", pid_suffix(*pid))]
    LockHeld { path: PathBuf, pid: Option<u32> },

    /// A file could not be protected before mutation
    #[error("Backup of {path:?} failed: {reason}")]
    BackupFailed { path: PathBuf, reason: String },

    /// A step action returned failure
    #[error("Step '{step}' failed ({cause}): {reason}")]
    StepFailed {
        step: String,
        reason: String,
        cause: FailureCause,
    },

    /// A retried operation failed on every attempt
    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Some files of a backup set could not be restored
    #[error("Restore incomplete: {restored} file(s) restored, {failed} failed")]
    RestorePartialFailure { restored: usize, failed: usize },

    /// Unreadable line in the progress record (logged, never fatal)
    #[error("Progress record {path:?} line {line} is unreadable: {content:?}")]
    RecordCorrupt {
        path: PathBuf,
        line: usize,
        content: String,
    },

    /// The progress record could not be written
    #[error("Failed to record progress in {path:?}: {source}")]
    ProgressWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No backup set with the given id exists
    #[error("Backup set not found: {0}")]
    BackupSetNotFound(String),

    /// IO errors (file operations, processes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors (loading, parsing)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors (step names, plan shape, config values)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Run state machine transition errors
    #[error("State error: {0}")]
    State(String),

    /// General errors (catch-all for edge cases)
    #[error("{0}")]
    General(String),
}

fn pid_suffix(pid: Option<u32>) -> String {
    pid.map(|p| format!(", held by PID {}", p))
        .unwrap_or_default()
}

/// Result type alias for provisioner operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

// Convenient error constructors
impl ProvisionError {
    /// Create a backup failure for `path`
    pub fn backup(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::BackupFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a general error
    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }

    /// Fold an error returned by a step action into a `StepFailed`.
    ///
    /// The cause is recovered by looking for a typed error anywhere in the
    /// anyhow chain, so `.context(..)` on top of a guard failure still
    /// reports `FailureCause::Backup`.
    pub fn step_failed(step: &str, err: &anyhow::Error) -> Self {
        let cause = err
            .chain()
            .find_map(|e| match e.downcast_ref::<ProvisionError>() {
                Some(ProvisionError::BackupFailed { .. }) => Some(FailureCause::Backup),
                Some(ProvisionError::RetryExhausted { .. }) => Some(FailureCause::RetryExhausted),
                Some(ProvisionError::StepFailed { cause, .. }) => Some(*cause),
                _ => None,
            })
            .unwrap_or(FailureCause::Action);

        Self::StepFailed {
            step: step.to_string(),
            reason: format!("{:#}", err),
            cause,
        }
    }

    /// True if this is the "already running" error
    pub fn is_lock_held(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        if self.is_lock_held() {
            EXIT_LOCK_HELD
        } else {
            EXIT_FAILURE
        }
    }
}
