//! Provisioner Library
//!
//! Resumable provisioning runs: ordered steps with a durable progress record,
//! a per-host run lock, file mutations that are always backed up first, and
//! restore of any backup set.

pub mod backup;
pub mod cli;
pub mod clock;
pub mod command;
pub mod config;
pub mod deferred;
pub mod error;
pub mod mutation_guard;
pub mod orchestrator;
pub mod package_query;
pub mod process_guard;
pub mod progress;
pub mod restore;
pub mod retry;
pub mod run_lock;
pub mod step;
pub mod steps;

// Re-export main types for convenience
pub use backup::{
    BackupEntry, BackupManager, BackupSession, BackupSetMetadata, CleanupReport, SetKind,
};
pub use command::{run_command_safe, ArgvCommand, CommandArgs, CommandOutput};
pub use config::ProvisionConfig;
pub use deferred::{PendingAction, PendingQueue};
pub use error::{FailureCause, ProvisionError, Result};
pub use mutation_guard::MutationGuard;
pub use orchestrator::{
    Orchestrator, PlannedAction, PlannedStep, RunContext, RunPhase, RunResult,
    RunTransitionError,
};
pub use package_query::{PackageManagerKind, PackageQuery, PackageStatus, SystemPackages};
pub use process_guard::{CleanupRegistry, CommandProcessGroup};
pub use progress::{FileProgressStore, MemoryProgressStore, ProgressEntry, ProgressStore};
pub use restore::{ReloadHook, RestoreEngine, RestoreResult};
pub use retry::RetryPolicy;
pub use run_lock::{FileRunLock, LockGuard, MemoryRunLock, RunLock};
pub use step::{InstallationStep, StepContext};
pub use steps::{build_steps, StepActionSpec, StepEnv, StepSpec};
