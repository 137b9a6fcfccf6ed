//! Provisioning orchestrator
//!
//! Runs the step list in order under the run lock, skipping steps the
//! progress record already marks done, and stops at the first failure.
//!
//! # Run Phases
//!
//! ```text
//! Idle
//!   ↓ (lock acquired)            Idle → Failed when the lock is held
//! Locking
//!   ↓
//! Running(0) → Running(1) → ... → Completed
//!
//! (Locking and any Running(i) can transition to Failed)
//! ```
//!
//! # Design Principles
//!
//! - **Progress is authoritative**: a step marked done is never re-run
//! - **Done means succeeded**: `mark_done` only after the action returned Ok
//! - **No orphaned lock**: the lock is released on every exit path
//! - **Validated transitions**: the phase machine rejects skipped or
//!   backward moves, so a bug cannot silently report success

use crate::backup::{BackupManager, SetKind};
use crate::clock::{display_unix, unix_now};
use crate::error::{ProvisionError, EXIT_FAILURE};
use crate::mutation_guard::MutationGuard;
use crate::progress::{validate_step_name, ProgressStore};
use crate::retry::RetryPolicy;
use crate::run_lock::RunLock;
use crate::step::{InstallationStep, StepContext};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use tracing::{error, info, warn};

/// Phases of one orchestrator run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    /// Nothing has happened yet
    Idle,
    /// Lock held, about to start the first step
    Locking,
    /// Working on the step at this index
    Running(usize),
    /// Every step is done (terminal)
    Completed,
    /// A step or the lock failed (terminal)
    Failed,
}

impl RunPhase {
    /// Returns true if this is a terminal state (Completed or Failed)
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Short label for logs
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Locking => "locking",
            Self::Running(_) => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `to` is allowed for a plan of
    /// `step_count` steps
    pub fn can_transition_to(self, to: RunPhase, step_count: usize) -> bool {
        match (self, to) {
            (Self::Idle, Self::Locking) | (Self::Idle, Self::Failed) => true,
            (Self::Locking, Self::Running(0)) => step_count > 0,
            (Self::Locking, Self::Completed) => step_count == 0,
            (Self::Locking, Self::Failed) => true,
            (Self::Running(i), Self::Running(j)) => j == i + 1 && j < step_count,
            (Self::Running(i), Self::Completed) => i + 1 == step_count,
            (Self::Running(_), Self::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running(i) => write!(f, "running step {}", i + 1),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Errors that can occur during phase transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunTransitionError {
    /// Attempted to transition from a terminal state
    #[error("Cannot transition from terminal phase {from}")]
    FromTerminalState { from: RunPhase },

    /// Attempted a transition the phase machine does not allow
    #[error("Invalid transition from {from} to {to}")]
    Invalid { from: RunPhase, to: RunPhase },
}

impl From<RunTransitionError> for ProvisionError {
    fn from(e: RunTransitionError) -> Self {
        ProvisionError::state(e.to_string())
    }
}

/// Owns the current phase and validates every move
#[derive(Debug, Clone)]
pub struct RunContext {
    current: RunPhase,
    step_count: usize,
    /// Phases entered, with unix timestamps
    history: Vec<(RunPhase, u64)>,
}

impl RunContext {
    pub fn new(step_count: usize) -> Self {
        Self {
            current: RunPhase::Idle,
            step_count,
            history: vec![(RunPhase::Idle, unix_now())],
        }
    }

    #[inline]
    pub fn current(&self) -> RunPhase {
        self.current
    }

    pub fn history(&self) -> &[(RunPhase, u64)] {
        &self.history
    }

    /// Move to `to` if the phase machine allows it
    pub fn transition_to(&mut self, to: RunPhase) -> Result<RunPhase, RunTransitionError> {
        if self.current.is_terminal() {
            return Err(RunTransitionError::FromTerminalState { from: self.current });
        }
        if !self.current.can_transition_to(to, self.step_count) {
            return Err(RunTransitionError::Invalid {
                from: self.current,
                to,
            });
        }
        self.current = to;
        self.history.push((to, unix_now()));
        Ok(to)
    }

    /// Move to the phase after the current step (next step or Completed)
    pub fn advance(&mut self) -> Result<RunPhase, RunTransitionError> {
        let next = match self.current {
            RunPhase::Locking if self.step_count == 0 => RunPhase::Completed,
            RunPhase::Locking => RunPhase::Running(0),
            RunPhase::Running(i) if i + 1 < self.step_count => RunPhase::Running(i + 1),
            RunPhase::Running(_) => RunPhase::Completed,
            other => {
                return Err(RunTransitionError::Invalid {
                    from: other,
                    to: other,
                });
            }
        };
        self.transition_to(next)
    }

    /// Move to Failed from any non-terminal phase
    pub fn fail(&mut self) -> Result<RunPhase, RunTransitionError> {
        self.transition_to(RunPhase::Failed)
    }
}

/// What `plan()` expects a step to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    /// Already recorded as done at this unix time
    Skip { completed_at: Option<u64> },
    Execute,
}

/// One row of a dry-run plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub name: String,
    pub description: String,
    pub action: PlannedAction,
}

/// Outcome of [`Orchestrator::run`]
#[derive(Debug)]
pub struct RunResult {
    /// Steps executed successfully during this run
    pub completed_steps: Vec<String>,
    /// Steps skipped because the progress record marked them done
    pub skipped_steps: Vec<String>,
    /// Step that stopped the run
    pub failed_step: Option<String>,
    pub error: Option<ProvisionError>,
    /// Final phase (Completed or Failed)
    pub phase: RunPhase,
    /// Backup set holding the files this run changed
    pub backup_set: Option<String>,
    pub history: Vec<(RunPhase, u64)>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.phase == RunPhase::Completed && self.error.is_none()
    }

    /// Process exit code: 0, 1, or the lock-held code
    pub fn exit_code(&self) -> i32 {
        match &self.error {
            None if self.is_success() => 0,
            None => EXIT_FAILURE,
            Some(e) => e.exit_code(),
        }
    }
}

/// Top-level sequencer
pub struct Orchestrator {
    steps: Vec<InstallationStep>,
    progress: Box<dyn ProgressStore>,
    lock: Box<dyn RunLock>,
    backups: Option<BackupManager>,
    retry: RetryPolicy,
}

impl Orchestrator {
    /// Build an orchestrator; step names must be valid and unique
    pub fn new(
        steps: Vec<InstallationStep>,
        progress: Box<dyn ProgressStore>,
        lock: Box<dyn RunLock>,
    ) -> crate::error::Result<Self> {
        let mut seen = HashSet::new();
        for step in &steps {
            validate_step_name(step.name())?;
            if !seen.insert(step.name().to_string()) {
                return Err(ProvisionError::validation(format!(
                    "Duplicate step name: {}",
                    step.name()
                )));
            }
        }

        Ok(Self {
            steps,
            progress,
            lock,
            backups: None,
            retry: RetryPolicy::default(),
        })
    }

    /// Collect guarded files into backup sets under `manager`
    /// (without this, backups are written next to the originals)
    pub fn with_backups(mut self, manager: BackupManager) -> Self {
        self.backups = Some(manager);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Report what a run would do, without locking or executing anything
    pub fn plan(&self) -> crate::error::Result<Vec<PlannedStep>> {
        let entries = self.progress.entries()?;
        self.steps
            .iter()
            .map(|step| -> crate::error::Result<PlannedStep> {
                let done = entries.iter().rev().find(|e| e.step == step.name());
                let action = if done.is_some() || self.progress.is_done(step.name())? {
                    PlannedAction::Skip {
                        completed_at: done.map(|e| e.completed_at),
                    }
                } else {
                    PlannedAction::Execute
                };
                Ok(PlannedStep {
                    name: step.name().to_string(),
                    description: step.description().to_string(),
                    action,
                })
            })
            .collect()
    }

    /// Run every pending step in order
    pub fn run(&mut self) -> RunResult {
        let mut ctx = RunContext::new(self.steps.len());
        let mut result = RunResult {
            completed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            failed_step: None,
            error: None,
            phase: RunPhase::Idle,
            backup_set: None,
            history: Vec::new(),
        };

        let lock_guard = match self.lock.acquire() {
            Ok(guard) => guard,
            Err(e) => {
                error!("Cannot start provisioning run: {}", e);
                let _ = ctx.fail();
                result.error = Some(e);
                result.phase = ctx.current();
                result.history = ctx.history().to_vec();
                return result;
            }
        };

        if let Err(e) = ctx.transition_to(RunPhase::Locking) {
            result.error = Some(e.into());
        } else {
            let mut guard = match &self.backups {
                Some(manager) => MutationGuard::with_set(manager.new_set(SetKind::Run, None)),
                None => MutationGuard::sibling(),
            };

            if let Err(e) = self.run_steps(&mut ctx, &mut guard, &mut result) {
                result.error = Some(e);
            }
            result.backup_set = guard.set_id().map(str::to_string);
        }

        if result.error.is_some() && !ctx.current().is_terminal() {
            let _ = ctx.fail();
        }

        if let Err(e) = lock_guard.release() {
            warn!("Run lock release failed: {}", e);
        }

        result.phase = ctx.current();
        result.history = ctx.history().to_vec();

        match (&result.error, &result.failed_step) {
            (None, _) => info!(
                "Provisioning complete: {} step(s) run, {} skipped",
                result.completed_steps.len(),
                result.skipped_steps.len()
            ),
            (Some(e), Some(step)) => error!("Provisioning stopped at step '{}': {}", step, e),
            (Some(e), None) => error!("Provisioning failed: {}", e),
        }
        if let Some(id) = &result.backup_set {
            info!("Files changed by this run are backed up in set {}", id);
        }

        result
    }

    fn run_steps(
        &mut self,
        ctx: &mut RunContext,
        guard: &mut MutationGuard,
        result: &mut RunResult,
    ) -> crate::error::Result<()> {
        let total = self.steps.len();
        let retry = self.retry;

        ctx.advance()?;
        while let RunPhase::Running(index) = ctx.current() {
            let step = &mut self.steps[index];
            let name = step.name().to_string();

            let done = self.progress.is_done(&name).inspect_err(|_| {
                result.failed_step = Some(name.clone());
            })?;

            if done {
                info!("[{}/{}] {}: already done, skipping", index + 1, total, name);
                result.skipped_steps.push(name);
            } else {
                info!("[{}/{}] {}: {}", index + 1, total, name, step.description());
                let mut step_ctx = StepContext::new(&name, guard, retry);
                if let Err(err) = step.execute(&mut step_ctx) {
                    result.failed_step = Some(name.clone());
                    ctx.fail()?;
                    return Err(ProvisionError::step_failed(&name, &err));
                }

                self.progress.mark_done(&name).inspect_err(|_| {
                    result.failed_step = Some(name.clone());
                })?;
                info!("[{}/{}] {}: done at {}", index + 1, total, name, display_unix(unix_now()));
                result.completed_steps.push(name);
            }

            ctx.advance()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::MemoryProgressStore;
    use crate::run_lock::MemoryRunLock;
    use std::cell::Cell;
    use std::rc::Rc;

    // =========================================================================
    // RunPhase / RunContext Tests
    // =========================================================================

    #[test]
    fn test_phase_chain_for_three_steps() {
        let mut ctx = RunContext::new(3);
        ctx.transition_to(RunPhase::Locking).unwrap();
        assert_eq!(ctx.advance().unwrap(), RunPhase::Running(0));
        assert_eq!(ctx.advance().unwrap(), RunPhase::Running(1));
        assert_eq!(ctx.advance().unwrap(), RunPhase::Running(2));
        assert_eq!(ctx.advance().unwrap(), RunPhase::Completed);
        assert_eq!(ctx.history().len(), 6);
    }

    #[test]
    fn test_empty_plan_completes_from_locking() {
        let mut ctx = RunContext::new(0);
        ctx.transition_to(RunPhase::Locking).unwrap();
        assert_eq!(ctx.advance().unwrap(), RunPhase::Completed);
    }

    #[test]
    fn test_cannot_skip_steps() {
        let mut ctx = RunContext::new(3);
        ctx.transition_to(RunPhase::Locking).unwrap();
        ctx.advance().unwrap();
        assert!(matches!(
            ctx.transition_to(RunPhase::Running(2)),
            Err(RunTransitionError::Invalid { .. })
        ));
        assert!(matches!(
            ctx.transition_to(RunPhase::Completed),
            Err(RunTransitionError::Invalid { .. })
        ));
    }

    #[test]
    fn test_idle_cannot_start_running_without_lock() {
        let mut ctx = RunContext::new(2);
        assert!(ctx.transition_to(RunPhase::Running(0)).is_err());
        assert_eq!(ctx.fail().unwrap(), RunPhase::Failed);
    }

    #[test]
    fn test_terminal_phases_are_final() {
        let mut ctx = RunContext::new(1);
        ctx.fail().unwrap();
        assert!(matches!(
            ctx.transition_to(RunPhase::Locking),
            Err(RunTransitionError::FromTerminalState { .. })
        ));
        assert!(ctx.fail().is_err());
    }

    // =========================================================================
    // Orchestrator Tests
    // =========================================================================

    fn counting_step(name: &str, counter: Rc<Cell<u32>>) -> InstallationStep {
        InstallationStep::new(name, move |_ctx| {
            counter.set(counter.get() + 1);
            Ok(())
        })
    }

    #[test]
    fn test_runs_all_steps_in_order() {
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let steps = ["a", "b", "c"]
            .into_iter()
            .map(|n| {
                let order = Rc::clone(&order);
                InstallationStep::new(n, move |ctx| {
                    order.borrow_mut().push(ctx.step().to_string());
                    Ok(())
                })
            })
            .collect();

        let mut orch = Orchestrator::new(
            steps,
            Box::new(MemoryProgressStore::new()),
            Box::new(MemoryRunLock::new()),
        )
        .unwrap();
        let result = orch.run();

        assert!(result.is_success());
        assert_eq!(result.exit_code(), 0);
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
        assert_eq!(result.completed_steps, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_done_steps_are_skipped() {
        let counter = Rc::new(Cell::new(0));
        let mut orch = Orchestrator::new(
            vec![counting_step("a", Rc::clone(&counter)), counting_step("b", Rc::clone(&counter))],
            Box::new(MemoryProgressStore::with_done(["a"])),
            Box::new(MemoryRunLock::new()),
        )
        .unwrap();

        let result = orch.run();
        assert!(result.is_success());
        assert_eq!(counter.get(), 1);
        assert_eq!(result.skipped_steps, vec!["a"]);
        assert_eq!(result.completed_steps, vec!["b"]);
    }

    #[test]
    fn test_lock_held_fails_without_running() {
        let counter = Rc::new(Cell::new(0));
        let lock = MemoryRunLock::new();
        let _held = lock.acquire().unwrap();

        let mut orch = Orchestrator::new(
            vec![counting_step("a", Rc::clone(&counter))],
            Box::new(MemoryProgressStore::new()),
            Box::new(lock.clone()),
        )
        .unwrap();
        let result = orch.run();

        assert_eq!(result.phase, RunPhase::Failed);
        assert!(result.error.as_ref().is_some_and(|e| e.is_lock_held()));
        assert_eq!(result.exit_code(), crate::error::EXIT_LOCK_HELD);
        assert_eq!(counter.get(), 0);
        assert_eq!(result.history.len(), 2);
    }

    #[test]
    fn test_lock_released_after_failure() {
        let lock = MemoryRunLock::new();
        let mut orch = Orchestrator::new(
            vec![InstallationStep::new("boom", |_| anyhow::bail!("exit status 100"))],
            Box::new(MemoryProgressStore::new()),
            Box::new(lock.clone()),
        )
        .unwrap();

        let result = orch.run();
        assert_eq!(result.phase, RunPhase::Failed);
        assert_eq!(result.failed_step.as_deref(), Some("boom"));
        assert!(!lock.is_held());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = Orchestrator::new(
            vec![
                InstallationStep::new("a", |_| Ok(())),
                InstallationStep::new("a", |_| Ok(())),
            ],
            Box::new(MemoryProgressStore::new()),
            Box::new(MemoryRunLock::new()),
        );
        assert!(matches!(result, Err(ProvisionError::Validation(_))));
    }

    #[test]
    fn test_plan_reports_skip_and_execute() {
        let orch = Orchestrator::new(
            vec![
                InstallationStep::new("a", |_| Ok(())),
                InstallationStep::new("b", |_| Ok(())).with_description("Install editors"),
            ],
            Box::new(MemoryProgressStore::with_done(["a"])),
            Box::new(MemoryRunLock::new()),
        )
        .unwrap();

        let plan = orch.plan().unwrap();
        assert!(matches!(plan[0].action, PlannedAction::Skip { completed_at: Some(_) }));
        assert_eq!(plan[1].action, PlannedAction::Execute);
        assert_eq!(plan[1].description, "Install editors");
    }

    #[test]
    fn test_empty_plan_completes() {
        let mut orch = Orchestrator::new(
            Vec::new(),
            Box::new(MemoryProgressStore::new()),
            Box::new(MemoryRunLock::new()),
        )
        .unwrap();
        let result = orch.run();
        assert_eq!(result.phase, RunPhase::Completed);
        assert!(result.completed_steps.is_empty());
    }
}
