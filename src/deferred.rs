//! Deferred actions: commands queued during a run for a later moment
//! (e.g. after a reboot), executed with `--run-pending`.
//!
//! The queue is a JSON-lines file. Draining runs every action once; the ones
//! that fail stay queued for the next drain.

use crate::clock::unix_now;
use crate::command::{run_command_safe, ArgvCommand};
use crate::error::{ProvisionError, Result};
use crate::mutation_guard::atomic_write;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One queued command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Step that queued the action
    pub step: String,
    pub description: String,
    pub command: Vec<String>,
    pub queued_at: u64,
}

impl PendingAction {
    pub fn new(step: impl Into<String>, description: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            step: step.into(),
            description: description.into(),
            command,
            queued_at: unix_now(),
        }
    }
}

/// Outcome of [`PendingQueue::drain`]
#[derive(Debug, Default)]
pub struct DrainReport {
    pub succeeded: Vec<PendingAction>,
    /// Actions left in the queue, with the error they failed with
    pub failed: Vec<(PendingAction, String)>,
}

/// File-backed queue of deferred actions
#[derive(Debug, Clone)]
pub struct PendingQueue {
    path: PathBuf,
}

impl PendingQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an action unless an identical command is already queued
    pub fn enqueue(&self, action: PendingAction) -> Result<bool> {
        if action.command.is_empty() {
            return Err(ProvisionError::validation("Deferred action has no command"));
        }
        if self.load()?.iter().any(|a| a.command == action.command) {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(&action)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        info!("Queued deferred action: {}", action.description);
        Ok(true)
    }

    /// Queued actions in order; unreadable lines are skipped
    pub fn load(&self) -> Result<Vec<PendingAction>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .filter_map(|(idx, l)| match serde_json::from_str(l) {
                Ok(action) => Some(action),
                Err(e) => {
                    warn!("Skipping unreadable deferred action at line {}: {}", idx + 1, e);
                    None
                }
            })
            .collect())
    }

    /// Run every queued action once with `runner`; failures stay queued
    pub fn drain<F>(&self, mut runner: F) -> Result<DrainReport>
    where
        F: FnMut(&PendingAction) -> anyhow::Result<()>,
    {
        let mut report = DrainReport::default();
        for action in self.load()? {
            match runner(&action) {
                Ok(()) => {
                    info!("Deferred action done: {}", action.description);
                    report.succeeded.push(action);
                }
                Err(e) => {
                    warn!("Deferred action failed, keeping it queued: {}: {:#}", action.description, e);
                    report.failed.push((action, format!("{:#}", e)));
                }
            }
        }

        if report.failed.is_empty() {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            let mut remaining = String::new();
            for (action, _) in &report.failed {
                remaining.push_str(&serde_json::to_string(action)?);
                remaining.push('\n');
            }
            atomic_write(&self.path, remaining.as_bytes())?;
        }
        Ok(report)
    }

    /// Drain by running each action's command
    pub fn run_pending(&self) -> Result<DrainReport> {
        self.drain(|action| {
            let cmd = ArgvCommand::new(&action.command)?;
            run_command_safe(&cmd)?.ensure_success(&action.description)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(name: &str) -> PendingAction {
        PendingAction::new("late", name, vec!["echo".into(), name.into()])
    }

    #[test]
    fn test_enqueue_and_load_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingQueue::new(dir.path().join("state/pending"));
        assert!(queue.enqueue(action("one")).unwrap());
        assert!(queue.enqueue(action("two")).unwrap());
        // same command again is not queued twice
        assert!(!queue.enqueue(action("one")).unwrap());

        let loaded: Vec<String> = queue.load().unwrap().into_iter().map(|a| a.description).collect();
        assert_eq!(loaded, vec!["one", "two"]);
    }

    #[test]
    fn test_drain_keeps_failures() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingQueue::new(dir.path().join("pending"));
        queue.enqueue(action("ok")).unwrap();
        queue.enqueue(action("bad")).unwrap();

        let report = queue
            .drain(|a| {
                if a.description == "bad" {
                    anyhow::bail!("service not up yet")
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 1);
        let left = queue.load().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].description, "bad");
    }

    #[test]
    fn test_full_drain_removes_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingQueue::new(dir.path().join("pending"));
        queue.enqueue(PendingAction::new("s", "true", vec!["true".into()])).unwrap();

        let report = queue.run_pending().unwrap();
        assert_eq!(report.succeeded.len(), 1);
        assert!(!queue.path().exists());
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending");
        let good = serde_json::to_string(&action("good")).unwrap();
        fs::write(&path, format!("{{not json\n{}\n", good)).unwrap();

        let queue = PendingQueue::new(&path);
        assert_eq!(queue.load().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingQueue::new(dir.path().join("pending"));
        assert!(queue.enqueue(PendingAction::new("s", "nothing", Vec::new())).is_err());
    }
}
