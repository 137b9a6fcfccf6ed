use clap::{ArgGroup, Parser};
use std::path::PathBuf;

/// Provisioner - resumable machine provisioning with backups and rollback
#[derive(Parser, Debug)]
#[command(name = "provisioner")]
#[command(about = "Run a provisioning plan step by step, backing up every file it changes")]
#[command(version)]
#[command(group(ArgGroup::new("action").multiple(false)))]
pub struct Cli {
    /// Show what would be done without changing anything.
    ///
    /// For a run: list which steps would execute and which are already done.
    /// With --rollback: list the files that would be restored.
    #[arg(long)]
    pub dry_run: bool,

    /// Restore a backup set (pick one interactively when no ID is given)
    #[arg(long, value_name = "ID", num_args = 0..=1, group = "action")]
    pub rollback: Option<Option<String>>,

    /// Do not ask for confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// List backup sets, newest first
    #[arg(long, group = "action")]
    pub list_backups: bool,

    /// Show the files captured in one backup set
    #[arg(long, value_name = "ID", group = "action")]
    pub inspect_backup: Option<String>,

    /// Delete all but the N most recent backup sets (default from config)
    #[arg(long, value_name = "N", num_args = 0..=1, group = "action")]
    pub cleanup_backups: Option<Option<usize>>,

    /// Show which steps are recorded as done
    #[arg(long, group = "action")]
    pub status: bool,

    /// Forget all recorded progress so every step runs again
    #[arg(long, group = "action")]
    pub reset_progress: bool,

    /// Run deferred actions queued by earlier runs
    #[arg(long, group = "action")]
    pub run_pending: bool,

    /// Remove a run lock left behind by a crashed run
    #[arg(long, group = "action")]
    pub unlock: bool,

    /// Path to the configuration file
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory for progress, lock, backups and pending actions
    #[arg(long, value_name = "PATH")]
    pub state_dir: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
}

/// What the invocation asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Run,
    Plan,
    Rollback { id: Option<String> },
    ListBackups,
    InspectBackup(String),
    CleanupBackups { keep: Option<usize> },
    Status,
    ResetProgress,
    RunPending,
    Unlock,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn mode(&self) -> Mode {
        if let Some(id) = &self.rollback {
            return Mode::Rollback {
                id: id.clone().filter(|s| !s.is_empty()),
            };
        }
        if self.list_backups {
            return Mode::ListBackups;
        }
        if let Some(id) = &self.inspect_backup {
            return Mode::InspectBackup(id.clone());
        }
        if let Some(keep) = self.cleanup_backups {
            return Mode::CleanupBackups { keep };
        }
        if self.status {
            return Mode::Status;
        }
        if self.reset_progress {
            return Mode::ResetProgress;
        }
        if self.run_pending {
            return Mode::RunPending;
        }
        if self.unlock {
            return Mode::Unlock;
        }
        if self.dry_run {
            Mode::Plan
        } else {
            Mode::Run
        }
    }

    /// Default log filter for the verbosity flags
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}
