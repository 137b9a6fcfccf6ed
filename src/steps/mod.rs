//! Configurable step kinds
//!
//! A plan in the configuration file is a list of [`StepSpec`]s. Each spec is
//! turned into an [`InstallationStep`] whose action is built here:
//!
//! - `command`: run a program, optionally guarding files it rewrites
//! - `packages`: install whatever is not installed yet
//! - `write_file`: put a file's contents in place behind a backup
//! - `defer`: queue a command for `--run-pending`

pub mod command;
pub mod files;
pub mod packages;

use crate::deferred::{PendingAction, PendingQueue};
use crate::error::Result;
use crate::package_query::PackageQuery;
use crate::step::InstallationStep;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// One step as written in the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub action: StepActionSpec,
}

/// What a configured step does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepActionSpec {
    Command {
        command: Vec<String>,
        /// Files the command rewrites; backed up before it runs
        #[serde(default)]
        guards: Vec<PathBuf>,
        /// Retry the command with the run's policy
        #[serde(default)]
        retry: bool,
    },
    Packages {
        packages: Vec<String>,
    },
    WriteFile {
        path: PathBuf,
        content: String,
        /// Octal mode such as `0o644`, applied after writing
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
        #[serde(default)]
        append: bool,
    },
    Defer {
        command: Vec<String>,
    },
}

/// Collaborators configured steps may need
#[derive(Clone)]
pub struct StepEnv {
    pub packages: Arc<dyn PackageQuery>,
    pub pending: PendingQueue,
}

/// Build runnable steps from their specs, in order
pub fn build_steps(specs: &[StepSpec], env: &StepEnv) -> Result<Vec<InstallationStep>> {
    specs.iter().map(|spec| build_step(spec, env)).collect()
}

fn build_step(spec: &StepSpec, env: &StepEnv) -> Result<InstallationStep> {
    let step = match &spec.action {
        StepActionSpec::Command {
            command,
            guards,
            retry,
        } => command::command_step(&spec.name, command, guards.clone(), *retry)?,
        StepActionSpec::Packages { packages } => {
            packages::packages_step(&spec.name, packages.clone(), Arc::clone(&env.packages))?
        }
        StepActionSpec::WriteFile {
            path,
            content,
            mode,
            append,
        } => files::write_file_step(&spec.name, path.clone(), content.clone(), *mode, *append),
        StepActionSpec::Defer { command } => {
            defer_step(&spec.name, command.clone(), env.pending.clone())
        }
    };

    Ok(match &spec.description {
        Some(description) => step.with_description(description),
        None => step,
    })
}

fn defer_step(name: &str, command: Vec<String>, queue: PendingQueue) -> InstallationStep {
    let description = format!("queue `{}` for later", command.join(" "));
    InstallationStep::new(name, move |ctx| {
        let action = PendingAction::new(ctx.step(), command.join(" "), command.clone());
        queue.enqueue(action)?;
        Ok(())
    })
    .with_description(description)
}
