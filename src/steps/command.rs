//! `command` steps: run one external program.

use crate::command::{run_command_safe, ArgvCommand};
use crate::error::{ProvisionError, Result};
use crate::step::InstallationStep;
use anyhow::Context;
use std::path::PathBuf;

/// Step running `argv`, after backing up every path in `guards`
pub fn command_step(
    name: &str,
    argv: &[String],
    guards: Vec<PathBuf>,
    retry: bool,
) -> Result<InstallationStep> {
    let cmd = ArgvCommand::new(argv)
        .map_err(|e| ProvisionError::config(format!("step '{}': {}", name, e)))?;
    let description = format!("run `{}`", argv.join(" "));

    Ok(InstallationStep::new(name, move |ctx| {
        for path in &guards {
            ctx.guard(path)
                .with_context(|| format!("cannot protect {:?} before running command", path))?;
        }

        let label = cmd.argv.join(" ");
        if retry {
            ctx.retry(&label, |_| {
                run_command_safe(&cmd).and_then(|out| out.ensure_success(&label))
            })?;
        } else {
            run_command_safe(&cmd)?.ensure_success(&label)?;
        }
        Ok(())
    })
    .with_description(description))
}
