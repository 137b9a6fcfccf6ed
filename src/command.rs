//! External command execution
//!
//! Every child process the provisioner starts (package managers, step
//! commands, reload hooks, deferred actions) goes through
//! [`run_command_safe`], which:
//!
//! - spawns the child in its own process group with a parent-death signal
//! - registers the PID in the global cleanup registry while it runs
//! - captures stdout and stderr
//!
//! Callers describe the invocation through the [`CommandArgs`] trait instead
//! of assembling `Command`s themselves.

use crate::process_guard::{CleanupRegistry, CommandProcessGroup};
use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Typed description of one external invocation
pub trait CommandArgs {
    /// Executable name or path
    fn program(&self) -> &str;

    /// Arguments, exactly as passed to the program
    fn to_cli_args(&self) -> Vec<String>;

    /// Extra environment variables
    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// A plain argv with optional environment, as read from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgvCommand {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ArgvCommand {
    /// Build from an argv; fails on an empty list
    pub fn new(argv: &[String]) -> Result<Self> {
        if argv.first().is_none_or(|p| p.trim().is_empty()) {
            anyhow::bail!("command must name a program");
        }
        Ok(Self {
            argv: argv.to_vec(),
            env: Vec::new(),
        })
    }
}

impl CommandArgs for ArgvCommand {
    fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    fn to_cli_args(&self) -> Vec<String> {
        self.argv.iter().skip(1).cloned().collect()
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.env.clone()
    }
}

/// Output from a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Turn a non-zero exit into an error carrying stderr
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            return Ok(());
        }
        match self.exit_code {
            Some(code) => anyhow::bail!(
                "{} failed (exit status {}): {}",
                context,
                code,
                self.stderr.trim()
            ),
            None => anyhow::bail!("{} was killed by a signal: {}", context, self.stderr.trim()),
        }
    }
}

/// Run a command in its own process group and wait for it.
///
/// A non-zero exit is not an error here; use
/// [`CommandOutput::ensure_success`] to make it one.
pub fn run_command_safe<T: CommandArgs + ?Sized>(args: &T) -> Result<CommandOutput> {
    let program = args.program();
    let cli_args = args.to_cli_args();
    let env_vars = args.get_env_vars();

    info!("Running {} {:?}", program, cli_args);
    if !env_vars.is_empty() {
        debug!("Environment for {}: {:?}", program, env_vars);
    }

    let mut cmd = Command::new(program);
    cmd.args(&cli_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();
    for (key, value) in &env_vars {
        cmd.env(key, value);
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;
    let pid = child.id();
    if let Ok(mut registry) = CleanupRegistry::global().lock() {
        registry.register(pid);
    }

    let output = child.wait_with_output();

    if let Ok(mut registry) = CleanupRegistry::global().lock() {
        registry.unregister(pid);
    }
    let output = output.with_context(|| format!("Failed waiting for {}", program))?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
        success: output.status.success(),
    };

    if result.success {
        debug!("{} exited successfully", program);
    } else {
        warn!("{} failed with exit code {:?}", program, result.exit_code);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_argv_rejected() {
        assert!(ArgvCommand::new(&[]).is_err());
        assert!(ArgvCommand::new(&argv(&["  "])).is_err());
    }

    #[test]
    fn test_captures_stdout_and_success() {
        let cmd = ArgvCommand::new(&argv(&["sh", "-c", "echo hello"])).unwrap();
        let out = run_command_safe(&cmd).unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.ensure_success("echo").is_ok());
    }

    #[test]
    fn test_nonzero_exit_is_reported() {
        let cmd = ArgvCommand::new(&argv(&["sh", "-c", "echo oops >&2; exit 100"])).unwrap();
        let out = run_command_safe(&cmd).unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(100));
        let err = out.ensure_success("apt-get install").unwrap_err();
        assert!(err.to_string().contains("exit status 100"));
        assert!(err.to_string().contains("oops"));
    }

    #[test]
    fn test_env_is_passed() {
        let cmd = ArgvCommand {
            env: vec![("PROVISION_TEST".into(), "yes".into())],
            ..ArgvCommand::new(&argv(&["sh", "-c", "printf %s \"$PROVISION_TEST\""])).unwrap()
        };
        let out = run_command_safe(&cmd).unwrap();
        assert_eq!(out.stdout, "yes");
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let cmd = ArgvCommand::new(&argv(&["/nonexistent/provisioner-test-binary"])).unwrap();
        assert!(run_command_safe(&cmd).is_err());
    }
}
