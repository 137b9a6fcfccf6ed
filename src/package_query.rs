//! Package status queries and installs for the host package manager.
//!
//! Callers only ever see [`PackageStatus`]; the text each tool prints stays
//! inside this module.

use crate::command::{run_command_safe, ArgvCommand, CommandOutput};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};

/// Installation state of one package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum PackageStatus {
    Installed,
    NotInstalled,
    /// The query itself failed; treat as "needs install"
    Unknown,
}

/// Supported package managers
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PackageManagerKind {
    /// dpkg / apt-get
    #[default]
    Apt,
    /// pacman
    Pacman,
}

/// Answers "is this package installed?"
pub trait PackageQuery {
    fn status(&self, package: &str) -> PackageStatus;

    /// Install every package in `packages` in one transaction
    fn install(&self, packages: &[String]) -> Result<()>;
}

/// Package manager of the running host
#[derive(Debug, Clone, Copy)]
pub struct SystemPackages {
    kind: PackageManagerKind,
}

impl SystemPackages {
    pub fn new(kind: PackageManagerKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> PackageManagerKind {
        self.kind
    }

    fn query_command(&self, package: &str) -> Vec<String> {
        match self.kind {
            PackageManagerKind::Apt => vec![
                "dpkg-query".into(),
                "-W".into(),
                "-f=${Status}".into(),
                package.into(),
            ],
            PackageManagerKind::Pacman => vec!["pacman".into(), "-Q".into(), package.into()],
        }
    }

    /// Non-interactive install invocation
    pub fn install_command(&self, packages: &[String]) -> ArgvCommand {
        let mut argv: Vec<String> = match self.kind {
            PackageManagerKind::Apt => vec!["apt-get".into(), "install".into(), "-y".into()],
            PackageManagerKind::Pacman => {
                vec!["pacman".into(), "-S".into(), "--needed".into(), "--noconfirm".into()]
            }
        };
        argv.extend(packages.iter().cloned());
        ArgvCommand {
            argv,
            env: match self.kind {
                PackageManagerKind::Apt => {
                    vec![("DEBIAN_FRONTEND".into(), "noninteractive".into())]
                }
                PackageManagerKind::Pacman => Vec::new(),
            },
        }
    }
}

impl PackageQuery for SystemPackages {
    fn status(&self, package: &str) -> PackageStatus {
        if !is_valid_package_name(package) {
            warn!("Refusing to query invalid package name {:?}", package);
            return PackageStatus::Unknown;
        }
        let cmd = ArgvCommand {
            argv: self.query_command(package),
            env: Vec::new(),
        };
        let status = match run_command_safe(&cmd) {
            Ok(output) => match self.kind {
                PackageManagerKind::Apt => parse_dpkg_status(&output),
                PackageManagerKind::Pacman => parse_pacman_status(&output),
            },
            Err(e) => {
                warn!("Package query for {} failed: {:#}", package, e);
                PackageStatus::Unknown
            }
        };
        debug!("Package {} is {}", package, status);
        status
    }

    fn install(&self, packages: &[String]) -> Result<()> {
        if let Some(bad) = packages.iter().find(|p| !is_valid_package_name(p)) {
            anyhow::bail!("invalid package name {:?}", bad);
        }
        let cmd = self.install_command(packages);
        run_command_safe(&cmd)
            .with_context(|| format!("Failed to run {}", cmd.argv.join(" ")))?
            .ensure_success(&format!("{} install", self.kind))
    }
}

/// Package names are plain tokens; anything else is rejected before it can
/// reach a command line
pub fn is_valid_package_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-' | '_' | ':' | '@'))
}

/// `dpkg-query -W -f='${Status}'` prints e.g. `install ok installed`
fn parse_dpkg_status(output: &CommandOutput) -> PackageStatus {
    if output.success {
        let installed = output
            .stdout
            .split_whitespace()
            .last()
            .is_some_and(|state| state == "installed");
        if installed {
            PackageStatus::Installed
        } else {
            // config-files, half-installed, not-installed
            PackageStatus::NotInstalled
        }
    } else if output.exit_code == Some(1)
        && output.stderr.to_lowercase().contains("no packages found")
    {
        PackageStatus::NotInstalled
    } else {
        PackageStatus::Unknown
    }
}

/// `pacman -Q` exits 0 with `name version`, or 1 with "was not found"
fn parse_pacman_status(output: &CommandOutput) -> PackageStatus {
    if output.success && !output.stdout.trim().is_empty() {
        PackageStatus::Installed
    } else if output.exit_code == Some(1) && output.stderr.contains("was not found") {
        PackageStatus::NotInstalled
    } else {
        PackageStatus::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn output(success: bool, code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: Some(code),
            success,
        }
    }

    #[test]
    fn test_dpkg_status_parsing() {
        assert_eq!(
            parse_dpkg_status(&output(true, 0, "install ok installed", "")),
            PackageStatus::Installed
        );
        assert_eq!(
            parse_dpkg_status(&output(true, 0, "deinstall ok config-files", "")),
            PackageStatus::NotInstalled
        );
        assert_eq!(
            parse_dpkg_status(&output(
                false,
                1,
                "",
                "dpkg-query: no packages found matching vim"
            )),
            PackageStatus::NotInstalled
        );
        assert_eq!(
            parse_dpkg_status(&output(false, 2, "", "dpkg-query: error: lock")),
            PackageStatus::Unknown
        );
    }

    #[test]
    fn test_pacman_status_parsing() {
        assert_eq!(
            parse_pacman_status(&output(true, 0, "vim 9.1.0-1\n", "")),
            PackageStatus::Installed
        );
        assert_eq!(
            parse_pacman_status(&output(false, 1, "", "error: package 'vim' was not found")),
            PackageStatus::NotInstalled
        );
        assert_eq!(
            parse_pacman_status(&output(false, 1, "", "error: could not open database")),
            PackageStatus::Unknown
        );
    }

    #[test]
    fn test_install_command_shapes() {
        let pkgs = vec!["vim".to_string(), "git".to_string()];
        let apt = SystemPackages::new(PackageManagerKind::Apt).install_command(&pkgs);
        assert_eq!(apt.argv, vec!["apt-get", "install", "-y", "vim", "git"]);
        assert_eq!(apt.env, vec![("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())]);

        let pacman = SystemPackages::new(PackageManagerKind::Pacman).install_command(&pkgs);
        assert_eq!(pacman.argv[..4], ["pacman", "-S", "--needed", "--noconfirm"]);
    }

    #[test]
    fn test_package_name_validation() {
        assert!(is_valid_package_name("libssl3"));
        assert!(is_valid_package_name("g++"));
        assert!(is_valid_package_name("python3.12"));
        assert!(!is_valid_package_name(""));
        assert!(!is_valid_package_name("--force"));
        assert!(!is_valid_package_name("vim; rm -rf /"));
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(PackageManagerKind::from_str("pacman").unwrap(), PackageManagerKind::Pacman);
        assert_eq!(PackageManagerKind::Apt.to_string(), "apt");
        assert_eq!(PackageStatus::NotInstalled.as_ref(), "not-installed");
    }
}
