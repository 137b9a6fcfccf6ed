//! Restore engine: put a backup set's files back where they came from.
//!
//! The live files are snapshotted into a `pre-restore` set before they are
//! overwritten, so a restore can itself be undone. Files are restored
//! independently; one failure does not stop the others.
//!
//! A set may hold several snapshots of one file. The earliest is the state
//! before the set's run touched it, and that is the one put back.

use crate::backup::{BackupEntry, BackupManager, SetKind, validate_set_id};
use crate::command::{ArgvCommand, run_command_safe};
use crate::error::{EXIT_FAILURE, ProvisionError, Result};
use crate::mutation_guard::{MutationGuard, match_owner, resolve_target};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Command run after a restore so services pick up restored files
/// (e.g. `systemctl reload sshd`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadHook {
    pub name: String,
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Only run when a restored path lies under this prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applies_to: Option<PathBuf>,
}

impl ReloadHook {
    /// Whether this hook is relevant for the restored paths
    pub fn applies(&self, restored: &[PathBuf]) -> bool {
        match &self.applies_to {
            None => !restored.is_empty(),
            Some(prefix) => restored.iter().any(|p| p.starts_with(prefix)),
        }
    }

    fn run(&self) -> anyhow::Result<()> {
        let cmd = ArgvCommand::new(&self.command)?;
        run_command_safe(&cmd)?.ensure_success(&self.name)
    }
}

/// One file that could not be restored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// One reload hook that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    pub hook: String,
    pub reason: String,
}

/// Outcome of [`RestoreEngine::restore`]
#[derive(Debug, Clone, Default)]
pub struct RestoreResult {
    pub set_id: String,
    /// Originals now holding their backed-up contents
    /// (in dry-run mode: originals that would be restored)
    pub restored: Vec<PathBuf>,
    pub failed: Vec<RestoreFailure>,
    /// Set holding the live files as they were before this restore
    pub pre_restore_set: Option<String>,
    pub hook_failures: Vec<HookFailure>,
    pub dry_run: bool,
}

impl RestoreResult {
    pub fn restored_count(&self) -> usize {
        self.restored.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// True if at least one file was restored or nothing failed
    pub fn is_success(&self) -> bool {
        !self.restored.is_empty() || self.failed.is_empty()
    }

    /// 0 when [`is_success`](Self::is_success) holds, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { EXIT_FAILURE }
    }

    /// Error out if any file failed
    pub fn ensure_complete(&self) -> Result<()> {
        if self.failed.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::RestorePartialFailure {
                restored: self.restored_count(),
                failed: self.failed_count(),
            })
        }
    }
}

/// Applies backup sets back onto the live filesystem
#[derive(Debug, Clone)]
pub struct RestoreEngine {
    manager: BackupManager,
    hooks: Vec<ReloadHook>,
    dry_run: bool,
}

impl RestoreEngine {
    pub fn new(manager: BackupManager) -> Self {
        Self {
            manager,
            hooks: Vec::new(),
            dry_run: false,
        }
    }

    pub fn with_hooks(mut self, hooks: Vec<ReloadHook>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Report what would be restored without touching any file
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Restore every file of `set_id`.
    ///
    /// `interactive` only affects logging; the engine never prompts.
    pub fn restore(&self, set_id: &str, interactive: bool) -> Result<RestoreResult> {
        validate_set_id(set_id)?;
        let manifest = self.manager.manifest(set_id)?;
        let entries = earliest_snapshots(&manifest.entries);
        info!(
            "Restoring backup set {} ({} file(s), {}{})",
            set_id,
            entries.len(),
            manifest.kind,
            if interactive { ", selected interactively" } else { "" }
        );

        let mut result = RestoreResult {
            set_id: set_id.to_string(),
            dry_run: self.dry_run,
            ..RestoreResult::default()
        };

        if self.dry_run {
            for entry in &entries {
                match check_payload(entry) {
                    Ok(()) => result.restored.push(entry.original.clone()),
                    Err(reason) => result.failed.push(RestoreFailure {
                        path: entry.original.clone(),
                        reason,
                    }),
                }
            }
            return Ok(result);
        }

        let mut guard = MutationGuard::with_set(
            self.manager
                .new_set(SetKind::PreRestore, Some(set_id.to_string())),
        );

        for entry in &entries {
            match restore_entry(&mut guard, entry) {
                Ok(()) => {
                    info!("Restored {:?}", entry.original);
                    result.restored.push(entry.original.clone());
                }
                Err(reason) => {
                    error!("Failed to restore {:?}: {}", entry.original, reason);
                    result.failed.push(RestoreFailure {
                        path: entry.original.clone(),
                        reason,
                    });
                }
            }
        }
        result.pre_restore_set = guard.set_id().map(str::to_string);

        for hook in self.hooks.iter().filter(|h| h.applies(&result.restored)) {
            match hook.run() {
                Ok(()) => info!("Reload hook '{}' succeeded", hook.name),
                Err(e) => {
                    warn!("Reload hook '{}' failed: {:#}", hook.name, e);
                    result.hook_failures.push(HookFailure {
                        hook: hook.name.clone(),
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        match &result.pre_restore_set {
            Some(id) => info!("Previous live files saved in backup set {}", id),
            None => debug!("No live files needed saving before restore"),
        }
        Ok(result)
    }
}

/// The first snapshot of every original, in manifest order
pub fn earliest_snapshots(entries: &[BackupEntry]) -> Vec<&BackupEntry> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .filter(|e| seen.insert(e.original.as_path()))
        .collect()
}

fn check_payload(entry: &BackupEntry) -> std::result::Result<(), String> {
    if entry.backup.is_file() {
        Ok(())
    } else {
        Err(format!("backup copy {:?} is missing", entry.backup))
    }
}

fn restore_entry(guard: &mut MutationGuard, entry: &BackupEntry) -> std::result::Result<(), String> {
    check_payload(entry)?;

    // The live file must be captured before it is replaced
    guard
        .guard(&entry.original)
        .map_err(|e| format!("pre-restore backup failed, file left untouched: {}", e))?;

    copy_into_place(entry).map_err(|e| e.to_string())
}

/// Copy the payload of `entry` over its original through a temporary
/// sibling and rename.
///
/// Symlinks at the original are written through. The owner recorded in the
/// entry is applied, falling back to the owner of the live file.
fn copy_into_place(entry: &BackupEntry) -> io::Result<()> {
    let to = resolve_target(&entry.original)?;
    let parent = match to.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let owner = match (entry.uid, entry.gid) {
        (Some(uid), Some(gid)) => Some((uid, gid)),
        _ => fs::metadata(&to).ok().map(|m| (m.uid(), m.gid())),
    };

    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(to.file_name().unwrap_or_default());
    tmp_name.push(".provisioner-restore");
    let tmp = parent.join(tmp_name);

    let result = (|| -> io::Result<()> {
        fs::copy(&entry.backup, &tmp)?;
        let file = fs::File::open(&tmp)?;
        if let Some((uid, gid)) = owner {
            match_owner(&file, uid, gid)?;
            file.set_permissions(fs::metadata(&entry.backup)?.permissions())?;
        }
        file.sync_all()?;
        fs::rename(&tmp, &to)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    struct Fixture {
        dir: tempfile::TempDir,
        manager: BackupManager,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let manager = BackupManager::new(dir.path().join("backups"));
            Self { dir, manager }
        }

        fn file(&self, rel: &str, content: &str) -> PathBuf {
            let path = self.dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            path
        }

        /// Back up the given files into a run set, then overwrite them
        fn run_set(&self, files: &[&PathBuf]) -> String {
            let mut guard = MutationGuard::with_set(self.manager.new_set(SetKind::Run, None));
            for f in files {
                guard.write(f, "changed").unwrap();
            }
            guard.set_id().unwrap().to_string()
        }
    }

    #[test]
    fn test_round_trip_restores_content_and_mode() {
        let fx = Fixture::new();
        let a = fx.file("etc/a.conf", "alpha");
        fs::set_permissions(&a, fs::Permissions::from_mode(0o600)).unwrap();
        let b = fx.file("etc/b.conf", "beta");
        let id = fx.run_set(&[&a, &b]);

        let result = RestoreEngine::new(fx.manager.clone()).restore(&id, false).unwrap();

        assert_eq!(result.restored_count(), 2);
        assert_eq!(result.failed_count(), 0);
        assert!(result.ensure_complete().is_ok());
        assert_eq!(fs::read_to_string(&a).unwrap(), "alpha");
        assert_eq!(fs::read_to_string(&b).unwrap(), "beta");
        assert_eq!(fs::metadata(&a).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_pre_restore_set_captures_live_state() {
        let fx = Fixture::new();
        let a = fx.file("a", "original");
        let id = fx.run_set(&[&a]);

        let result = RestoreEngine::new(fx.manager.clone()).restore(&id, true).unwrap();
        let pre = result.pre_restore_set.clone().unwrap();

        let meta = fx.manager.get(&pre).unwrap();
        assert_eq!(meta.kind, SetKind::PreRestore);
        assert_eq!(meta.source_set.as_deref(), Some(id.as_str()));
        let entries = fx.manager.inspect(&pre).unwrap();
        assert_eq!(fs::read_to_string(&entries[0].backup).unwrap(), "changed");
    }

    #[test]
    fn test_missing_original_is_recreated() {
        let fx = Fixture::new();
        let a = fx.file("deep/dir/a", "content");
        let id = fx.run_set(&[&a]);
        fs::remove_dir_all(fx.dir.path().join("deep")).unwrap();

        let result = RestoreEngine::new(fx.manager.clone()).restore(&id, false).unwrap();
        assert_eq!(result.restored_count(), 1);
        assert_eq!(fs::read_to_string(&a).unwrap(), "content");
        // nothing existed to capture
        assert!(result.pre_restore_set.is_none());
    }

    #[test]
    fn test_partial_failure_restores_the_rest() {
        let fx = Fixture::new();
        let a = fx.file("a", "A");
        let b = fx.file("b", "B");
        let id = fx.run_set(&[&a, &b]);

        let entries = fx.manager.inspect(&id).unwrap();
        let lost = entries.iter().find(|e| e.original == a).unwrap();
        fs::remove_file(&lost.backup).unwrap();

        let result = RestoreEngine::new(fx.manager.clone()).restore(&id, false).unwrap();
        assert_eq!(result.restored, vec![b.clone()]);
        assert_eq!(result.failed_count(), 1);
        assert!(result.is_success());
        assert_eq!(result.exit_code(), 0);
        assert!(matches!(
            result.ensure_complete(),
            Err(ProvisionError::RestorePartialFailure { restored: 1, failed: 1 })
        ));
        assert_eq!(fs::read_to_string(&a).unwrap(), "changed");
    }

    #[test]
    fn test_nothing_restored_is_a_failure() {
        let fx = Fixture::new();
        let a = fx.file("a", "A");
        let id = fx.run_set(&[&a]);
        for entry in fx.manager.inspect(&id).unwrap() {
            fs::remove_file(&entry.backup).unwrap();
        }

        let result = RestoreEngine::new(fx.manager.clone()).restore(&id, false).unwrap();
        assert!(!result.is_success());
        assert_eq!(result.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn test_earliest_snapshot_is_restored() {
        let fx = Fixture::new();
        let a = fx.file("etc/hosts", "v0");
        let mut guard = MutationGuard::with_set(fx.manager.new_set(SetKind::Run, None));
        guard.write(&a, "v1").unwrap();
        guard.write(&a, "v2").unwrap();
        let id = guard.set_id().unwrap().to_string();
        assert_eq!(fx.manager.inspect(&id).unwrap().len(), 2);

        let result = RestoreEngine::new(fx.manager.clone()).restore(&id, false).unwrap();
        assert_eq!(result.restored, vec![a.clone()]);
        assert_eq!(fs::read_to_string(&a).unwrap(), "v0");

        let pre = fx.manager.inspect(&result.pre_restore_set.unwrap()).unwrap();
        assert_eq!(pre.len(), 1);
        assert_eq!(fs::read_to_string(&pre[0].backup).unwrap(), "v2");
    }

    #[test]
    fn test_restore_writes_through_symlink() {
        let fx = Fixture::new();
        let real = fx.file("run/stub-resolv.conf", "original");
        let link = fx.dir.path().join("resolv.conf");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let id = fx.run_set(&[&link]);
        assert_eq!(fs::read_to_string(&real).unwrap(), "changed");

        let result = RestoreEngine::new(fx.manager.clone()).restore(&id, false).unwrap();
        assert_eq!(result.restored_count(), 1);
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&real).unwrap(), "original");
    }

    #[test]
    fn test_restore_keeps_owner() {
        let fx = Fixture::new();
        let a = fx.file("home/alice/.bashrc", "alias ll='ls -l'");
        // Only root can hand a file to another user
        if fs::metadata(&a).unwrap().uid() == 0 {
            std::os::unix::fs::chown(&a, Some(1000), Some(1000)).unwrap();
        }
        let before = fs::metadata(&a).unwrap();
        let id = fx.run_set(&[&a]);

        RestoreEngine::new(fx.manager.clone()).restore(&id, false).unwrap();
        let after = fs::metadata(&a).unwrap();
        assert_eq!((after.uid(), after.gid()), (before.uid(), before.gid()));
        assert_eq!(fs::read_to_string(&a).unwrap(), "alias ll='ls -l'");
    }

    #[test]
    fn test_unknown_set_is_not_found() {
        let fx = Fixture::new();
        let engine = RestoreEngine::new(fx.manager.clone());
        assert!(matches!(
            engine.restore("20000101_000000", false),
            Err(ProvisionError::BackupSetNotFound(_))
        ));
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let fx = Fixture::new();
        let a = fx.file("a", "A");
        let id = fx.run_set(&[&a]);

        let result = RestoreEngine::new(fx.manager.clone())
            .dry_run(true)
            .restore(&id, false)
            .unwrap();
        assert!(result.dry_run);
        assert_eq!(result.restored, vec![a.clone()]);
        assert_eq!(fs::read_to_string(&a).unwrap(), "changed");
        assert_eq!(fx.manager.list().unwrap().len(), 1);
    }

    #[test]
    fn test_hooks_run_and_failures_are_itemized() {
        let fx = Fixture::new();
        let a = fx.file("etc/ssh/sshd_config", "Port 22");
        let id = fx.run_set(&[&a]);
        let marker = fx.dir.path().join("reloaded");

        let hooks = vec![
            ReloadHook {
                name: "touch".into(),
                command: vec!["touch".into(), marker.to_string_lossy().into_owned()],
                applies_to: Some(fx.dir.path().join("etc/ssh")),
            },
            ReloadHook {
                name: "broken".into(),
                command: vec!["false".into()],
                applies_to: None,
            },
            ReloadHook {
                name: "unrelated".into(),
                command: vec!["false".into()],
                applies_to: Some(PathBuf::from("/nonexistent/prefix")),
            },
        ];

        let result = RestoreEngine::new(fx.manager.clone())
            .with_hooks(hooks)
            .restore(&id, false)
            .unwrap();

        assert!(marker.exists());
        assert_eq!(result.hook_failures.len(), 1);
        assert_eq!(result.hook_failures[0].hook, "broken");
        assert!(result.ensure_complete().is_ok());
    }
}
