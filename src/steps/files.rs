//! `write_file` steps: put contents in place behind a backup.

use crate::step::InstallationStep;
use anyhow::Context;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::debug;

/// Step writing (or appending) `content` to `path`.
///
/// Already-applied contents and mode are left alone, so re-running the step
/// neither rewrites the file nor takes another backup. A mode change on a
/// file the step did not rewrite is guarded like any other mutation.
pub fn write_file_step(
    name: &str,
    path: PathBuf,
    content: String,
    mode: Option<u32>,
    append: bool,
) -> InstallationStep {
    let description = if append {
        format!("append to {}", path.display())
    } else {
        format!("write {}", path.display())
    };

    InstallationStep::new(name, move |ctx| {
        let current = fs::read_to_string(&path).ok();
        let applied = match (&current, append) {
            (Some(existing), false) => *existing == content,
            (Some(existing), true) => existing.contains(content.as_str()),
            (None, _) => false,
        };

        if applied {
            debug!("{:?} already has the wanted contents", path);
        } else if append {
            ctx.append_file(&path, &content)?;
        } else {
            ctx.write_file(&path, &content)?;
        }

        if let Some(mode) = mode {
            let current = fs::metadata(&path)
                .with_context(|| format!("Failed to read mode of {:?}", path))?
                .permissions()
                .mode()
                & 0o7777;
            if current != mode {
                if applied {
                    ctx.guard(&path)?;
                }
                fs::set_permissions(&path, fs::Permissions::from_mode(mode))
                    .with_context(|| format!("Failed to set mode {:o} on {:?}", mode, path))?;
            }
        }
        Ok(())
    })
    .with_description(description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupManager, SetKind};
    use crate::mutation_guard::MutationGuard;
    use crate::retry::RetryPolicy;
    use crate::step::StepContext;

    fn run(step: &mut InstallationStep, guard: &mut MutationGuard) {
        let name = step.name().to_string();
        let mut ctx = StepContext::new(&name, guard, RetryPolicy::once());
        step.execute(&mut ctx).unwrap();
    }

    #[test]
    fn test_write_backs_up_existing_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path().join("backups"));
        let target = dir.path().join("motd");
        fs::write(&target, "old\n").unwrap();

        let mut step =
            write_file_step("motd", target.clone(), "welcome\n".into(), Some(0o644), false);
        let mut guard = MutationGuard::with_set(manager.new_set(SetKind::Run, None));
        run(&mut step, &mut guard);
        run(&mut step, &mut guard);

        assert_eq!(fs::read_to_string(&target).unwrap(), "welcome\n");
        assert_eq!(guard.taken().len(), 1);
        assert_eq!(fs::read_to_string(&guard.taken()[0].backup).unwrap(), "old\n");
        assert_eq!(fs::metadata(&target).unwrap().permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn test_matching_mode_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sudoers.d-admin");
        fs::write(&target, "%admin ALL=(ALL) ALL\n").unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o440)).unwrap();

        let mut step = write_file_step(
            "sudoers",
            target.clone(),
            "%admin ALL=(ALL) ALL\n".into(),
            Some(0o440),
            false,
        );
        let mut guard = MutationGuard::sibling();
        run(&mut step, &mut guard);

        assert!(guard.taken().is_empty());
        assert_eq!(fs::metadata(&target).unwrap().permissions().mode() & 0o777, 0o440);
    }

    #[test]
    fn test_mode_change_alone_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("id_ed25519");
        fs::write(&target, "key\n").unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o644)).unwrap();

        let mut step = write_file_step("key", target.clone(), "key\n".into(), Some(0o600), false);
        let mut guard = MutationGuard::sibling();
        run(&mut step, &mut guard);
        run(&mut step, &mut guard);

        assert_eq!(guard.taken().len(), 1);
        let backup = &guard.taken()[0].backup;
        assert_eq!(fs::metadata(backup).unwrap().permissions().mode() & 0o777, 0o644);
        assert_eq!(fs::metadata(&target).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_append_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("bashrc");
        fs::write(&target, "export A=1\n").unwrap();

        let mut step = write_file_step("bashrc", target.clone(), "alias ll='ls -l'\n".into(), None, true);
        let mut guard = MutationGuard::sibling();
        run(&mut step, &mut guard);
        run(&mut step, &mut guard);

        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            "export A=1\nalias ll='ls -l'\n"
        );
        assert_eq!(guard.taken().len(), 1);
    }
}
