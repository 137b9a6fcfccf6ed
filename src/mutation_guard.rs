//! Mutation guard: no existing file is modified before a copy of it exists.
//!
//! Every write helper here backs the target up first and refuses to touch the
//! file when that backup cannot be made. Missing targets need no protection.

use crate::backup::{absolute, normalize, BackupEntry, BackupSession};
use crate::clock;
use crate::error::{ProvisionError, Result};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Marker between a file name and its backup timestamp
pub const BACKUP_MARKER: &str = ".backup.";

const MAX_SYMLINK_HOPS: usize = 40;

/// Where guarded copies go
pub enum BackupSink {
    /// Next to the original as `<path>.backup.<YYYYmmdd_HHMMSS>`
    Sibling,
    /// Into a backup set directory
    Set(BackupSession),
}

/// Guards file mutations with backups
pub struct MutationGuard {
    sink: BackupSink,
    taken: Vec<BackupEntry>,
}

impl MutationGuard {
    pub fn new(sink: BackupSink) -> Self {
        Self {
            sink,
            taken: Vec::new(),
        }
    }

    /// Guard writing sibling backups
    pub fn sibling() -> Self {
        Self::new(BackupSink::Sibling)
    }

    /// Guard collecting backups into `session`
    pub fn with_set(session: BackupSession) -> Self {
        Self::new(BackupSink::Set(session))
    }

    /// Backup set id, once something was captured into a set
    pub fn set_id(&self) -> Option<&str> {
        match &self.sink {
            BackupSink::Set(session) => session.id(),
            BackupSink::Sibling => None,
        }
    }

    /// Backups created through this guard, in order
    pub fn taken(&self) -> &[BackupEntry] {
        &self.taken
    }

    /// Snapshot `path` before it is mutated.
    ///
    /// Returns `Ok(None)` if the path does not exist. Any error means the
    /// caller must not go on to mutate the file.
    pub fn guard(&mut self, path: &Path) -> Result<Option<BackupEntry>> {
        let path = normalize(&absolute(path));
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{:?} does not exist, nothing to back up", path);
                return Ok(None);
            }
            Err(e) => return Err(ProvisionError::backup(&path, e.to_string())),
        };
        if !meta.is_file() {
            return Err(ProvisionError::backup(&path, "not a regular file"));
        }
        if is_backup_path(&path) {
            return Err(ProvisionError::backup(&path, "path is itself a backup"));
        }

        let entry = match &mut self.sink {
            BackupSink::Sibling => sibling_backup(&path)?,
            BackupSink::Set(session) => session.add(&path)?,
        };

        info!("Backed up {:?} to {:?}", entry.original, entry.backup);
        self.taken.push(entry.clone());
        Ok(Some(entry))
    }

    /// Replace the contents of `path`, backing up the old contents first.
    ///
    /// The new contents are written to a temporary file and renamed into
    /// place. Mode and owner of an existing target are kept, and a symlink
    /// is written through rather than replaced.
    pub fn write(&mut self, path: &Path, contents: impl AsRef<[u8]>) -> Result<Option<BackupEntry>> {
        let entry = self.guard(path)?;
        atomic_write(path, contents.as_ref())?;
        debug!("Wrote {:?}", path);
        Ok(entry)
    }

    /// Append to `path`, backing up the old contents first
    pub fn append(&mut self, path: &Path, contents: impl AsRef<[u8]>) -> Result<Option<BackupEntry>> {
        let entry = self.guard(path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(contents.as_ref())?;
        file.sync_data()?;
        Ok(entry)
    }

    /// Delete `path`, backing it up first
    pub fn remove(&mut self, path: &Path) -> Result<Option<BackupEntry>> {
        let entry = self.guard(path)?;
        if entry.is_some() {
            fs::remove_file(path)?;
        }
        Ok(entry)
    }
}

/// True for names carrying the `.backup.<timestamp>` suffix
pub fn is_backup_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.rsplit_once(BACKUP_MARKER))
        .is_some_and(|(_, stamp)| clock::is_stamp(stamp))
}

fn sibling_backup(path: &Path) -> Result<BackupEntry> {
    let stamp = clock::stamp_now();
    let mut backup = PathBuf::new();

    // Reserve a unique name first so two guards in one second never collide
    for n in 0..10_000u32 {
        let suffix = if n == 0 {
            stamp.clone()
        } else {
            format!("{}-{}", stamp, n)
        };
        let mut name = path.as_os_str().to_owned();
        name.push(BACKUP_MARKER);
        name.push(&suffix);
        let candidate = PathBuf::from(name);
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => {
                backup = candidate;
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(ProvisionError::backup(path, e.to_string())),
        }
    }
    if backup.as_os_str().is_empty() {
        return Err(ProvisionError::backup(path, "no free backup name"));
    }

    match fs::metadata(path).and_then(|meta| Ok((fs::copy(path, &backup)?, meta))) {
        Ok((size, meta)) => Ok(BackupEntry {
            original: path.to_path_buf(),
            backup,
            created_at: clock::unix_now(),
            size,
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
        }),
        Err(e) => {
            let _ = fs::remove_file(&backup);
            Err(ProvisionError::backup(path, e.to_string()))
        }
    }
}

/// Follow symlinks at `path` to the file that holds the contents.
/// A dangling link resolves to the path it points at.
pub(crate) fn resolve_target(path: &Path) -> io::Result<PathBuf> {
    let mut current = path.to_path_buf();
    for _ in 0..MAX_SYMLINK_HOPS {
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let link = fs::read_link(&current)?;
                current = match current.parent() {
                    Some(parent) if link.is_relative() => parent.join(link),
                    _ => link,
                };
            }
            Ok(_) => return Ok(current),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(current),
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::other(format!(
        "too many levels of symbolic links at {:?}",
        path
    )))
}

/// Hand `file` to `uid:gid` unless it already belongs to them
pub(crate) fn match_owner(file: &fs::File, uid: u32, gid: u32) -> io::Result<()> {
    let current = file.metadata()?;
    if current.uid() == uid && current.gid() == gid {
        return Ok(());
    }
    std::os::unix::fs::fchown(file, Some(uid), Some(gid))
}

/// Write `contents` to `path` through a temp file and rename
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let target = resolve_target(path)?;
    let parent = match target.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let file_name = target
        .file_name()
        .ok_or_else(|| ProvisionError::validation(format!("{:?} has no file name", path)))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".provisioner-tmp");
    let tmp = parent.join(tmp_name);

    let existing = fs::metadata(&target).ok();
    let result = (|| -> io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        // chown may clear setuid bits, so the mode goes on last
        if let Some(meta) = &existing {
            match_owner(&file, meta.uid(), meta.gid())?;
            file.set_permissions(meta.permissions())?;
        }
        file.sync_all()?;
        fs::rename(&tmp, &target)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
