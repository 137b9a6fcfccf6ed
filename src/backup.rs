//! Backup sets: every file the provisioner is about to overwrite is copied
//! into a timestamped set directory first.
//!
//! # Layout
//!
//! ```text
//! <backup_root>/
//!   20261019_143055/            one directory per set, named by creation time
//!     manifest.json             set kind + original <-> backup pairs
//!     files/etc/ssh/sshd_config mirrors the original absolute path
//!   20261019_150210-1/          "-N" suffix when two sets share a second
//! ```
//!
//! Every guard of a path adds a snapshot, so a file rewritten twice in one run
//! has two entries; later payloads get a `.N` suffix (`files/etc/hosts.1`).
//!
//! A set is only materialized when its first file is added, so a run that
//! touches nothing leaves nothing behind.

use crate::clock::{self, STAMP_FORMAT};
use crate::error::{ProvisionError, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const FILES_DIR: &str = "files";

/// Why a set was created
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SetKind {
    /// Files guarded during a provisioning run
    Run,
    /// Live files captured right before a restore overwrote them
    PreRestore,
    /// Directory without a readable manifest
    Unknown,
}

/// One file snapshot taken immediately before a mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    /// Absolute path of the protected file
    pub original: PathBuf,
    /// Absolute path of the copy
    pub backup: PathBuf,
    /// Unix seconds when the copy was taken
    pub created_at: u64,
    /// Size of the copy in bytes
    pub size: u64,
    /// Owner of the original when the copy was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

/// Contents of `manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetManifest {
    pub id: String,
    pub kind: SetKind,
    pub created_at: u64,
    /// Set being restored, for `PreRestore` sets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_set: Option<String>,
    #[serde(default)]
    pub entries: Vec<BackupEntry>,
}

/// Summary of one set for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSetMetadata {
    pub id: String,
    pub kind: SetKind,
    pub created_at: u64,
    pub total_bytes: u64,
    pub file_count: usize,
    pub source_set: Option<String>,
    pub path: PathBuf,
}

/// Outcome of [`BackupManager::cleanup`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Ids of the deleted sets, newest first
    pub deleted: Vec<String>,
    pub bytes_reclaimed: u64,
    /// Sets that could not be deleted, with the reason
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }
}

/// Owner of the backup root directory
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a new (not yet materialized) set
    pub fn new_set(&self, kind: SetKind, source_set: Option<String>) -> BackupSession {
        BackupSession {
            manager: self.clone(),
            kind,
            source_set,
            state: None,
        }
    }

    /// True if `path` lies inside the backup root
    pub fn contains(&self, path: &Path) -> bool {
        let root = normalize(&absolute(&self.root));
        normalize(&absolute(path)).starts_with(root)
    }

    fn set_dir(&self, id: &str) -> Result<PathBuf> {
        validate_set_id(id)?;
        Ok(self.root.join(id))
    }

    /// Create a fresh set directory, adding a `-N` suffix on collision
    fn allocate(&self) -> Result<(String, u64, PathBuf)> {
        fs::create_dir_all(&self.root)?;
        let now = Local::now();
        let base = now.format(STAMP_FORMAT).to_string();
        let created_at = u64::try_from(now.timestamp()).unwrap_or(0);

        for n in 0..10_000u32 {
            let id = if n == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, n)
            };
            let dir = self.root.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, created_at, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ProvisionError::general(format!(
            "Could not allocate a backup set id for {}",
            base
        )))
    }

    /// Read the manifest of one set
    pub fn manifest(&self, id: &str) -> Result<SetManifest> {
        let dir = self.set_dir(id)?;
        if !dir.is_dir() {
            return Err(ProvisionError::BackupSetNotFound(id.to_string()));
        }
        let content = fs::read_to_string(dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Entries of one set in the order they were taken
    pub fn inspect(&self, id: &str) -> Result<Vec<BackupEntry>> {
        Ok(self.manifest(id)?.entries)
    }

    /// Metadata of one set
    pub fn get(&self, id: &str) -> Result<BackupSetMetadata> {
        let dir = self.set_dir(id)?;
        if !dir.is_dir() {
            return Err(ProvisionError::BackupSetNotFound(id.to_string()));
        }
        Ok(self.describe(id, &dir))
    }

    fn describe(&self, id: &str, dir: &Path) -> BackupSetMetadata {
        let total_bytes = dir_size(&dir.join(FILES_DIR));
        match self.manifest(id) {
            Ok(m) => BackupSetMetadata {
                id: id.to_string(),
                kind: m.kind,
                created_at: m.created_at,
                total_bytes,
                file_count: m.entries.len(),
                source_set: m.source_set,
                path: dir.to_path_buf(),
            },
            Err(e) => {
                debug!("Backup set {} has no readable manifest: {}", id, e);
                let created_at = fs::metadata(dir)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                BackupSetMetadata {
                    id: id.to_string(),
                    kind: SetKind::Unknown,
                    created_at,
                    total_bytes,
                    file_count: count_files(&dir.join(FILES_DIR)),
                    source_set: None,
                    path: dir.to_path_buf(),
                }
            }
        }
    }

    /// All sets, newest first
    pub fn list(&self) -> Result<Vec<BackupSetMetadata>> {
        let rd = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sets = Vec::new();
        for entry in rd {
            let Ok(entry) = entry else { continue };
            let Ok(file_type) = entry.file_type() else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str() else { continue };
            let dir = entry.path();
            if !clock::is_stamp(id) && !dir.join(MANIFEST_FILE).is_file() {
                continue;
            }
            sets.push(self.describe(id, &dir));
        }

        sets.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));
        Ok(sets)
    }

    /// Delete one set
    pub fn delete(&self, id: &str) -> Result<u64> {
        let dir = self.set_dir(id)?;
        if !dir.is_dir() {
            return Err(ProvisionError::BackupSetNotFound(id.to_string()));
        }
        let bytes = dir_size(&dir);
        fs::remove_dir_all(&dir)?;
        info!("Deleted backup set {} ({} bytes)", id, bytes);
        Ok(bytes)
    }

    /// Delete every set beyond the `keep` most recent ones
    pub fn cleanup(&self, keep: usize) -> Result<CleanupReport> {
        let sets = self.list()?;
        let mut report = CleanupReport::default();

        for set in sets.into_iter().skip(keep) {
            match self.delete(&set.id) {
                Ok(bytes) => {
                    report.bytes_reclaimed += bytes;
                    report.deleted.push(set.id);
                }
                Err(e) => {
                    warn!("Failed to delete backup set {}: {}", set.id, e);
                    report.failed.push((set.id, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}

struct SessionState {
    dir: PathBuf,
    manifest: SetManifest,
}

/// A backup set being filled by the mutation guard
pub struct BackupSession {
    manager: BackupManager,
    kind: SetKind,
    source_set: Option<String>,
    state: Option<SessionState>,
}

impl BackupSession {
    /// Set id, once the first file has been added
    pub fn id(&self) -> Option<&str> {
        self.state.as_ref().map(|s| s.manifest.id.as_str())
    }

    /// Copy `original` into the set and record it in the manifest.
    ///
    /// Adding a path again takes a new snapshot with its own payload file.
    pub fn add(&mut self, original: &Path) -> Result<BackupEntry> {
        let original = normalize(&absolute(original));
        if self.manager.contains(&original) {
            return Err(ProvisionError::backup(
                &original,
                "path is inside the backup directory",
            ));
        }

        if self.state.is_none() {
            let (id, created_at, dir) = self
                .manager
                .allocate()
                .map_err(|e| ProvisionError::backup(&original, e.to_string()))?;
            info!("Created backup set {} in {:?}", id, dir);
            self.state = Some(SessionState {
                dir,
                manifest: SetManifest {
                    id,
                    kind: self.kind,
                    created_at,
                    source_set: self.source_set.clone(),
                    entries: Vec::new(),
                },
            });
        }

        let Some(state) = self.state.as_mut() else {
            return Err(ProvisionError::state("backup session was not initialized"));
        };
        let result = capture(state, &original);

        // A set whose very first copy failed is removed again
        if result.is_err() && state.manifest.entries.is_empty() {
            let _ = fs::remove_dir_all(&state.dir);
            self.state = None;
        }
        result
    }
}

fn capture(state: &mut SessionState, original: &Path) -> Result<BackupEntry> {
    let backup = payload_path(state, original);
    let copy = || -> std::io::Result<(u64, fs::Metadata)> {
        let meta = fs::metadata(original)?;
        if let Some(parent) = backup.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok((fs::copy(original, &backup)?, meta))
    };
    let (size, meta) = copy().map_err(|e| ProvisionError::backup(original, e.to_string()))?;

    let entry = BackupEntry {
        original: original.to_path_buf(),
        backup: backup.clone(),
        created_at: clock::unix_now(),
        size,
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
    };
    state.manifest.entries.push(entry.clone());

    if let Err(e) = write_manifest(&state.dir, &state.manifest) {
        state.manifest.entries.pop();
        let _ = fs::remove_file(&backup);
        return Err(ProvisionError::backup(
            original,
            format!("manifest update failed: {}", e),
        ));
    }

    debug!("Backed up {:?} -> {:?}", original, backup);
    Ok(entry)
}

/// First free payload name for `original`: its mirrored path, then `.1`, `.2`, ...
fn payload_path(state: &SessionState, original: &Path) -> PathBuf {
    let base = state.dir.join(FILES_DIR).join(mirror(original));
    let taken =
        |p: &Path| p.exists() || state.manifest.entries.iter().any(|e| e.backup.as_path() == p);
    if !taken(&base) {
        return base;
    }
    (1u32..)
        .map(|n| {
            let mut name = base.as_os_str().to_owned();
            name.push(format!(".{}", n));
            PathBuf::from(name)
        })
        .find(|p| !taken(p))
        .unwrap_or(base)
}

fn write_manifest(dir: &Path, manifest: &SetManifest) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
    let json = serde_json::to_string_pretty(manifest)?;
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
    Ok(())
}

/// Reject ids that would escape the backup root
pub fn validate_set_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\'])
        || Path::new(id).components().count() != 1
    {
        return Err(ProvisionError::validation(format!(
            "Invalid backup set id: {:?}",
            id
        )));
    }
    Ok(())
}

/// Newest-first ordering key: creation time, then stamp, then collision suffix
fn sort_key(set: &BackupSetMetadata) -> (u64, String, u32) {
    let (base, n) = match set.id.rsplit_once('-') {
        Some((base, n)) => match n.parse::<u32>() {
            Ok(n) => (base.to_string(), n),
            Err(_) => (set.id.clone(), 0),
        },
        None => (set.id.clone(), 0),
    };
    (set.created_at, base, n)
}

/// Make `path` absolute relative to the current directory without
/// resolving symlinks
pub fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Resolve `.` and `..` lexically
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Relative path mirroring an absolute one (`/etc/hosts` -> `etc/hosts`)
fn mirror(original: &Path) -> PathBuf {
    original
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn dir_size(path: &Path) -> u64 {
    let Ok(rd) = fs::read_dir(path) else {
        return 0;
    };
    rd.flatten()
        .map(|entry| match entry.file_type() {
            Ok(t) if t.is_dir() => dir_size(&entry.path()),
            Ok(_) => entry.metadata().map(|m| m.len()).unwrap_or(0),
            Err(_) => 0,
        })
        .sum()
}

fn count_files(path: &Path) -> usize {
    let Ok(rd) = fs::read_dir(path) else {
        return 0;
    };
    rd.flatten()
        .map(|entry| match entry.file_type() {
            Ok(t) if t.is_dir() => count_files(&entry.path()),
            Ok(_) => 1,
            Err(_) => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, BackupManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path().join("backups"));
        (dir, manager)
    }

    #[test]
    fn test_session_is_lazy() {
        let (_dir, manager) = setup();
        let session = manager.new_set(SetKind::Run, None);
        assert!(session.id().is_none());
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn test_add_copies_and_records() {
        let (dir, manager) = setup();
        let original = dir.path().join("etc/hosts");
        fs::create_dir_all(original.parent().unwrap()).unwrap();
        fs::write(&original, "127.0.0.1 localhost\n").unwrap();

        let mut session = manager.new_set(SetKind::Run, None);
        let entry = session.add(&original).unwrap();
        let id = session.id().unwrap().to_string();

        assert_ne!(entry.backup, entry.original);
        assert_eq!(fs::read_to_string(&entry.backup).unwrap(), "127.0.0.1 localhost\n");
        assert_eq!(entry.size, 20);

        let entries = manager.inspect(&id).unwrap();
        assert_eq!(entries, vec![entry]);
        assert!(clock::is_stamp(&id));
    }

    #[test]
    fn test_repeated_adds_keep_every_snapshot() {
        let (dir, manager) = setup();
        let original = dir.path().join("bashrc");
        fs::write(&original, "v1").unwrap();

        let mut session = manager.new_set(SetKind::Run, None);
        let first = session.add(&original).unwrap();
        fs::write(&original, "v2").unwrap();
        let second = session.add(&original).unwrap();

        assert_ne!(first.backup, second.backup);
        assert_eq!(fs::read_to_string(&first.backup).unwrap(), "v1");
        assert_eq!(fs::read_to_string(&second.backup).unwrap(), "v2");

        let id = session.id().unwrap().to_string();
        assert_eq!(manager.inspect(&id).unwrap(), vec![first, second]);
    }

    #[test]
    fn test_suffixed_payloads_do_not_clobber_neighbours() {
        let (dir, manager) = setup();
        let hosts = dir.path().join("hosts");
        let hosts_1 = dir.path().join("hosts.1");
        fs::write(&hosts, "a").unwrap();
        fs::write(&hosts_1, "neighbour").unwrap();

        let mut session = manager.new_set(SetKind::Run, None);
        session.add(&hosts).unwrap();
        fs::write(&hosts, "b").unwrap();
        let second = session.add(&hosts).unwrap();
        let neighbour = session.add(&hosts_1).unwrap();

        assert_ne!(second.backup, neighbour.backup);
        assert_eq!(fs::read_to_string(&second.backup).unwrap(), "b");
        assert_eq!(fs::read_to_string(&neighbour.backup).unwrap(), "neighbour");
    }

    #[test]
    fn test_entries_record_owner() {
        let (dir, manager) = setup();
        let original = dir.path().join("profile");
        fs::write(&original, "x").unwrap();
        let meta = fs::metadata(&original).unwrap();

        let mut session = manager.new_set(SetKind::Run, None);
        let entry = session.add(&original).unwrap();
        assert_eq!(entry.uid, Some(meta.uid()));
        assert_eq!(entry.gid, Some(meta.gid()));
    }

    #[test]
    fn test_refuses_paths_inside_backup_root() {
        let (_dir, manager) = setup();
        let inside = manager.root().join("20200101_000000/files/x");
        fs::create_dir_all(inside.parent().unwrap()).unwrap();
        fs::write(&inside, "x").unwrap();

        let mut session = manager.new_set(SetKind::Run, None);
        assert!(matches!(
            session.add(&inside),
            Err(ProvisionError::BackupFailed { .. })
        ));
    }

    #[test]
    fn test_list_reports_size_and_count() {
        let (dir, manager) = setup();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "12345").unwrap();
        fs::write(&b, "123").unwrap();

        let mut session = manager.new_set(SetKind::Run, None);
        session.add(&a).unwrap();
        session.add(&b).unwrap();

        let sets = manager.list().unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].file_count, 2);
        assert_eq!(sets[0].total_bytes, 8);
        assert_eq!(sets[0].kind, SetKind::Run);
    }

    #[test]
    fn test_same_second_sets_get_suffixes_and_order() {
        let (dir, manager) = setup();
        let f = dir.path().join("f");
        fs::write(&f, "x").unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut s = manager.new_set(SetKind::Run, None);
            s.add(&f).unwrap();
            ids.push(s.id().unwrap().to_string());
        }

        let listed: Vec<String> = manager.list().unwrap().into_iter().map(|m| m.id).collect();
        ids.reverse();
        assert_eq!(listed, ids);
    }

    #[test]
    fn test_invalid_set_ids_rejected() {
        let (_dir, manager) = setup();
        assert!(matches!(
            manager.inspect("../etc"),
            Err(ProvisionError::Validation(_))
        ));
        assert!(matches!(
            manager.delete(""),
            Err(ProvisionError::Validation(_))
        ));
        assert!(matches!(
            manager.inspect("20200101_000000"),
            Err(ProvisionError::BackupSetNotFound(_))
        ));
    }

    #[test]
    fn test_normalize_and_mirror() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(mirror(Path::new("/etc/ssh/sshd_config")), PathBuf::from("etc/ssh/sshd_config"));
    }
}
