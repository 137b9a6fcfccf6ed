//! Run lock: at most one provisioning run per host.
//!
//! The file lock is an `O_EXCL`-created marker holding the owner's PID. It is
//! never broken automatically; a lock left by a crashed run has to be cleared
//! by an operator (`--unlock`), which refuses while the recorded PID lives.

use crate::clock::unix_now;
use crate::error::{ProvisionError, Result};
use crate::process_guard::{is_process_alive, CleanupRegistry};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Held lock; dropping it releases the lock
pub trait LockGuard {
    /// Release explicitly, reporting failures instead of swallowing them
    fn release(self: Box<Self>) -> Result<()>;
}

/// Exclusive run marker
pub trait RunLock {
    /// Take the lock or fail immediately with `LockHeld`
    fn acquire(&self) -> Result<Box<dyn LockGuard>>;
}

/// What the lock file says about its holder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: Option<u32>,
    pub acquired_at: Option<u64>,
    pub holder_alive: bool,
}

/// Lock file with the holder's PID
#[derive(Debug, Clone)]
pub struct FileRunLock {
    path: PathBuf,
}

impl FileRunLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inspect the current lock file, if any
    pub fn holder(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut lines = content.lines();
        let pid = lines.next().and_then(|l| l.trim().parse::<u32>().ok());
        let acquired_at = lines.next().and_then(|l| l.trim().parse::<u64>().ok());
        Ok(Some(LockInfo {
            pid,
            acquired_at,
            holder_alive: pid.is_some_and(is_process_alive),
        }))
    }

    /// Remove a stale lock. Refuses while the recorded holder is running.
    ///
    /// Returns `false` if there was no lock to remove.
    pub fn force_unlock(&self) -> Result<bool> {
        match self.holder()? {
            None => Ok(false),
            Some(info) if info.holder_alive => Err(ProvisionError::LockHeld {
                path: self.path.clone(),
                pid: info.pid,
            }),
            Some(info) => {
                fs::remove_file(&self.path)?;
                warn!(
                    "Removed stale run lock {:?} (recorded PID {:?})",
                    self.path, info.pid
                );
                Ok(true)
            }
        }
    }
}

impl RunLock for FileRunLock {
    fn acquire(&self) -> Result<Box<dyn LockGuard>> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let info = self.holder().ok().flatten();
                let pid = info.as_ref().and_then(|i| i.pid);
                if let Some(info) = &info {
                    if !info.holder_alive {
                        warn!(
                            "Run lock {:?} looks stale (PID {:?} is not running); remove it with --unlock",
                            self.path, info.pid
                        );
                    }
                }
                return Err(ProvisionError::LockHeld {
                    path: self.path.clone(),
                    pid,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let pid = std::process::id();
        let written = writeln!(file, "{}\n{}", pid, unix_now()).and_then(|_| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&self.path);
            return Err(e.into());
        }

        if let Ok(mut registry) = CleanupRegistry::global().lock() {
            registry.register_lock(&self.path);
        }
        info!("Acquired run lock {:?} (PID {})", self.path, pid);

        Ok(Box::new(FileLockGuard {
            path: self.path.clone(),
            pid,
            released: false,
        }))
    }
}

struct FileLockGuard {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl FileLockGuard {
    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        if let Ok(mut registry) = CleanupRegistry::global().lock() {
            registry.unregister_lock(&self.path);
        }

        // Only remove the marker if it is still ours
        let ours = fs::read_to_string(&self.path)
            .map(|c| c.lines().next().map(str::trim) == Some(self.pid.to_string().as_str()))
            .unwrap_or(false);
        if !ours {
            warn!("Run lock {:?} is no longer ours, leaving it", self.path);
            return Ok(());
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Released run lock {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl LockGuard for FileLockGuard {
    fn release(mut self: Box<Self>) -> Result<()> {
        self.release_inner()
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!("Failed to release run lock {:?}: {}", self.path, e);
        }
    }
}

/// In-process lock for tests; clones share the same flag
#[derive(Debug, Clone, Default)]
pub struct MemoryRunLock {
    held: Arc<AtomicBool>,
}

impl MemoryRunLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

struct MemoryLockGuard {
    held: Arc<AtomicBool>,
}

impl LockGuard for MemoryLockGuard {
    fn release(self: Box<Self>) -> Result<()> {
        // Drop does the work
        Ok(())
    }
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

impl RunLock for MemoryRunLock {
    fn acquire(&self) -> Result<Box<dyn LockGuard>> {
        if self
            .held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProvisionError::LockHeld {
                path: PathBuf::from("<memory>"),
                pid: None,
            });
        }
        Ok(Box::new(MemoryLockGuard {
            held: Arc::clone(&self.held),
        }))
    }
}
