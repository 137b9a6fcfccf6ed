//! Process lifecycle management for provisioning runs
//!
//! Package managers and installer scripts spawned by steps must not outlive
//! the provisioner, and an interrupted run must not leave its run lock behind.
//!
//! # Solution
//! - Spawn children in their own process group with a parent-death signal
//! - Track child PIDs and the held lock file in a global cleanup registry
//! - On SIGINT/SIGTERM/SIGHUP, signal every child group (SIGTERM, then SIGKILL
//!   after a grace period), remove the lock file, and exit with `128 + sig`

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Global cleanup registry
static CLEANUP_REGISTRY: OnceLock<Arc<Mutex<CleanupRegistry>>> = OnceLock::new();

/// Everything that has to be undone if the process is interrupted
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    /// Process group leaders of running children
    pids: HashSet<u32>,
    /// Lock files owned by this process
    lock_files: Vec<PathBuf>,
    /// Whether child termination has already run
    cleanup_initiated: bool,
}

impl CleanupRegistry {
    /// Get or create the global registry
    pub fn global() -> Arc<Mutex<CleanupRegistry>> {
        CLEANUP_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(CleanupRegistry::default())))
            .clone()
    }

    /// Register a new child process
    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Registered child process PID {}", pid);
    }

    /// Unregister a child process (called when it exits normally)
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("Unregistered child process PID {}", pid);
    }

    /// Number of tracked children
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Remember a lock file that must be removed on interrupt
    pub fn register_lock(&mut self, path: &Path) {
        if !self.lock_files.iter().any(|p| p == path) {
            self.lock_files.push(path.to_path_buf());
        }
    }

    /// Forget a lock file (called when the lock is released normally)
    pub fn unregister_lock(&mut self, path: &Path) {
        self.lock_files.retain(|p| p != path);
    }

    /// Lock files currently registered
    pub fn lock_files(&self) -> &[PathBuf] {
        &self.lock_files
    }

    /// Remove every registered lock file (best-effort)
    pub fn release_locks(&mut self) {
        for path in self.lock_files.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => info!("Released run lock {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove run lock {:?}: {}", path, e),
            }
        }
    }

    /// Terminate all tracked child process groups
    /// Sends SIGTERM first, waits up to `grace_period`, then SIGKILL
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            debug!("Cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            debug!("No child processes to terminate");
            return;
        }

        info!("Terminating {} child process(es)...", self.pids.len());

        let pids_to_kill: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids_to_kill {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
                if let Err(e2) = send_signal(pid, Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to PID {}: {}", pid, e2);
                }
            } else {
                debug!("Sent SIGTERM to process group {}", pid);
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids_to_kill.iter().all(|&pid| !is_process_alive(pid)) {
                info!("All child processes terminated gracefully");
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids_to_kill {
            if is_process_alive(pid) {
                warn!("Process group {} did not terminate, sending SIGKILL", pid);
                if let Err(e) = send_signal_to_group(pid, Signal::SIGKILL) {
                    error!("Failed to send SIGKILL to process group {}: {}", pid, e);
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }

        self.pids.clear();
        info!("Child process cleanup complete");
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Negative PID signals the whole group, so grandchildren (dpkg under
/// apt-get, curl under an install script) are reached as well
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check if a process is still alive (not dead or zombie)
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/<pid>/stat is the state; Z and X are not running
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// Initialize global signal handlers for graceful shutdown
/// Handles SIGINT (Ctrl+C), SIGTERM, and SIGHUP
/// Call this once at program start
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };

            warn!("Received {}, stopping provisioning run", signal_name);

            if let Ok(mut registry) = CleanupRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
                registry.release_locks();
            }

            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    /// This allows us to kill the entire process tree with a single signal
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions
        // (setpgid, prctl) between fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                // Child dies with the provisioner instead of finishing an
                // unsupervised package transaction
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_unregister() {
        let mut registry = CleanupRegistry::default();

        registry.register(1234);
        registry.register(5678);
        assert_eq!(registry.count(), 2);

        registry.unregister(1234);
        assert_eq!(registry.count(), 1);

        registry.unregister(5678);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_release_locks_removes_registered_files() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("run.lock");
        std::fs::write(&lock, "123\n").unwrap();

        let mut registry = CleanupRegistry::default();
        registry.register_lock(&lock);
        registry.register_lock(&lock);
        assert_eq!(registry.lock_files().len(), 1);

        registry.release_locks();
        assert!(!lock.exists());
        assert!(registry.lock_files().is_empty());
    }

    #[test]
    fn test_unregister_lock_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("run.lock");
        std::fs::write(&lock, "123\n").unwrap();

        let mut registry = CleanupRegistry::default();
        registry.register_lock(&lock);
        registry.unregister_lock(&lock);
        registry.release_locks();
        assert!(lock.exists());
    }

    #[test]
    fn test_terminate_all_kills_process_group() {
        use std::process::Command;

        let mut child = Command::new("bash")
            .args(["-c", "sleep 60"])
            .in_new_process_group()
            .spawn()
            .expect("Failed to spawn bash sleep process");
        let pid = child.id();

        let mut registry = CleanupRegistry::default();
        registry.register(pid);
        assert!(is_process_alive(pid));

        registry.terminate_all(Duration::from_millis(500));

        let status = child.wait().expect("wait for child");
        assert!(!status.success());
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn test_cleanup_initiated_flag_prevents_double_cleanup() {
        let mut registry = CleanupRegistry::default();
        registry.register(999_999);

        registry.terminate_all(Duration::from_millis(10));
        assert!(registry.cleanup_initiated);

        registry.terminate_all(Duration::from_millis(10));
        assert!(registry.cleanup_initiated);
    }

    #[test]
    fn test_is_process_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(999_999));
        assert!(!is_process_alive(0));
    }
}
