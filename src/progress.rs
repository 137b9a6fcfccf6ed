//! Progress record: which steps have already completed.
//!
//! The on-disk record is append-only text, one `step<TAB>unix_seconds` line
//! per completed step. Reads tolerate damage from a crashed writer: malformed
//! lines and a final line without its newline are skipped with a warning.

use crate::clock::unix_now;
use crate::error::{ProvisionError, Result};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// One completed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEntry {
    pub step: String,
    pub completed_at: u64,
}

/// Durable record of completed steps.
///
/// Implementations must make `mark_done` durable before it returns.
pub trait ProgressStore {
    /// True if `step` has a completion entry
    fn is_done(&self, step: &str) -> Result<bool>;

    /// Record `step` as completed now
    fn mark_done(&self, step: &str) -> Result<()>;

    /// Forget all progress
    fn reset(&self) -> Result<()>;

    /// All completion entries in record order
    fn entries(&self) -> Result<Vec<ProgressEntry>>;
}

/// Reject names that cannot be stored as a single record key
pub fn validate_step_name(step: &str) -> Result<()> {
    if step.trim().is_empty() {
        return Err(ProvisionError::validation("Step name must not be empty"));
    }
    if step.contains(['\t', '\n', '\r']) {
        return Err(ProvisionError::validation(format!(
            "Step name {:?} must not contain tabs or newlines",
            step
        )));
    }
    Ok(())
}

/// Parse record contents, skipping anything unreadable.
///
/// Returns the valid entries and the corrupt lines that were skipped.
pub fn parse_record(path: &Path, content: &str) -> (Vec<ProgressEntry>, Vec<ProvisionError>) {
    let mut entries = Vec::new();
    let mut corrupt = Vec::new();
    let complete = content.ends_with('\n');
    let lines: Vec<&str> = content.split_terminator('\n').collect();

    for (idx, raw) in lines.iter().enumerate() {
        let is_last = idx + 1 == lines.len();
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.trim().is_empty() {
            continue;
        }

        let parsed = if is_last && !complete {
            // Torn write: even if it parses, the timestamp may be cut short
            None
        } else {
            line.split_once('\t').and_then(|(step, ts)| {
                let ts = ts.trim().parse::<u64>().ok()?;
                (!step.is_empty()).then(|| ProgressEntry {
                    step: step.to_string(),
                    completed_at: ts,
                })
            })
        };

        match parsed {
            Some(entry) => entries.push(entry),
            None => corrupt.push(ProvisionError::RecordCorrupt {
                path: path.to_path_buf(),
                line: idx + 1,
                content: line.to_string(),
            }),
        }
    }

    (entries, corrupt)
}

/// Progress record backed by a text file
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    path: PathBuf,
}

impl FileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Vec<ProgressEntry>> {
        let content = match fs::read(&self.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let (entries, corrupt) = parse_record(&self.path, &content);
        for err in corrupt {
            warn!("Skipping damaged progress entry: {}", err);
        }
        Ok(entries)
    }

    fn append(&self, step: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        // Never glue a new entry onto a torn line left by a crash
        let len = file.metadata()?.len();
        let mut prefix = "";
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                prefix = "\n";
            }
        }

        let line = format!("{}{}\t{}\n", prefix, step, unix_now());
        file.write_all(line.as_bytes())?;
        file.flush()?;
        file.sync_data()
    }
}

impl ProgressStore for FileProgressStore {
    fn is_done(&self, step: &str) -> Result<bool> {
        Ok(self.read()?.iter().any(|e| e.step == step))
    }

    fn mark_done(&self, step: &str) -> Result<()> {
        validate_step_name(step)?;
        self.append(step).map_err(|source| ProvisionError::ProgressWrite {
            path: self.path.clone(),
            source,
        })?;
        debug!("Recorded step '{}' as done in {:?}", step, self.path);
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ProvisionError::ProgressWrite {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn entries(&self) -> Result<Vec<ProgressEntry>> {
        self.read()
    }
}

/// In-memory progress record for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    entries: Mutex<Vec<ProgressEntry>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with completed steps
    pub fn with_done<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = steps
            .into_iter()
            .map(|s| ProgressEntry {
                step: s.into(),
                completed_at: unix_now(),
            })
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<ProgressEntry>>> {
        self.entries
            .lock()
            .map_err(|_| ProvisionError::state("progress store mutex poisoned"))
    }
}

impl ProgressStore for MemoryProgressStore {
    fn is_done(&self, step: &str) -> Result<bool> {
        Ok(self.lock()?.iter().any(|e| e.step == step))
    }

    fn mark_done(&self, step: &str) -> Result<()> {
        validate_step_name(step)?;
        self.lock()?.push(ProgressEntry {
            step: step.to_string(),
            completed_at: unix_now(),
        });
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    fn entries(&self) -> Result<Vec<ProgressEntry>> {
        Ok(self.lock()?.clone())
    }
}

/// Latest completion time per step, for status display
pub fn summarize(entries: &[ProgressEntry]) -> BTreeMap<String, u64> {
    let mut latest = BTreeMap::new();
    for e in entries {
        let slot = latest.entry(e.step.clone()).or_insert(e.completed_at);
        *slot = (*slot).max(e.completed_at);
    }
    latest
}
