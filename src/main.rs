//! Provisioner - main entry point
//!
//! Loads the configuration, then either runs the plan or performs one of the
//! maintenance actions (rollback, backup listing, progress reset, ...).
//! Logs go to stderr; results are printed to stdout.

use anyhow::{Context, Result};
use provisioner::cli::{Cli, Mode};
use provisioner::clock::display_unix;
use provisioner::error::{ProvisionError, EXIT_FAILURE};
use provisioner::process_guard;
use provisioner::progress::summarize;
use provisioner::restore::earliest_snapshots;
use provisioner::{
    build_steps, BackupManager, BackupSetMetadata, FileProgressStore, FileRunLock, Orchestrator,
    PendingQueue, PlannedAction, ProgressStore, ProvisionConfig, RestoreEngine, RunLock, StepEnv,
    SystemPackages,
};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize tracing; `RUST_LOG` overrides the verbosity flags
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.log_level());

    // Children are terminated and the lock file removed on SIGINT/SIGTERM/SIGHUP
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("CLI arguments parsed: {:?}", cli);

    let code = match dispatch(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|e| e.downcast_ref::<ProvisionError>())
        .map(ProvisionError::exit_code)
        .unwrap_or(EXIT_FAILURE)
}

fn load_config(cli: &Cli) -> Result<ProvisionConfig> {
    let config = ProvisionConfig::load(cli.config.as_deref())?
        .with_state_dir_override(cli.state_dir.clone());
    config.validate().context("Invalid configuration")?;
    debug!("Using state directory {:?}", config.state_dir);
    Ok(config)
}

fn dispatch(cli: &Cli) -> Result<i32> {
    let config = load_config(cli)?;

    match cli.mode() {
        Mode::Run => run_plan(&config),
        Mode::Plan => show_plan(&config),
        Mode::Rollback { id } => rollback(&config, id, cli),
        Mode::ListBackups => list_backups(&config),
        Mode::InspectBackup(id) => inspect_backup(&config, &id),
        Mode::CleanupBackups { keep } => {
            cleanup_backups(&config, keep.unwrap_or(config.backup_keep_count))
        }
        Mode::Status => show_status(&config),
        Mode::ResetProgress => reset_progress(&config, cli.yes),
        Mode::RunPending => run_pending(&config),
        Mode::Unlock => unlock(&config),
    }
}

fn build_orchestrator(config: &ProvisionConfig) -> Result<Orchestrator> {
    let env = StepEnv {
        packages: Arc::new(SystemPackages::new(config.package_manager)),
        pending: PendingQueue::new(config.pending_path()),
    };
    let steps = build_steps(&config.steps, &env)?;
    let orchestrator = Orchestrator::new(
        steps,
        Box::new(FileProgressStore::new(config.progress_path())),
        Box::new(FileRunLock::new(config.lock_path())),
    )?
    .with_backups(BackupManager::new(config.backup_root()))
    .with_retry(config.retry);
    Ok(orchestrator)
}

fn run_plan(config: &ProvisionConfig) -> Result<i32> {
    let mut orchestrator = build_orchestrator(config)?;
    info!("Starting provisioning run ({} step(s))", config.steps.len());
    let result = orchestrator.run();

    for step in &result.skipped_steps {
        println!("  - {} (already done)", step);
    }
    for step in &result.completed_steps {
        println!("  ✓ {}", step);
    }
    match (&result.failed_step, &result.error) {
        (_, None) => println!("✓ Provisioning complete"),
        (Some(step), Some(e)) => {
            println!("  ✗ {}", step);
            eprintln!("✗ {}", e);
            println!("Re-run to resume from '{}'.", step);
        }
        (None, Some(e)) => eprintln!("✗ {}", e),
    }
    if let Some(id) = &result.backup_set {
        println!("Backups of changed files: set {} (undo with --rollback={})", id, id);
    }

    Ok(result.exit_code())
}

fn show_plan(config: &ProvisionConfig) -> Result<i32> {
    let orchestrator = build_orchestrator(config)?;
    let plan = orchestrator.plan()?;
    if plan.is_empty() {
        println!("No steps configured.");
        return Ok(0);
    }

    println!("Dry run, nothing will be changed:");
    for (i, step) in plan.iter().enumerate() {
        match step.action {
            PlannedAction::Skip { completed_at } => println!(
                "  {:>2}. {} - skip (done {})",
                i + 1,
                step.name,
                completed_at.map(display_unix).unwrap_or_else(|| "earlier".into())
            ),
            PlannedAction::Execute => {
                println!("  {:>2}. {} - run: {}", i + 1, step.name, step.description)
            }
        }
    }
    Ok(0)
}

fn print_set_line(index: Option<usize>, set: &BackupSetMetadata) {
    let prefix = index.map(|i| format!("{:>3}) ", i)).unwrap_or_default();
    let source = set
        .source_set
        .as_ref()
        .map(|s| format!(", before restoring {}", s))
        .unwrap_or_default();
    println!(
        "{}{}  {}  {} file(s), {} bytes  [{}{}]",
        prefix,
        set.id,
        display_unix(set.created_at),
        set.file_count,
        set.total_bytes,
        set.kind,
        source
    );
}

fn prompt(question: &str) -> Result<String> {
    print!("{} ", question);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read answer from stdin")?;
    Ok(line.trim().to_string())
}

fn confirm(question: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    let answer = prompt(&format!("{} [y/N]", question))?;
    Ok(matches!(answer.to_lowercase().as_str(), "y" | "yes"))
}

/// Let the operator pick a set from the newest-first list
fn pick_backup_set(manager: &BackupManager) -> Result<Option<String>> {
    let sets = manager.list()?;
    if sets.is_empty() {
        println!("No backup sets found in {:?}", manager.root());
        return Ok(None);
    }

    println!("Available backup sets (newest first):");
    for (i, set) in sets.iter().enumerate() {
        print_set_line(Some(i + 1), set);
    }
    let answer = prompt("Restore which set? (number or id, empty to cancel)")?;
    if answer.is_empty() {
        return Ok(None);
    }
    let chosen = match answer.parse::<usize>() {
        Ok(n) if (1..=sets.len()).contains(&n) => sets[n - 1].id.clone(),
        Ok(n) => anyhow::bail!("No backup set number {}", n),
        Err(_) => answer,
    };
    Ok(Some(chosen))
}

fn rollback(config: &ProvisionConfig, id: Option<String>, cli: &Cli) -> Result<i32> {
    let manager = BackupManager::new(config.backup_root());
    let interactive = id.is_none();
    let set_id = match id {
        Some(id) => id,
        None => match pick_backup_set(&manager)? {
            Some(id) => id,
            None => {
                println!("Rollback cancelled.");
                return Ok(0);
            }
        },
    };

    let entries = manager.inspect(&set_id)?;
    let engine = RestoreEngine::new(manager)
        .with_hooks(config.reload_hooks.clone())
        .dry_run(cli.dry_run);

    if cli.dry_run {
        let result = engine.restore(&set_id, interactive)?;
        println!("Dry run, set {} would restore:", set_id);
        for path in &result.restored {
            println!("  → {}", path.display());
        }
        for failure in &result.failed {
            println!("  ✗ {} ({})", failure.path.display(), failure.reason);
        }
        return Ok(0);
    }

    if !confirm(
        &format!(
            "Restore {} file(s) from backup set {}?",
            earliest_snapshots(&entries).len(),
            set_id
        ),
        cli.yes,
    )? {
        println!("Rollback cancelled.");
        return Ok(0);
    }

    // No provisioning run may touch files while they are being restored
    let lock = FileRunLock::new(config.lock_path()).acquire()?;
    let result = engine.restore(&set_id, interactive);
    lock.release()?;
    let result = result?;

    for path in &result.restored {
        println!("  ✓ {}", path.display());
    }
    for failure in &result.failed {
        println!("  ✗ {}: {}", failure.path.display(), failure.reason);
    }
    for hook in &result.hook_failures {
        println!("  ! reload hook '{}' failed: {}", hook.hook, hook.reason);
    }
    if let Some(pre) = &result.pre_restore_set {
        println!("Files as they were before this restore: set {}", pre);
    }

    if let Err(e) = result.ensure_complete() {
        eprintln!("✗ {}", e);
    }
    if result.is_success() {
        println!("✓ Restored {} file(s) from {}", result.restored_count(), set_id);
    }
    Ok(result.exit_code())
}

fn list_backups(config: &ProvisionConfig) -> Result<i32> {
    let manager = BackupManager::new(config.backup_root());
    let sets = manager.list()?;
    if sets.is_empty() {
        println!("No backup sets found in {:?}", manager.root());
        return Ok(0);
    }
    for set in &sets {
        print_set_line(None, set);
    }
    Ok(0)
}

fn inspect_backup(config: &ProvisionConfig, id: &str) -> Result<i32> {
    let manager = BackupManager::new(config.backup_root());
    let meta = manager.get(id)?;
    print_set_line(None, &meta);
    for entry in manager.inspect(id)? {
        println!(
            "  {}  ({} bytes, {})",
            entry.original.display(),
            entry.size,
            display_unix(entry.created_at)
        );
    }
    Ok(0)
}

fn cleanup_backups(config: &ProvisionConfig, keep: usize) -> Result<i32> {
    let manager = BackupManager::new(config.backup_root());
    let lock = FileRunLock::new(config.lock_path()).acquire()?;
    let report = manager.cleanup(keep);
    lock.release()?;
    let report = report?;

    for id in &report.deleted {
        println!("  ✓ deleted {}", id);
    }
    for (id, reason) in &report.failed {
        println!("  ✗ {}: {}", id, reason);
    }
    println!(
        "Kept the {} most recent set(s), deleted {}, reclaimed {} bytes",
        keep,
        report.deleted_count(),
        report.bytes_reclaimed
    );
    Ok(if report.failed.is_empty() { 0 } else { EXIT_FAILURE })
}

fn show_status(config: &ProvisionConfig) -> Result<i32> {
    let store = FileProgressStore::new(config.progress_path());
    let done = summarize(&store.entries()?);

    println!("Progress record: {}", store.path().display());
    for step in &config.steps {
        match done.get(&step.name) {
            Some(at) => println!("  ✓ {} (done {})", step.name, display_unix(*at)),
            None => println!("  · {} (pending)", step.name),
        }
    }
    let configured: Vec<&str> = config.steps.iter().map(|s| s.name.as_str()).collect();
    for (name, at) in done.iter().filter(|(n, _)| !configured.contains(&n.as_str())) {
        println!("  ? {} (done {}, not in current plan)", name, display_unix(*at));
    }

    let lock = FileRunLock::new(config.lock_path());
    if let Some(info) = lock.holder()? {
        let pid = info.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into());
        if info.holder_alive {
            println!("Run in progress (PID {})", pid);
        } else {
            println!("Stale run lock from PID {} (remove with --unlock)", pid);
        }
    }

    let pending = PendingQueue::new(config.pending_path()).load()?;
    if !pending.is_empty() {
        println!("{} deferred action(s) queued (run with --run-pending)", pending.len());
    }
    Ok(0)
}

fn reset_progress(config: &ProvisionConfig, assume_yes: bool) -> Result<i32> {
    if !confirm("Forget all recorded progress? Every step will run again.", assume_yes)? {
        println!("Reset cancelled.");
        return Ok(0);
    }
    let lock = FileRunLock::new(config.lock_path()).acquire()?;
    let result = FileProgressStore::new(config.progress_path()).reset();
    lock.release()?;
    result?;
    println!("✓ Progress record cleared");
    Ok(0)
}

fn run_pending(config: &ProvisionConfig) -> Result<i32> {
    let lock = FileRunLock::new(config.lock_path()).acquire()?;
    let report = PendingQueue::new(config.pending_path()).run_pending();
    lock.release()?;
    let report = report?;

    for action in &report.succeeded {
        println!("  ✓ {}", action.description);
    }
    for (action, reason) in &report.failed {
        println!("  ✗ {}: {}", action.description, reason);
    }
    if report.succeeded.is_empty() && report.failed.is_empty() {
        println!("No deferred actions queued.");
    }
    Ok(if report.failed.is_empty() { 0 } else { EXIT_FAILURE })
}

fn unlock(config: &ProvisionConfig) -> Result<i32> {
    let lock = FileRunLock::new(config.lock_path());
    if lock.force_unlock()? {
        println!("✓ Removed stale run lock {}", lock.path().display());
    } else {
        println!("No run lock present at {}", lock.path().display());
    }
    Ok(0)
}
