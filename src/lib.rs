// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod retry;
pub mod session;
pub mod store;
pub mod types;
pub mod worker;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{load_or_default, ConfigFile};
use crate::engine::{CoreScheduler, Runtime, RuntimeOptions};
use crate::exec::{CaptureTool, PipelineBackend, RemuxTool};
use crate::fs::{DiskSpaceGuard, FileSystem, RealFileSystem};
use crate::session::{validate_source, Session, SessionId};
use crate::store::{SessionStore, SqliteSessionStore};
use crate::worker::WorkerContext;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the SQLite session store
/// - capture/remux tools and the worker backend
/// - scheduler core and runtime
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_or_default(&args.config)?;
    for source in &args.sources {
        validate_source(source)?;
    }

    let store = SqliteSessionStore::open(&cfg.paths.database)?;

    if args.dry_run {
        print_dry_run(&cfg, &store, &args.sources)?;
        return Ok(());
    }

    let started = Utc::now();
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    fs.create_dir_all(&cfg.paths.output_directory)?;
    fs.create_dir_all(&cfg.paths.work_directory)?;
    sweep_work_directory(fs.as_ref(), &cfg.paths.work_directory, &store)?;

    // Runtime event channel, shared by the control handle and the workers.
    let (tx, rx) = mpsc::unbounded_channel();

    let ctx = WorkerContext {
        fs: Arc::clone(&fs),
        capture_tool: Arc::new(CaptureTool::new(
            cfg.capture.command.clone(),
            cfg.capture.quality.clone(),
        )),
        remux_tool: Arc::new(RemuxTool::new(cfg.remux.command.clone())),
        settings: cfg.worker_settings(),
    };
    let backend = PipelineBackend::new(ctx, tx.clone());

    let options = RuntimeOptions {
        exit_when_idle: args.once,
        disk_recheck_interval: cfg.scheduler.disk_recheck_interval,
    };
    let guard = DiskSpaceGuard::new(Arc::clone(&fs), &cfg.paths.output_directory);
    let core = CoreScheduler::new(
        cfg.scheduler_settings(),
        options,
        Box::new(store),
        guard,
        cfg.retry_policy(),
    );
    let (runtime, handle) = Runtime::new(core, tx, rx, backend);

    let mut subscription = handle.subscribe();
    let change_logger = tokio::spawn(async move {
        while let Some(change) = subscription.next().await {
            match change.old_status {
                Some(old) => info!(
                    session = %change.session_id,
                    from = %old,
                    to = %change.new_status,
                    "status changed"
                ),
                None => info!(session = %change.session_id, status = %change.new_status, "session created"),
            }
        }
    });

    for source in &args.sources {
        let id = handle.submit(source, args.max_attempts)?;
        info!(session = %id, source = %source, "submitted");
    }

    // Ctrl-C → graceful shutdown.
    {
        let handle = handle.clone();
        let drain = cfg.scheduler.drain_timeout;
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            info!(drain = ?drain, "Ctrl-C received; shutting down");
            if let Err(err) = handle.shutdown(drain).await {
                warn!(error = %err, "shutdown request failed");
            }
        });
    }

    let report = runtime.run().await?;
    change_logger.abort();

    // The runtime owned the store; read the final records back.
    let history = SqliteSessionStore::open(&cfg.paths.database)?.list_all()?;
    print_summary(&history, started, report.non_terminal.len());
    Ok(())
}

/// Remove work directories that no longer belong to an open session.
///
/// Open sessions keep theirs so a retry can reuse intact fragments.
fn sweep_work_directory(
    fs: &dyn FileSystem,
    work_directory: &Path,
    store: &dyn SessionStore,
) -> Result<()> {
    for dir in fs.read_dir(work_directory)? {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let open = store
            .load(&SessionId::from(name))?
            .is_some_and(|s| !s.is_terminal());
        if !open {
            debug!(dir = %dir.display(), "removing stale work directory");
            fs.remove_dir_all(&dir)?;
        }
    }
    Ok(())
}

/// Print the effective configuration and what a real run would resume.
fn print_dry_run(cfg: &ConfigFile, store: &dyn SessionStore, sources: &[String]) -> Result<()> {
    let s = &cfg.scheduler;
    println!("multirec dry-run");
    println!("  scheduler.max_concurrent = {}", s.max_concurrent);
    println!("  scheduler.max_attempts_default = {}", s.max_attempts_default);
    println!("  scheduler.min_free_bytes = {}", s.min_free_bytes);
    println!(
        "  scheduler.backoff = {:?} .. {:?} (jitter {})",
        s.backoff_base, s.backoff_cap, s.backoff_jitter
    );
    println!("  scheduler.capture_grace_period = {:?}", s.capture_grace_period);
    println!("  scheduler.drain_timeout = {:?}", s.drain_timeout);
    println!("  paths.output_directory = {}", cfg.paths.output_directory.display());
    println!("  paths.work_directory = {}", cfg.paths.work_directory.display());
    println!("  paths.database = {}", cfg.paths.database.display());
    println!(
        "  capture: {} {}",
        cfg.capture.command.program,
        cfg.capture.command.args.join(" ")
    );
    println!("  capture.quality = {}", cfg.capture.quality);
    if let Some(max) = cfg.capture.max_duration {
        println!("  capture.max_duration = {max:?}");
    }
    if let Some(max) = cfg.capture.max_output_size {
        println!("  capture.max_output_size = {max}");
    }
    println!(
        "  remux: {} {}",
        cfg.remux.command.program,
        cfg.remux.command.args.join(" ")
    );
    println!("  remux.container = {}", cfg.remux.container);
    println!();

    let open = store.list_non_terminal()?;
    println!("sessions to resume ({}):", open.len());
    for session in &open {
        println!(
            "  - {} [{}] attempt {}/{} {}",
            session.id, session.status, session.attempt, session.max_attempts, session.source
        );
    }

    println!("sources to submit ({}):", sources.len());
    for source in sources {
        println!("  - {source}");
    }

    debug!("dry-run complete (nothing recorded)");
    Ok(())
}

fn print_summary(history: &[Session], since: DateTime<Utc>, left_open: usize) {
    let touched: Vec<&Session> = history
        .iter()
        .filter(|s| s.ended_at.is_none_or(|t| t >= since))
        .collect();

    println!("multirec summary ({} sessions):", touched.len());
    for session in touched {
        let detail = match (&session.output_path, session.error_kind) {
            (_, Some(kind)) if session.status.is_terminal() => format!("error: {kind}"),
            (Some(path), _) => path.display().to_string(),
            _ => String::new(),
        };
        println!(
            "  {} {:<10} {} {}",
            session.id, session.status, session.source, detail
        );
    }
    if left_open > 0 {
        println!("{left_open} session(s) will resume on the next start");
    }
}
