// src/worker/capture.rs

//! Capture worker: supervises one capture-tool process for one session.

use std::path::{Path, PathBuf};

use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::WorkerOutcome;
use crate::exec::runner::{ProcessEvent, TerminalCondition, ToolExit, ToolInvocation, ToolSignal};
use crate::fs::FileSystem;
use crate::session::Session;
use crate::types::ErrorKind;

use super::{describe_exit, fragments_intact, sleep_until_opt, stop_gracefully, OutputTail, WorkerContext};

/// Why the worker stopped the tool itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapReached {
    Duration,
    Size,
}

/// Run the capture phase for `session`.
///
/// Fragments left by an earlier successful capture are reused as long as
/// they are intact, which turns a remux retry into a remux-only attempt.
pub async fn run(ctx: &WorkerContext, session: &Session, cancel: &CancellationToken) -> WorkerOutcome {
    let fs = ctx.fs.as_ref();

    if fragments_intact(fs, &session.fragments) {
        info!(
            session = %session.id,
            fragments = session.fragments.len(),
            "reusing intact fragments from previous capture"
        );
        return WorkerOutcome::Captured {
            fragments: session.fragments.clone(),
        };
    }

    let dir = ctx.capture_dir(&session.id);
    if let Err(err) = ctx.fresh_dir(&dir) {
        return WorkerOutcome::failed(ErrorKind::Internal, format!("preparing {dir:?}: {err:#}"));
    }

    let invocation = ToolInvocation::Capture {
        session_id: session.id.clone(),
        source: session.source.clone(),
        work_dir: dir.clone(),
    };
    let mut process = match ctx.capture_tool.start(&invocation) {
        Ok(p) => p,
        Err(err) => {
            warn!(session = %session.id, error = %err, "capture tool failed to start");
            return WorkerOutcome::failed(ErrorKind::Internal, format!("{err:#}"));
        }
    };

    info!(session = %session.id, attempt = session.attempt, source = %session.source, "capture started");

    let settings = &ctx.settings;
    let deadline = settings.max_duration.map(|d| Instant::now() + d);
    let mut size_poll = interval(settings.size_poll_interval);
    size_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut tail = OutputTail::new(20);
    let mut terminal: Option<TerminalCondition> = None;
    let mut cap: Option<CapReached> = None;
    let tool = ctx.capture_tool.name().to_string();

    let exit: ToolExit = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!(session = %session.id, "cancellation requested; stopping capture");
                stop_gracefully(process.as_mut(), settings.grace_period, &tool).await;
                if let Err(err) = fs.remove_dir_all(&dir) {
                    warn!(session = %session.id, error = %err, "failed to clean capture dir");
                }
                return WorkerOutcome::Cancelled;
            }

            _ = sleep_until_opt(deadline) => {
                info!(session = %session.id, "max duration reached; finishing capture");
                cap = Some(CapReached::Duration);
                break stop_gracefully(process.as_mut(), settings.grace_period, &tool).await;
            }

            _ = size_poll.tick(), if settings.max_output_size.is_some() => {
                let limit = settings.max_output_size.unwrap_or(u64::MAX);
                let size = captured_bytes(fs, &dir);
                if size >= limit {
                    info!(session = %session.id, size, limit, "max output size reached; finishing capture");
                    cap = Some(CapReached::Size);
                    break stop_gracefully(process.as_mut(), settings.grace_period, &tool).await;
                }
            }

            event = process.next_event() => match event {
                Some(ProcessEvent::Line(line)) => {
                    match ctx.capture_tool.classify(&line) {
                        ToolSignal::Progress(p) => debug!(
                            session = %session.id,
                            percent = p.percent,
                            total_mib = ?p.total_mib,
                            eta = ?p.eta,
                            "capture progress"
                        ),
                        ToolSignal::Terminal(condition) => {
                            debug!(session = %session.id, ?condition, "capture reported terminal condition");
                            terminal = Some(condition);
                        }
                        ToolSignal::Output => debug!(session = %session.id, "capture: {}", line),
                    }
                    tail.push(line);
                }
                Some(ProcessEvent::Exited(exit)) => break exit,
                None => break ToolExit::killed(),
            },
        }
    };

    info!(
        session = %session.id,
        code = ?exit.code,
        success = exit.success,
        cap = ?cap,
        "capture process finished"
    );

    if cap.is_none() {
        if let Some(kind) = terminal.and_then(TerminalCondition::error_kind) {
            return WorkerOutcome::failed(kind, tail.summary());
        }
        if !exit.success && terminal != Some(TerminalCondition::EndedNormally) {
            return WorkerOutcome::failed(
                ErrorKind::ToolExited,
                format!("{}: {}", describe_exit(exit), tail.summary()),
            );
        }
    }

    let fragments = collect_fragments(fs, &dir);
    if fragments.is_empty() {
        return WorkerOutcome::failed(ErrorKind::NoOutput, "capture produced no fragments");
    }
    WorkerOutcome::Captured { fragments }
}

fn captured_bytes(fs: &dyn FileSystem, dir: &Path) -> u64 {
    fs.read_dir(dir)
        .unwrap_or_default()
        .iter()
        .filter_map(|p| fs.file_len(p).ok())
        .sum()
}

/// Non-empty regular files in `dir`, sorted by name.
fn collect_fragments(fs: &dyn FileSystem, dir: &Path) -> Vec<PathBuf> {
    let mut fragments: Vec<PathBuf> = fs
        .read_dir(dir)
        .unwrap_or_default()
        .into_iter()
        .filter(|p| fs.is_file(p))
        .filter(|p| fs.file_len(p).map(|n| n > 0).unwrap_or(false))
        .filter(|p| {
            !p.extension()
                .is_some_and(|ext| ext == "part" || ext == "ytdl" || ext == "json")
        })
        .collect();
    fragments.sort();
    fragments
}
