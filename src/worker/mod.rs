// src/worker/mod.rs

//! Capture and remux workers.
//!
//! A worker runs for exactly one slot: it receives a session snapshot, drives
//! one external tool through an [`ExternalToolRunner`], and returns one
//! [`WorkerOutcome`]. Workers never touch the registry or the store.
//!
//! Work directories are laid out as `<work_directory>/<session id>/capture`
//! and `<work_directory>/<session id>/remux`.

pub mod capture;
pub mod remux;
pub mod verify;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, timeout, Instant};
use tracing::warn;

use crate::exec::runner::{ExternalToolRunner, ToolExit, ToolProcess};
use crate::fs::FileSystem;
use crate::session::SessionId;

pub use verify::Container;

/// Knobs the workers read; a projection of the loaded configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub work_directory: PathBuf,
    pub grace_period: Duration,
    pub max_duration: Option<Duration>,
    pub max_output_size: Option<u64>,
    pub size_poll_interval: Duration,
    pub container: Container,
    pub write_metadata: bool,
    pub quality: String,
}

/// Everything a worker needs, shared by all running workers.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub fs: Arc<dyn FileSystem>,
    pub capture_tool: Arc<dyn ExternalToolRunner>,
    pub remux_tool: Arc<dyn ExternalToolRunner>,
    pub settings: WorkerSettings,
}

impl WorkerContext {
    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.settings.work_directory.join(id.as_str())
    }

    pub fn capture_dir(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join("capture")
    }

    pub fn remux_dir(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join("remux")
    }

    /// Remove and recreate `dir`.
    fn fresh_dir(&self, dir: &Path) -> anyhow::Result<()> {
        self.fs.remove_dir_all(dir)?;
        self.fs.create_dir_all(dir)
    }
}

/// Fragments survive only if every file is still there and non-empty.
pub fn fragments_intact(fs: &dyn FileSystem, fragments: &[PathBuf]) -> bool {
    !fragments.is_empty()
        && fragments
            .iter()
            .all(|f| fs.is_file(f) && fs.file_len(f).map(|n| n > 0).unwrap_or(false))
}

/// SIGTERM, wait up to `grace`, then kill.
pub(crate) async fn stop_gracefully(
    process: &mut dyn ToolProcess,
    grace: Duration,
    tool: &str,
) -> ToolExit {
    if let Err(err) = process.request_stop() {
        warn!(tool, error = %err, "graceful stop request failed");
    }
    match timeout(grace, process.wait()).await {
        Ok(Ok(exit)) => exit,
        Ok(Err(err)) => {
            warn!(tool, error = %err, "error while waiting for stopped process");
            ToolExit::killed()
        }
        Err(_) => {
            warn!(tool, grace_ms = grace.as_millis() as u64, "grace period elapsed; killing process");
            if let Err(err) = process.kill().await {
                warn!(tool, error = %err, "failed to kill process");
            }
            process.wait().await.unwrap_or_else(|_| ToolExit::killed())
        }
    }
}

/// Resolves at `deadline`, or never.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Last few output lines, for error details.
#[derive(Debug)]
pub(crate) struct OutputTail {
    lines: VecDeque<String>,
    cap: usize,
}

impl OutputTail {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub(crate) fn push(&mut self, line: String) {
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Prefer the last line that looks like an error.
    pub(crate) fn summary(&self) -> String {
        self.lines
            .iter()
            .rev()
            .find(|l| l.contains("ERROR") || l.to_lowercase().contains("error"))
            .or_else(|| self.lines.back())
            .cloned()
            .unwrap_or_default()
    }
}

fn describe_exit(exit: ToolExit) -> String {
    match exit.code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}
