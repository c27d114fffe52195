#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use multirec::config::{ConfigFile, RawConfigFile};
use multirec::engine::{CoreScheduler, RuntimeOptions, SchedulerSettings};
use multirec::exec::ExternalToolRunner;
use multirec::fs::{DiskSpaceGuard, FileSystem};
use multirec::retry::RetryPolicy;
use multirec::session::{Session, SessionId, SessionStatus};
use multirec::store::SessionStore;
use multirec::worker::{Container, WorkerContext, WorkerSettings};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.config.scheduler.max_concurrent = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.scheduler.max_attempts_default = n;
        self
    }

    pub fn backoff(mut self, base: &str, cap: &str) -> Self {
        self.config.scheduler.backoff_base = base.to_string();
        self.config.scheduler.backoff_cap = cap.to_string();
        self
    }

    pub fn output_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.paths.output_directory = dir.into();
        self
    }

    pub fn container(mut self, container: &str) -> Self {
        self.config.remux.container = container.to_string();
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for persisted `Session` records.
pub struct SessionBuilder {
    session: Session,
}

impl SessionBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            session: Session::new(
                SessionId::from(id),
                format!("https://live.test/{id}"),
                3,
                Utc::now(),
            ),
        }
    }

    pub fn source(mut self, source: &str) -> Self {
        self.session.source = source.to_string();
        self
    }

    pub fn status(mut self, status: SessionStatus) -> Self {
        self.session.status = status;
        if status.holds_slot() {
            self.session.started_at.get_or_insert(self.session.created_at);
        }
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.session.attempt = attempt;
        self
    }

    pub fn max_attempts(mut self, max: u32) -> Self {
        self.session.max_attempts = max;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.session.created_at = at;
        self
    }

    pub fn cancel_requested(mut self) -> Self {
        self.session.cancel_requested = true;
        self
    }

    pub fn fragments(mut self, fragments: Vec<PathBuf>) -> Self {
        self.session.fragments = fragments;
        self
    }

    pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.session.output_path = Some(path.into());
        self
    }

    pub fn build(self) -> Session {
        self.session
    }
}

/// Scheduler settings for tests: no disk floor, output under `/out`.
pub fn scheduler_settings(max_concurrent: usize) -> SchedulerSettings {
    SchedulerSettings {
        max_concurrent,
        max_attempts_default: 3,
        min_free_bytes: 1024,
        internal_fault_threshold: 3,
        output_directory: PathBuf::from("/out"),
        container: Container::Mp4,
    }
}

/// Deterministic, fast backoff: 20ms doubling up to 200ms, no jitter.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(20),
        cap: Duration::from_millis(200),
        jitter: 0.0,
    }
}

pub fn runtime_options() -> RuntimeOptions {
    RuntimeOptions {
        exit_when_idle: false,
        disk_recheck_interval: Duration::from_millis(20),
    }
}

/// Core scheduler over the given store and filesystem, guarding `/out`.
pub fn core_scheduler(
    settings: SchedulerSettings,
    store: impl SessionStore + 'static,
    fs: Arc<dyn FileSystem>,
) -> CoreScheduler {
    core_scheduler_with_options(settings, runtime_options(), store, fs)
}

pub fn core_scheduler_with_options(
    settings: SchedulerSettings,
    options: RuntimeOptions,
    store: impl SessionStore + 'static,
    fs: Arc<dyn FileSystem>,
) -> CoreScheduler {
    let guard = DiskSpaceGuard::new(fs, settings.output_directory.clone());
    CoreScheduler::new(settings, options, Box::new(store), guard, fast_retry())
}

/// Worker settings rooted at `work`, with a short grace period.
pub fn worker_settings(work: &Path) -> WorkerSettings {
    WorkerSettings {
        work_directory: work.to_path_buf(),
        grace_period: Duration::from_millis(100),
        max_duration: None,
        max_output_size: None,
        size_poll_interval: Duration::from_millis(10),
        container: Container::Mp4,
        write_metadata: false,
        quality: "best".to_string(),
    }
}

pub fn worker_context(
    fs: Arc<dyn FileSystem>,
    capture_tool: Arc<dyn ExternalToolRunner>,
    remux_tool: Arc<dyn ExternalToolRunner>,
    settings: WorkerSettings,
) -> WorkerContext {
    WorkerContext {
        fs,
        capture_tool,
        remux_tool,
        settings,
    }
}

/// Smallest file the mp4 verifier accepts: `ftyp`, `moov`, then `mdat`
/// carrying `payload`.
pub fn minimal_mp4(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for (kind, body) in [
        (b"ftyp", &b"isom\x00\x00\x02\x00isomiso2"[..]),
        (b"moov", &[0u8; 8][..]),
        (b"mdat", payload),
    ] {
        let size = u32::try_from(8 + body.len()).expect("box fits in u32");
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(body);
    }
    out
}
