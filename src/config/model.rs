// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::SchedulerSettings;
use crate::exec::tools::{default_capture_args, default_remux_args, CommandTemplate};
use crate::retry::RetryPolicy;
use crate::worker::{Container, WorkerSettings};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [scheduler]
/// max_concurrent = 2
/// max_attempts_default = 3
/// min_free_bytes = 1073741824
/// backoff_base = "5s"
/// backoff_cap = "5m"
///
/// [paths]
/// output_directory = "recordings"
///
/// [capture]
/// quality = "best"
/// max_duration = "6h"
///
/// [remux]
/// container = "mp4"
/// ```
///
/// All sections are optional and have reasonable defaults. Durations are
/// strings here; [`ConfigFile`] holds the parsed, validated form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub scheduler: RawSchedulerSection,

    #[serde(default)]
    pub paths: RawPathsSection,

    #[serde(default)]
    pub capture: RawCaptureSection,

    #[serde(default)]
    pub remux: RawRemuxSection,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawSchedulerSection {
    /// Size of the permit pool: sessions in Capturing or Remuxing at once.
    pub max_concurrent: usize,
    /// Used when `submit` does not name its own limit.
    pub max_attempts_default: u32,
    /// Admission needs at least this much free space on the output volume.
    pub min_free_bytes: u64,
    pub backoff_base: String,
    pub backoff_cap: String,
    /// Fraction of the delay added as random jitter.
    pub backoff_jitter: f64,
    /// Time between the graceful stop request and the forced kill.
    pub capture_grace_period: String,
    pub drain_timeout: String,
    pub disk_recheck_interval: String,
    /// Consecutive internal faults that pause admission; 0 never pauses.
    pub internal_fault_threshold: u32,
}

impl Default for RawSchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_attempts_default: 3,
            min_free_bytes: 1 << 30,
            backoff_base: "5s".to_string(),
            backoff_cap: "5m".to_string(),
            backoff_jitter: 0.2,
            capture_grace_period: "10s".to_string(),
            drain_timeout: "30s".to_string(),
            disk_recheck_interval: "30s".to_string(),
            internal_fault_threshold: 5,
        }
    }
}

/// `[paths]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawPathsSection {
    pub output_directory: PathBuf,
    /// Per-session scratch space; defaults to `<output_directory>/.work`.
    pub work_directory: Option<PathBuf>,
    pub database: PathBuf,
}

impl Default for RawPathsSection {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from("recordings"),
            work_directory: None,
            database: PathBuf::from("multirec.db"),
        }
    }
}

/// `[capture]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawCaptureSection {
    pub program: String,
    /// Argument templates; may use `{source}`, `{work_dir}` and `{quality}`.
    pub args: Vec<String>,
    pub quality: String,
    /// Stop the capture after this long and keep what was recorded.
    pub max_duration: Option<String>,
    /// Stop the capture once the fragments reach this many bytes.
    pub max_output_size: Option<u64>,
    pub size_poll_interval: String,
}

impl Default for RawCaptureSection {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            args: default_capture_args(),
            quality: "best".to_string(),
            max_duration: None,
            max_output_size: None,
            size_poll_interval: "5s".to_string(),
        }
    }
}

/// `[remux]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawRemuxSection {
    pub program: String,
    /// Argument templates; may use `{concat_list}`, `{output}` and `{work_dir}`.
    pub args: Vec<String>,
    pub container: String,
    /// Write `<output>.json` next to each finished recording.
    pub write_metadata: bool,
}

impl Default for RawRemuxSection {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: default_remux_args(),
            container: "mp4".to_string(),
            write_metadata: true,
        }
    }
}

/// Validated, immutable configuration.
///
/// Build it with `ConfigFile::try_from(raw)` (see `validate.rs`) or
/// [`crate::config::load_and_validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFile {
    pub scheduler: SchedulerConfig,
    pub paths: PathsConfig,
    pub capture: CaptureConfig,
    pub remux: RemuxConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub max_attempts_default: u32,
    pub min_free_bytes: u64,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub backoff_jitter: f64,
    pub capture_grace_period: Duration,
    pub drain_timeout: Duration,
    pub disk_recheck_interval: Duration,
    pub internal_fault_threshold: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathsConfig {
    pub output_directory: PathBuf,
    pub work_directory: PathBuf,
    pub database: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub command: CommandTemplate,
    pub quality: String,
    pub max_duration: Option<Duration>,
    pub max_output_size: Option<u64>,
    pub size_poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemuxConfig {
    pub command: CommandTemplate,
    pub container: Container,
    pub write_metadata: bool,
}

impl Default for ConfigFile {
    fn default() -> Self {
        // The built-in defaults always validate.
        match ConfigFile::try_from(RawConfigFile::default()) {
            Ok(cfg) => cfg,
            Err(err) => unreachable!("built-in defaults are invalid: {err}"),
        }
    }
}

impl ConfigFile {
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent: self.scheduler.max_concurrent,
            max_attempts_default: self.scheduler.max_attempts_default,
            min_free_bytes: self.scheduler.min_free_bytes,
            internal_fault_threshold: self.scheduler.internal_fault_threshold,
            output_directory: self.paths.output_directory.clone(),
            container: self.remux.container,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            work_directory: self.paths.work_directory.clone(),
            grace_period: self.scheduler.capture_grace_period,
            max_duration: self.capture.max_duration,
            max_output_size: self.capture.max_output_size,
            size_poll_interval: self.capture.size_poll_interval,
            container: self.remux.container,
            write_metadata: self.remux.write_metadata,
            quality: self.capture.quality.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: self.scheduler.backoff_base,
            cap: self.scheduler.backoff_cap,
            jitter: self.scheduler.backoff_jitter,
        }
    }
}
