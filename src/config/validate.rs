// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{
    CaptureConfig, ConfigFile, PathsConfig, RawCaptureSection, RawConfigFile, RawPathsSection,
    RawRemuxSection, RawSchedulerSection, RemuxConfig, SchedulerConfig,
};
use crate::errors::{MultirecError, Result};
use crate::exec::tools::{check_placeholders, CommandTemplate, CAPTURE_PLACEHOLDERS, REMUX_PLACEHOLDERS};
use crate::types::parse_duration;
use crate::worker::Container;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = MultirecError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let scheduler = validate_scheduler(raw.scheduler)?;
        let paths = validate_paths(raw.paths)?;
        let capture = validate_capture(raw.capture)?;
        let remux = validate_remux(raw.remux)?;
        Ok(ConfigFile {
            scheduler,
            paths,
            capture,
            remux,
        })
    }
}

fn config_error(msg: impl Into<String>) -> MultirecError {
    MultirecError::ConfigError(msg.into())
}

fn duration(key: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| config_error(format!("{key}: {e}")))
}

fn positive_duration(key: &str, value: &str) -> Result<Duration> {
    let d = duration(key, value)?;
    if d.is_zero() {
        return Err(config_error(format!("{key} must be greater than zero")));
    }
    Ok(d)
}

fn validate_scheduler(raw: RawSchedulerSection) -> Result<SchedulerConfig> {
    if raw.max_concurrent == 0 {
        return Err(config_error(
            "[scheduler].max_concurrent must be >= 1 (got 0)",
        ));
    }
    if raw.max_attempts_default == 0 {
        return Err(config_error(
            "[scheduler].max_attempts_default must be >= 1 (got 0)",
        ));
    }
    if !(0.0..=1.0).contains(&raw.backoff_jitter) {
        return Err(config_error(format!(
            "[scheduler].backoff_jitter must be between 0.0 and 1.0 (got {})",
            raw.backoff_jitter
        )));
    }

    let backoff_base = positive_duration("[scheduler].backoff_base", &raw.backoff_base)?;
    let backoff_cap = positive_duration("[scheduler].backoff_cap", &raw.backoff_cap)?;
    if backoff_cap < backoff_base {
        return Err(config_error(format!(
            "[scheduler].backoff_cap ({}) is shorter than backoff_base ({})",
            raw.backoff_cap, raw.backoff_base
        )));
    }

    Ok(SchedulerConfig {
        max_concurrent: raw.max_concurrent,
        max_attempts_default: raw.max_attempts_default,
        min_free_bytes: raw.min_free_bytes,
        backoff_base,
        backoff_cap,
        backoff_jitter: raw.backoff_jitter,
        capture_grace_period: duration(
            "[scheduler].capture_grace_period",
            &raw.capture_grace_period,
        )?,
        drain_timeout: duration("[scheduler].drain_timeout", &raw.drain_timeout)?,
        disk_recheck_interval: positive_duration(
            "[scheduler].disk_recheck_interval",
            &raw.disk_recheck_interval,
        )?,
        internal_fault_threshold: raw.internal_fault_threshold,
    })
}

fn validate_paths(raw: RawPathsSection) -> Result<PathsConfig> {
    if raw.output_directory.as_os_str().is_empty() {
        return Err(config_error("[paths].output_directory must not be empty"));
    }
    if raw.database.as_os_str().is_empty() {
        return Err(config_error("[paths].database must not be empty"));
    }
    let work_directory = raw
        .work_directory
        .unwrap_or_else(|| raw.output_directory.join(".work"));
    if work_directory == raw.output_directory {
        return Err(config_error(
            "[paths].work_directory must differ from output_directory",
        ));
    }
    Ok(PathsConfig {
        output_directory: raw.output_directory,
        work_directory,
        database: raw.database,
    })
}

fn template(section: &str, program: String, args: Vec<String>, allowed: &[&str]) -> Result<CommandTemplate> {
    if program.trim().is_empty() {
        return Err(config_error(format!("[{section}].program must not be empty")));
    }
    let template = CommandTemplate::new(program, args);
    check_placeholders(&template, allowed)
        .map_err(|e| config_error(format!("[{section}].args: {e}")))?;
    Ok(template)
}

fn validate_capture(raw: RawCaptureSection) -> Result<CaptureConfig> {
    if raw.quality.trim().is_empty() {
        return Err(config_error("[capture].quality must not be empty"));
    }
    if !raw.args.iter().any(|a| a.contains("{source}")) {
        return Err(config_error("[capture].args must reference {source}"));
    }
    if raw.max_output_size == Some(0) {
        return Err(config_error("[capture].max_output_size must be > 0 when set"));
    }
    let max_duration = raw
        .max_duration
        .as_deref()
        .map(|s| positive_duration("[capture].max_duration", s))
        .transpose()?;

    Ok(CaptureConfig {
        command: template("capture", raw.program, raw.args, CAPTURE_PLACEHOLDERS)?,
        quality: raw.quality,
        max_duration,
        max_output_size: raw.max_output_size,
        size_poll_interval: positive_duration("[capture].size_poll_interval", &raw.size_poll_interval)?,
    })
}

fn validate_remux(raw: RawRemuxSection) -> Result<RemuxConfig> {
    let container: Container = raw
        .container
        .parse()
        .map_err(|e| config_error(format!("[remux].container: {e}")))?;
    for required in ["{concat_list}", "{output}"] {
        if !raw.args.iter().any(|a| a.contains(required)) {
            return Err(config_error(format!("[remux].args must reference {required}")));
        }
    }
    Ok(RemuxConfig {
        command: template("remux", raw.program, raw.args, REMUX_PLACEHOLDERS)?,
        container,
        write_metadata: raw.write_metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<ConfigFile> {
        let raw: RawConfigFile = toml::from_str(toml_src)?;
        ConfigFile::try_from(raw)
    }

    fn expect_config_error(toml_src: &str, needle: &str) {
        match parse(toml_src) {
            Err(MultirecError::ConfigError(msg)) => {
                assert!(msg.contains(needle), "message {msg:?} should mention {needle:?}")
            }
            other => panic!("expected ConfigError mentioning {needle:?}, got {other:?}"),
        }
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.scheduler.max_concurrent, 2);
        assert_eq!(cfg.scheduler.backoff_base, Duration::from_secs(5));
        assert_eq!(cfg.scheduler.backoff_cap, Duration::from_secs(300));
        assert_eq!(cfg.paths.work_directory, std::path::PathBuf::from("recordings/.work"));
        assert_eq!(cfg.remux.container, Container::Mp4);
        assert_eq!(cfg.capture.command.program, "yt-dlp");
        assert_eq!(cfg, ConfigFile::default());
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = parse(
            r#"
            [scheduler]
            max_concurrent = 4
            backoff_base = "250ms"
            backoff_cap = "2s"

            [capture]
            quality = "720p"
            max_duration = "2h"
            max_output_size = 1000

            [remux]
            container = "mkv"
            write_metadata = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.scheduler.max_concurrent, 4);
        assert_eq!(cfg.scheduler.backoff_base, Duration::from_millis(250));
        assert_eq!(cfg.capture.max_duration, Some(Duration::from_secs(7200)));
        assert_eq!(cfg.remux.container, Container::Mkv);
        assert_eq!(cfg.worker_settings().quality, "720p");
        assert_eq!(cfg.scheduler_settings().container, Container::Mkv);
    }

    #[test]
    fn rejects_bad_values_naming_the_key() {
        expect_config_error("[scheduler]\nmax_concurrent = 0", "max_concurrent");
        expect_config_error("[scheduler]\nbackoff_base = \"5 parsecs\"", "backoff_base");
        expect_config_error(
            "[scheduler]\nbackoff_base = \"10m\"\nbackoff_cap = \"1m\"",
            "backoff_cap",
        );
        expect_config_error("[scheduler]\nbackoff_jitter = 1.5", "backoff_jitter");
        expect_config_error(
            "[scheduler]\ndrain_timeout = \"18446744073709551615m\"",
            "drain_timeout",
        );
        expect_config_error("[remux]\ncontainer = \"avi\"", "container");
        expect_config_error("[capture]\nargs = [\"{source}\", \"{bogus}\"]", "[capture].args");
        expect_config_error("[capture]\nargs = [\"--newline\"]", "{source}");
        expect_config_error("[remux]\nargs = [\"-i\", \"{concat_list}\"]", "{output}");
    }
}
