// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::loader::DEFAULT_CONFIG_FILE;

/// Command-line arguments for `multirec`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "multirec",
    version,
    about = "Record several live streams concurrently: capture, remux, verify.",
    long_about = None
)]
pub struct CliArgs {
    /// Stream sources to record (URLs or channel descriptors).
    #[arg(value_name = "SOURCE")]
    pub sources: Vec<String>,

    /// Path to the config file (TOML).
    ///
    /// Default: `multirec.toml` in the current working directory; built-in
    /// defaults are used when that file does not exist.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Exit once no session is queued or in flight.
    #[arg(long)]
    pub once: bool,

    /// Attempt limit for the sources given on this command line.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: Option<u32>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `MULTIREC_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Load + validate config, show what would be resumed, record nothing.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sources_and_flags() {
        let args = CliArgs::try_parse_from([
            "multirec",
            "--once",
            "--max-attempts",
            "5",
            "https://a.test/live",
            "stream-b",
        ])
        .unwrap();
        assert_eq!(args.sources, vec!["https://a.test/live", "stream-b"]);
        assert!(args.once);
        assert_eq!(args.max_attempts, Some(5));
        assert_eq!(args.config, PathBuf::from("multirec.toml"));
    }

    #[test]
    fn rejects_zero_attempts() {
        assert!(CliArgs::try_parse_from(["multirec", "--max-attempts", "0"]).is_err());
    }
}
