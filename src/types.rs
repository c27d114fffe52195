use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry classification of an [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt after a backoff delay.
    Transient,
    /// Retrying cannot help (bad credentials, missing source, ...).
    Permanent,
    /// A fault inside multirec itself (spawn failure, persistence failure).
    Internal,
}

/// Stable failure kind carried by every `Failed` session.
///
/// The string form (see [`ErrorKind::as_str`]) is what gets persisted, so
/// variants must never be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkTimeout,
    NetworkError,
    ServerError,
    StreamNotLive,
    ToolExited,
    NoOutput,
    RemuxFailed,
    RemuxVerificationFailed,
    AuthenticationFailed,
    SourceNotFound,
    Configuration,
    DiskExhausted,
    Interrupted,
    Internal,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 14] = [
        ErrorKind::NetworkTimeout,
        ErrorKind::NetworkError,
        ErrorKind::ServerError,
        ErrorKind::StreamNotLive,
        ErrorKind::ToolExited,
        ErrorKind::NoOutput,
        ErrorKind::RemuxFailed,
        ErrorKind::RemuxVerificationFailed,
        ErrorKind::AuthenticationFailed,
        ErrorKind::SourceNotFound,
        ErrorKind::Configuration,
        ErrorKind::DiskExhausted,
        ErrorKind::Interrupted,
        ErrorKind::Internal,
    ];

    pub fn class(self) -> ErrorClass {
        match self {
            ErrorKind::NetworkTimeout
            | ErrorKind::NetworkError
            | ErrorKind::ServerError
            | ErrorKind::StreamNotLive
            | ErrorKind::ToolExited
            | ErrorKind::NoOutput
            | ErrorKind::RemuxFailed
            | ErrorKind::RemuxVerificationFailed => ErrorClass::Transient,
            ErrorKind::AuthenticationFailed
            | ErrorKind::SourceNotFound
            | ErrorKind::Configuration
            | ErrorKind::DiskExhausted
            | ErrorKind::Interrupted => ErrorClass::Permanent,
            ErrorKind::Internal => ErrorClass::Internal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ServerError => "server_error",
            ErrorKind::StreamNotLive => "stream_not_live",
            ErrorKind::ToolExited => "tool_exited",
            ErrorKind::NoOutput => "no_output",
            ErrorKind::RemuxFailed => "remux_failed",
            ErrorKind::RemuxVerificationFailed => "remux_verification_failed",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::SourceNotFound => "source_not_found",
            ErrorKind::Configuration => "configuration",
            ErrorKind::DiskExhausted => "disk_exhausted",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ErrorKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| format!("unknown error kind: {wanted}"))
    }
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' is missing a unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    let seconds_per_unit = match unit.as_str() {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => {
            return Err(format!(
                "unsupported duration unit '{}'; expected ms, s, m, or h",
                unit
            ))
        }
    };
    value
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{s}' is too large"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_string_form_round_trips_for_every_variant() {
        for kind in ErrorKind::ALL {
            assert_eq!(kind.as_str().parse::<ErrorKind>(), Ok(kind));
        }
        assert!("bogus".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn classification_matches_retry_taxonomy() {
        assert_eq!(ErrorKind::NetworkTimeout.class(), ErrorClass::Transient);
        assert_eq!(
            ErrorKind::RemuxVerificationFailed.class(),
            ErrorClass::Transient
        );
        assert_eq!(ErrorKind::AuthenticationFailed.class(), ErrorClass::Permanent);
        assert_eq!(ErrorKind::DiskExhausted.class(), ErrorClass::Permanent);
        assert_eq!(ErrorKind::Internal.class(), ErrorClass::Internal);
    }

    #[test]
    fn parses_durations_with_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration(" 3s "), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("10m"), Ok(Duration::from_secs(600)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("12").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let max = u64::MAX;
        assert_eq!(parse_duration(&format!("{max}s")), Ok(Duration::from_secs(max)));
        assert!(parse_duration(&format!("{max}m")).is_err());
        assert!(parse_duration(&format!("{}h", max / 60)).is_err());
    }
}
