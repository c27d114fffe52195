// src/session/model.rs

//! The `Session` entity: one capture-then-remux workflow instance.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{MultirecError, Result};
use crate::types::ErrorKind;

/// Unique, immutable session identifier.
///
/// Ids are `rec-<uuid v7>`, so lexical order follows creation order within a
/// process. The scheduler still orders its queue by `created_at` first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(format!("rec-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last eight characters, used in output file names.
    pub fn short(&self) -> &str {
        let start = self.0.len().saturating_sub(8);
        self.0.get(start..).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Queued,
    Capturing,
    Remuxing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Completed, Failed and Cancelled admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Capturing and Remuxing each hold one concurrency slot.
    pub fn holds_slot(self) -> bool {
        matches!(self, SessionStatus::Capturing | SessionStatus::Remuxing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Queued => "queued",
            SessionStatus::Capturing => "capturing",
            SessionStatus::Remuxing => "remuxing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Ok(SessionStatus::Queued),
            "capturing" => Ok(SessionStatus::Capturing),
            "remuxing" => Ok(SessionStatus::Remuxing),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One recording workflow.
///
/// Only the scheduler's registry mutates a live session, and only through
/// [`crate::session::machine::apply`] for status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub source: String,
    pub status: SessionStatus,
    /// Number of failed attempts that were requeued so far.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Final container location; set once, on the first entry into Remuxing.
    pub output_path: Option<PathBuf>,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    /// Fragments of the last successful capture, kept for a remux-only retry.
    pub fragments: Vec<PathBuf>,
    /// Earliest admission time after a backoff.
    pub retry_at: Option<DateTime<Utc>>,
    pub last_backoff_ms: Option<u64>,
}

impl Session {
    pub fn new(id: SessionId, source: String, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            source,
            status: SessionStatus::Queued,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            output_path: None,
            error_kind: None,
            error_detail: None,
            created_at: now,
            started_at: None,
            ended_at: None,
            cancel_requested: false,
            fragments: Vec::new(),
            retry_at: None,
            last_backoff_ms: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Queued and past any backoff delay.
    pub fn is_admissible(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Queued && self.retry_at.is_none_or(|at| at <= now)
    }
}

static SOURCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z][A-Za-z0-9+.\-]*://[^\s/?#]+\S*|[A-Za-z0-9][^\s:]*)$")
        .expect("valid source regex")
});

/// Check that a source descriptor is URL-like: either `scheme://authority[rest]`
/// or a bare channel token such as `stream-a`. Whitespace is never allowed.
pub fn validate_source(source: &str) -> Result<()> {
    if source.is_empty() {
        return Err(MultirecError::InvalidSource(
            "source must not be empty".to_string(),
        ));
    }
    if !SOURCE_PATTERN.is_match(source) {
        return Err(MultirecError::InvalidSource(format!(
            "'{source}' is not a URL-like stream descriptor"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_url_like_sources() {
        assert!(validate_source("https://www.twitch.tv/somechannel").is_ok());
        assert!(validate_source("rtmp://live.example.com/app/key").is_ok());
        assert!(validate_source("stream-a://x").is_ok());
        assert!(validate_source("stream-A").is_ok());
    }

    #[test]
    fn rejects_malformed_sources() {
        for bad in ["", "https://", "https:// spaced.example", "://host", "1http://x"] {
            match validate_source(bad) {
                Err(MultirecError::InvalidSource(_)) => {}
                other => panic!("expected InvalidSource for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn status_round_trips_and_classifies() {
        for status in [
            SessionStatus::Queued,
            SessionStatus::Capturing,
            SessionStatus::Remuxing,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>(), Ok(status));
            assert!(!(status.is_terminal() && status.holds_slot()));
        }
    }

    #[test]
    fn new_sessions_start_queued_with_at_least_one_attempt() {
        let s = Session::new(SessionId::from("rec-1"), "https://x.test/a".into(), 0, Utc::now());
        assert_eq!(s.status, SessionStatus::Queued);
        assert_eq!(s.attempt, 0);
        assert_eq!(s.max_attempts, 1);
        assert!(s.is_admissible(Utc::now()));
    }
}
