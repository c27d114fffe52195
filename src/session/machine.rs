// src/session/machine.rs

//! Pure session transition function.
//!
//! [`apply`] is the only place that changes `Session::status`. It never does IO
//! and never looks at a clock other than the `now` it is handed, which keeps it
//! usable from the scheduler core, from reconciliation and from tests.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::retry::RetryDecision;
use crate::session::model::{Session, SessionStatus};
use crate::types::ErrorKind;

/// Something that happened to a session, as seen by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A slot and disk headroom were granted.
    Admitted,
    /// Cancellation took effect (immediately for Queued, on worker
    /// confirmation for in-flight sessions).
    Cancel,
    /// Capture finished; `output_path` is the planned final location.
    CaptureSucceeded {
        output_path: PathBuf,
        fragments: Vec<PathBuf>,
    },
    RemuxSucceeded,
    /// Capture or remux failed; `decision` comes from the retry policy.
    Failed {
        kind: ErrorKind,
        detail: String,
        decision: RetryDecision,
    },
    /// The previous process died while this session held a slot.
    Interrupted,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Admitted => "admitted",
            SessionEvent::Cancel => "cancel",
            SessionEvent::CaptureSucceeded { .. } => "capture_succeeded",
            SessionEvent::RemuxSucceeded => "remux_succeeded",
            SessionEvent::Failed { .. } => "failed",
            SessionEvent::Interrupted => "interrupted",
        }
    }
}

/// An event that has no edge from the session's current status.
///
/// This is a programming fault in the caller, never a user-facing condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition from {from} on '{event}'")]
pub struct InvalidTransition {
    pub from: SessionStatus,
    pub event: &'static str,
}

/// A committed status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// True when `(from, to)` is an edge of the session lifecycle.
pub fn is_legal(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
        (from, to),
        (Queued, Capturing)
            | (Queued, Cancelled)
            | (Capturing, Remuxing)
            | (Capturing, Queued)
            | (Capturing, Failed)
            | (Capturing, Cancelled)
            | (Remuxing, Completed)
            | (Remuxing, Queued)
            | (Remuxing, Failed)
            | (Remuxing, Cancelled)
    )
}

/// Apply `event` to `session`.
///
/// On error the session is left untouched.
pub fn apply(
    session: &mut Session,
    event: SessionEvent,
    now: DateTime<Utc>,
) -> Result<Transition, InvalidTransition> {
    use SessionStatus::*;

    let from = session.status;
    let invalid = InvalidTransition {
        from,
        event: event.name(),
    };

    let to = match (from, event) {
        (Queued, SessionEvent::Admitted) => {
            session.started_at.get_or_insert(now);
            session.retry_at = None;
            Capturing
        }
        (Queued | Capturing | Remuxing, SessionEvent::Cancel) => {
            session.cancel_requested = true;
            session.ended_at = Some(now);
            Cancelled
        }
        (
            Capturing,
            SessionEvent::CaptureSucceeded {
                output_path,
                fragments,
            },
        ) => {
            if session.output_path.is_none() {
                session.output_path = Some(output_path);
            }
            session.fragments = fragments;
            Remuxing
        }
        (Remuxing, SessionEvent::RemuxSucceeded) => {
            session.ended_at = Some(now);
            session.error_kind = None;
            session.error_detail = None;
            Completed
        }
        (
            Capturing | Remuxing,
            SessionEvent::Failed {
                kind,
                detail,
                decision,
            },
        ) => {
            // Fragments from a failed capture are never trusted again.
            if from == Capturing {
                session.fragments.clear();
            }
            session.error_kind = Some(kind);
            session.error_detail = Some(detail);
            match decision {
                RetryDecision::Retry { delay }
                    if session.attempt.saturating_add(1) < session.max_attempts =>
                {
                    session.attempt += 1;
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    session.last_backoff_ms = Some(delay_ms);
                    session.retry_at = Some(
                        now + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::MAX),
                    );
                    Queued
                }
                _ => {
                    session.ended_at = Some(now);
                    Failed
                }
            }
        }
        (Capturing | Remuxing, SessionEvent::Interrupted) => {
            // The interrupted try counts toward the limit, as a failure would.
            if session.attempt.saturating_add(1) < session.max_attempts {
                Queued
            } else {
                session.error_kind = Some(ErrorKind::Interrupted);
                session.error_detail =
                    Some("process stopped while the session was in flight".to_string());
                session.ended_at = Some(now);
                Failed
            }
        }
        _ => return Err(invalid),
    };

    session.status = to;
    debug_assert!(is_legal(from, to));
    Ok(Transition { from, to })
}
