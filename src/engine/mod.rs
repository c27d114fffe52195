// src/engine/mod.rs

//! Session scheduler for multirec.
//!
//! This module ties together:
//! - the session registry and the FIFO admission queue
//! - the concurrency permit pool and the disk-space guard
//! - retry decisions and the session state machine
//! - the main runtime event loop that reacts to:
//!   - submissions and cancellations from the control surface
//!   - worker reports
//!   - admission re-checks (timers, disk re-checks)
//!   - shutdown requests
//!
//! The pure core lives in [`core`]; the async/IO shell is implemented in
//! [`runtime`], and callers talk to it through [`handle::SchedulerHandle`].

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::session::{Session, SessionId, SessionStatus};
use crate::types::ErrorKind;

/// Which worker a slot is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Capture,
    Remux,
}

impl Phase {
    pub fn status(self) -> SessionStatus {
        match self {
            Phase::Capture => SessionStatus::Capturing,
            Phase::Remux => SessionStatus::Remuxing,
        }
    }
}

/// Work handed to a worker: a snapshot of the session and the phase to run.
///
/// The worker owns the snapshot for the life of its slot and gives nothing
/// back except its [`WorkerOutcome`].
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub session: Session,
    pub phase: Phase,
}

/// Single result of one worker run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// Capture produced these fragments (sorted, non-empty files).
    Captured { fragments: Vec<PathBuf> },
    /// Remux output is verified and in place at `output`.
    Remuxed { output: PathBuf, content_hash: String },
    Failed { kind: ErrorKind, detail: String },
    /// The worker was stopped before finishing.
    Cancelled,
}

impl WorkerOutcome {
    pub fn failed(kind: ErrorKind, detail: impl Into<String>) -> Self {
        WorkerOutcome::Failed {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub session_id: SessionId,
    pub phase: Phase,
    pub outcome: WorkerOutcome,
}

/// Published after every committed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub session_id: SessionId,
    /// `None` when the session was just created.
    pub old_status: Option<SessionStatus>,
    pub new_status: SessionStatus,
    pub timestamp: DateTime<Utc>,
}

/// What `shutdown` leaves behind for the next start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    /// Sessions that were not terminal when the runtime stopped.
    pub non_terminal: Vec<Session>,
}

/// Runtime options used by both the core and the async shell.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// If true, exit the runtime once nothing is queued or in flight (used
    /// for `--once`).
    pub exit_when_idle: bool,
    /// How often a paused admission loop re-checks disk headroom.
    pub disk_recheck_interval: Duration,
}

/// Events flowing into the runtime from the control surface and workers.
#[derive(Debug)]
pub enum EngineEvent {
    /// New session; the id is generated by the handle so the caller gets it
    /// back without waiting.
    Submit {
        id: SessionId,
        source: String,
        max_attempts: Option<u32>,
    },
    Cancel {
        id: SessionId,
    },
    Worker(WorkerReport),
    /// Re-evaluate admission (backoff expired, disk re-check).
    Tick,
    /// Clear an admission pause caused by repeated internal faults.
    ResumeAdmission,
    ListSessions {
        reply: oneshot::Sender<Vec<Session>>,
    },
    Shutdown {
        drain: Duration,
        reply: oneshot::Sender<ShutdownReport>,
    },
}

pub mod admission;
pub mod core;
pub mod event_handlers;
pub mod handle;
pub mod runtime;

pub use admission::{AdmissionQueue, PermitPool};
pub use core::{CoreScheduler, SchedulerSettings};
pub use event_handlers::{CoreCommand, CoreStep};
pub use handle::{EventSubscription, SchedulerHandle};
pub use runtime::Runtime;
