// src/exec/runner.rs

//! The external-tool capability the workers depend on.
//!
//! A worker never knows which program it is driving. It asks an
//! [`ExternalToolRunner`] to start a [`ToolInvocation`], then reads
//! [`ProcessEvent`]s from the returned [`ToolProcess`] and lets the runner
//! classify each output line into a [`ToolSignal`].

use std::fmt::Debug;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use crate::session::SessionId;
use crate::types::ErrorKind;

/// What to run, independent of any command-line shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    Capture {
        session_id: SessionId,
        source: String,
        /// Directory the tool writes its fragments into.
        work_dir: PathBuf,
    },
    Remux {
        session_id: SessionId,
        fragments: Vec<PathBuf>,
        /// File listing `fragments` in concat-demuxer syntax.
        concat_list: PathBuf,
        /// Temporary output path; never the final location.
        output: PathBuf,
        work_dir: PathBuf,
    },
}

impl ToolInvocation {
    pub fn session_id(&self) -> &SessionId {
        match self {
            ToolInvocation::Capture { session_id, .. } | ToolInvocation::Remux { session_id, .. } => {
                session_id
            }
        }
    }

    pub fn work_dir(&self) -> &PathBuf {
        match self {
            ToolInvocation::Capture { work_dir, .. } | ToolInvocation::Remux { work_dir, .. } => {
                work_dir
            }
        }
    }
}

/// Exit status of a tool process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolExit {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub success: bool,
}

impl ToolExit {
    pub fn killed() -> Self {
        Self {
            code: None,
            success: false,
        }
    }
}

/// One thing a running tool did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of stdout or stderr.
    Line(String),
    /// The process exited; no further events follow.
    Exited(ToolExit),
}

/// Parsed `[download]` progress line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub total_mib: Option<f64>,
    pub eta: Option<String>,
}

/// Conditions after which the tool is not expected to produce anything more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCondition {
    NotLive,
    EndedNormally,
    NetworkTimeout,
    NetworkError,
    ServerError,
    AuthenticationFailed,
    SourceNotFound,
    DiskExhausted,
}

impl TerminalCondition {
    /// Error kind for a failing condition; `None` for a normal end.
    pub fn error_kind(self) -> Option<ErrorKind> {
        match self {
            TerminalCondition::EndedNormally => None,
            TerminalCondition::NotLive => Some(ErrorKind::StreamNotLive),
            TerminalCondition::NetworkTimeout => Some(ErrorKind::NetworkTimeout),
            TerminalCondition::NetworkError => Some(ErrorKind::NetworkError),
            TerminalCondition::ServerError => Some(ErrorKind::ServerError),
            TerminalCondition::AuthenticationFailed => Some(ErrorKind::AuthenticationFailed),
            TerminalCondition::SourceNotFound => Some(ErrorKind::SourceNotFound),
            TerminalCondition::DiskExhausted => Some(ErrorKind::DiskExhausted),
        }
    }
}

/// Classification of one output line.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolSignal {
    Progress(ProgressUpdate),
    Terminal(TerminalCondition),
    /// Anything else; kept for the error-detail tail.
    Output,
}

/// A started external process.
///
/// Futures returned here must be cancel-safe: the workers poll them inside
/// `tokio::select!` next to cancellation and cap timers.
pub trait ToolProcess: Send {
    /// Next output line, or the exit status once output is exhausted.
    /// Returns `None` after `Exited` has been delivered.
    fn next_event(&mut self) -> Pin<Box<dyn Future<Output = Option<ProcessEvent>> + Send + '_>>;

    /// Ask the process to finish on its own (SIGTERM on unix).
    fn request_stop(&mut self) -> anyhow::Result<()>;

    /// Force termination.
    fn kill(&mut self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Wait for exit, discarding any remaining output.
    fn wait(&mut self) -> Pin<Box<dyn Future<Output = anyhow::Result<ToolExit>> + Send + '_>>;
}

/// Capability to run one kind of external tool.
pub trait ExternalToolRunner: Send + Sync + Debug {
    /// Short tool name for logs.
    fn name(&self) -> &str;

    fn start(&self, invocation: &ToolInvocation) -> anyhow::Result<Box<dyn ToolProcess>>;

    fn classify(&self, line: &str) -> ToolSignal;
}
