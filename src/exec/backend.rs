// src/exec/backend.rs

//! Pluggable worker backend abstraction.
//!
//! The runtime talks to a `WorkerBackend` instead of spawning workers itself.
//! This makes it easy to swap in a fake backend in tests while keeping the
//! production worker pipeline in [`PipelineBackend`].
//!
//! - `PipelineBackend` runs the capture and remux workers as Tokio tasks and
//!   sends each outcome back to the runtime as an `EngineEvent::Worker`.
//! - Tests can provide their own `WorkerBackend` that records assignments and
//!   emits reports on demand.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::engine::{Assignment, EngineEvent, Phase, WorkerOutcome, WorkerReport};
use crate::errors::Result;
use crate::session::SessionId;
use crate::types::ErrorKind;
use crate::worker::{capture, remux, WorkerContext};

/// Trait abstracting how assignments are executed.
///
/// Production code uses [`PipelineBackend`]; tests can provide their own
/// implementation that doesn't spawn real processes.
pub trait WorkerBackend: Send {
    /// Start a worker for `assignment`. Its outcome must eventually arrive
    /// at the runtime as exactly one `EngineEvent::Worker`, unless the worker
    /// is aborted.
    fn dispatch(
        &mut self,
        assignment: Assignment,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Ask the worker for `id` to stop (graceful, then forced).
    fn stop(&mut self, id: &SessionId);

    /// Force-terminate every remaining worker without waiting for reports.
    fn abort_all(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Internal handle for a running worker.
///
/// - `cancel` asks the worker to stop its process gracefully.
/// - `handle` is the supervising task. Aborting it aborts the worker task
///   under it, which drops the process handle and kills the child.
struct ActiveWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Panic payload as text, when it is one.
fn panic_detail(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Real backend used in production.
pub struct PipelineBackend {
    ctx: Arc<WorkerContext>,
    report_tx: mpsc::UnboundedSender<EngineEvent>,
    active: HashMap<SessionId, ActiveWorker>,
}

impl PipelineBackend {
    pub fn new(ctx: WorkerContext, report_tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            ctx: Arc::new(ctx),
            report_tx,
            active: HashMap::new(),
        }
    }

    fn reap_finished(&mut self) {
        self.active.retain(|_, w| !w.handle.is_finished());
    }
}

impl WorkerBackend for PipelineBackend {
    fn dispatch(
        &mut self,
        assignment: Assignment,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.reap_finished();

            let id = assignment.session.id.clone();
            if let Some(previous) = self.active.remove(&id) {
                // The scheduler only dispatches a new phase after the previous
                // one reported, so this task is already on its way out.
                debug!(session = %id, "replacing finished worker handle");
                previous.cancel.cancel();
            }

            let cancel = CancellationToken::new();
            let token = cancel.clone();
            let ctx = Arc::clone(&self.ctx);
            let tx = self.report_tx.clone();
            let phase = assignment.phase;
            let session = assignment.session;
            let spawn_id = id.clone();

            let handle = tokio::spawn(async move {
                // The worker runs in its own task so a panic still ends in a report.
                let worker = AbortOnDropHandle::new(tokio::spawn(async move {
                    match phase {
                        Phase::Capture => capture::run(&ctx, &session, &token).await,
                        Phase::Remux => remux::run(&ctx, &session, &token).await,
                    }
                }));
                let outcome = match worker.await {
                    Ok(outcome) => outcome,
                    Err(err) if err.is_panic() => {
                        let detail = panic_detail(err.into_panic());
                        error!(session = %spawn_id, ?phase, detail = %detail, "worker panicked");
                        WorkerOutcome::failed(ErrorKind::Internal, format!("worker panicked: {detail}"))
                    }
                    Err(err) => {
                        debug!(session = %spawn_id, ?phase, error = %err, "worker task cancelled");
                        return;
                    }
                };
                debug!(session = %spawn_id, ?phase, ?outcome, "worker finished");
                let report = WorkerReport {
                    session_id: spawn_id,
                    phase,
                    outcome,
                };
                if tx.send(EngineEvent::Worker(report)).is_err() {
                    warn!("runtime gone; dropping worker report");
                }
            });

            self.active.insert(id, ActiveWorker { cancel, handle });
            Ok(())
        })
    }

    fn stop(&mut self, id: &SessionId) {
        match self.active.get(id) {
            Some(worker) if !worker.handle.is_finished() => {
                info!(session = %id, "stopping worker");
                worker.cancel.cancel();
            }
            _ => debug!(session = %id, "no running worker to stop"),
        }
    }

    fn abort_all(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            for (id, worker) in self.active.drain() {
                if worker.handle.is_finished() {
                    continue;
                }
                warn!(session = %id, "force-terminating worker");
                worker.cancel.cancel();
                worker.handle.abort();
                let _ = worker.handle.await;
            }
        })
    }
}
