// src/engine/runtime.rs

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::exec::WorkerBackend;
use crate::types::ErrorKind;

use super::core::CoreScheduler;
use super::handle::SchedulerHandle;
use super::{
    CoreCommand, EngineEvent, ShutdownReport, StateChange, WorkerOutcome, WorkerReport,
};

const EVENT_BUFFER: usize = 1024;

/// Drives the core scheduler in response to `EngineEvent`s, and delegates
/// the actual work to a `WorkerBackend`.
///
/// This is a pure IO shell around `CoreScheduler`, which contains all the
/// scheduling semantics. This struct handles async IO: reading events from
/// the channel, dispatching workers, publishing state changes, timers and
/// the shutdown drain.
pub struct Runtime<B: WorkerBackend> {
    core: CoreScheduler,
    event_rx: mpsc::UnboundedReceiver<EngineEvent>,
    /// Used for synthesized worker reports.
    self_tx: mpsc::UnboundedSender<EngineEvent>,
    backend: B,
    events: broadcast::Sender<StateChange>,
    /// Single re-armable timer for the core's `WakeAt` requests.
    wake_at: Option<Instant>,
}

impl<B: WorkerBackend> fmt::Debug for Runtime<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<B: WorkerBackend> Runtime<B> {
    /// Build the runtime and the handle callers use to talk to it.
    ///
    /// `event_tx` must be the sender half of `event_rx`; the backend usually
    /// holds another clone of it for worker reports.
    pub fn new(
        core: CoreScheduler,
        event_tx: mpsc::UnboundedSender<EngineEvent>,
        event_rx: mpsc::UnboundedReceiver<EngineEvent>,
        backend: B,
    ) -> (Self, SchedulerHandle) {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let handle = SchedulerHandle::new(event_tx.clone(), events.clone());
        let runtime = Self {
            core,
            event_rx,
            self_tx: event_tx,
            backend,
            events,
            wake_at: None,
        };
        (runtime, handle)
    }

    /// Main event loop.
    ///
    /// - Reconciles persisted sessions left over from a previous process.
    /// - Consumes `EngineEvent`s and feeds them into the core.
    /// - Executes commands returned by the core (dispatch, publish, stop).
    /// - On `Shutdown`, drains in-flight workers and returns what is left.
    pub async fn run(mut self) -> Result<ShutdownReport> {
        info!(
            max_concurrent = self.core.permits.capacity(),
            "multirec scheduler started"
        );

        let step = self.core.reconcile(Utc::now())?;
        self.execute(step.commands).await;

        let options = self.core.options;
        let mut recheck = tokio::time::interval(options.disk_recheck_interval);
        recheck.set_missed_tick_behavior(MissedTickBehavior::Skip);
        recheck.tick().await;

        loop {
            if options.exit_when_idle && self.event_rx.is_empty() && self.core.is_idle() {
                info!("nothing queued or in flight; exiting");
                break;
            }

            let wake = self.wake_at;
            let event = tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(event) => event,
                    None => {
                        info!("scheduler event channel closed; exiting");
                        break;
                    }
                },
                _ = recheck.tick() => EngineEvent::Tick,
                _ = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    self.wake_at = None;
                    EngineEvent::Tick
                }
            };

            match event {
                EngineEvent::ListSessions { reply } => {
                    let _ = reply.send(self.core.sessions());
                }
                EngineEvent::Shutdown { drain, reply } => {
                    return Ok(self.drain_and_stop(drain, vec![reply]).await);
                }
                event => {
                    let step = self.core.step(event, Utc::now());
                    self.execute(step.commands).await;
                    if !step.keep_running {
                        info!("core requested exit; stopping runtime");
                        break;
                    }
                }
            }
        }

        Ok(self.drain_and_stop(Duration::ZERO, Vec::new()).await)
    }

    /// Stop admitting, ask workers to stop, wait up to `drain` for their
    /// reports, then force-terminate the rest.
    async fn drain_and_stop(
        &mut self,
        drain: Duration,
        mut replies: Vec<oneshot::Sender<ShutdownReport>>,
    ) -> ShutdownReport {
        let step = self.core.begin_shutdown(Utc::now());
        self.execute(step.commands).await;

        let deadline = Instant::now() + drain;
        while self.core.slots_in_use() > 0 {
            let event = tokio::select! {
                event = self.event_rx.recv() => event,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        remaining = self.core.slots_in_use(),
                        "drain timeout elapsed"
                    );
                    break;
                }
            };

            match event {
                None => break,
                Some(EngineEvent::Shutdown { reply, .. }) => replies.push(reply),
                Some(EngineEvent::ListSessions { reply }) => {
                    let _ = reply.send(self.core.sessions());
                }
                Some(event) => {
                    let step = self.core.step(event, Utc::now());
                    self.execute(step.commands).await;
                }
            }
        }

        self.backend.abort_all().await;
        let report = self.core.finish_shutdown();
        for reply in replies {
            let _ = reply.send(report.clone());
        }
        info!(
            left_non_terminal = report.non_terminal.len(),
            "runtime exiting"
        );
        report
    }

    /// Execute commands from the core, in order.
    async fn execute(&mut self, commands: Vec<CoreCommand>) {
        for command in commands {
            match command {
                CoreCommand::Publish(change) => {
                    debug!(
                        session = %change.session_id,
                        old = ?change.old_status,
                        new = %change.new_status,
                        "publishing state change"
                    );
                    // No subscribers is fine.
                    let _ = self.events.send(change);
                }
                CoreCommand::Dispatch(assignment) => {
                    let session_id = assignment.session.id.clone();
                    let phase = assignment.phase;
                    debug!(session = %session_id, ?phase, "dispatching worker");
                    if let Err(err) = self.backend.dispatch(assignment).await {
                        error!(session = %session_id, ?phase, error = %err, "failed to start worker");
                        let report = WorkerReport {
                            session_id,
                            phase,
                            outcome: WorkerOutcome::failed(ErrorKind::Internal, err.to_string()),
                        };
                        let _ = self.self_tx.send(EngineEvent::Worker(report));
                    }
                }
                CoreCommand::StopWorker(id) => self.backend.stop(&id),
                CoreCommand::WakeAt(at) => {
                    // The core only asks for its earliest pending wake, so re-arm.
                    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    self.wake_at = Some(Instant::now() + delay);
                }
                CoreCommand::RequestExit => {
                    info!("core issued RequestExit command");
                }
            }
        }
    }
}
