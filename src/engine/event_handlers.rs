// src/engine/event_handlers.rs

//! Event handling logic for the core scheduler.
//!
//! Each handler takes `now` and appends the commands the IO shell should run.
//! Handlers never fail: faults are logged, counted and turned into session
//! state, so one bad record cannot stop the arbiter.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::engine::core::CoreScheduler;
use crate::engine::{Assignment, Phase, StateChange, WorkerOutcome, WorkerReport};
use crate::session::{Session, SessionEvent, SessionId, SessionStatus};
use crate::types::{ErrorClass, ErrorKind};

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreCommand {
    /// Tell subscribers about a committed transition.
    Publish(StateChange),
    /// Start a worker for this assignment.
    Dispatch(Assignment),
    /// Graceful-then-forced stop of the worker holding this session.
    StopWorker(SessionId),
    /// Deliver a `Tick` at this time (earliest backoff expiry).
    WakeAt(DateTime<Utc>),
    /// Request that the runtime exits (used for `--once` when idle).
    RequestExit,
}

/// Decision returned by the core after handling a single event.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    pub fn with_commands(commands: Vec<CoreCommand>) -> Self {
        Self {
            commands,
            keep_running: true,
        }
    }
}

impl CoreScheduler {
    pub(super) fn handle_submit(
        &mut self,
        id: SessionId,
        source: String,
        max_attempts: Option<u32>,
        now: DateTime<Utc>,
        commands: &mut Vec<CoreCommand>,
    ) {
        if !self.accepting {
            warn!(session = %id, "scheduler is shutting down; submission dropped");
            return;
        }
        if self.registry.contains_key(&id) {
            warn!(session = %id, "duplicate submission ignored");
            return;
        }

        let max_attempts = max_attempts.unwrap_or(self.settings.max_attempts_default);
        let session = Session::new(id.clone(), source, max_attempts, now);

        if let Err(err) = self.store.save(&session) {
            error!(session = %id, error = %err, "could not persist new session; dropping it");
            self.note_internal_fault();
            return;
        }

        info!(
            session = %id,
            source = %session.source,
            max_attempts = session.max_attempts,
            "session submitted"
        );
        self.queue.push(&session);
        self.registry.insert(id.clone(), session);
        commands.push(CoreCommand::Publish(StateChange {
            session_id: id,
            old_status: None,
            new_status: SessionStatus::Queued,
            timestamp: now,
        }));
    }

    pub(super) fn handle_cancel(
        &mut self,
        id: &SessionId,
        now: DateTime<Utc>,
        commands: &mut Vec<CoreCommand>,
    ) {
        let Some(session) = self.registry.get(id) else {
            warn!(session = %id, "cancel for unknown session");
            return;
        };

        match session.status {
            status if status.is_terminal() => {
                debug!(session = %id, %status, "cancel on terminal session ignored");
            }
            SessionStatus::Queued => {
                let queued = session.clone();
                match self.commit(id, SessionEvent::Cancel, now, commands) {
                    Ok(_) => {
                        self.queue.remove(&queued);
                    }
                    Err(err) => {
                        error!(session = %id, error = %err, "could not cancel queued session");
                        self.note_internal_fault();
                    }
                }
            }
            _ => {
                if session.cancel_requested {
                    debug!(session = %id, "cancel already requested");
                    return;
                }
                if let Err(err) = self.save_fields(id, |s| s.cancel_requested = true) {
                    error!(session = %id, error = %err, "could not persist cancel request");
                }
                info!(session = %id, "cancel requested; stopping worker");
                commands.push(CoreCommand::StopWorker(id.clone()));
            }
        }
    }

    pub(super) fn handle_worker_report(
        &mut self,
        report: WorkerReport,
        now: DateTime<Utc>,
        commands: &mut Vec<CoreCommand>,
    ) {
        let WorkerReport {
            session_id: id,
            phase,
            outcome,
        } = report;

        let Some(session) = self.registry.get(&id) else {
            warn!(session = %id, ?phase, "report for unknown session ignored");
            return;
        };
        if session.status != phase.status() || !self.permits.holds(&id) {
            warn!(
                session = %id,
                ?phase,
                status = %session.status,
                "stale worker report ignored"
            );
            return;
        }
        let cancel_requested = session.cancel_requested;

        if self.draining {
            match outcome {
                WorkerOutcome::Captured { fragments } => {
                    // Keep the fragments so the next start can go straight
                    // to remux; the status is repaired by reconciliation.
                    if let Err(err) = self.save_fields(&id, |s| s.fragments = fragments) {
                        error!(session = %id, error = %err, "could not persist fragments at shutdown");
                    }
                    self.permits.release(&id);
                    return;
                }
                WorkerOutcome::Cancelled if !cancel_requested => {
                    debug!(session = %id, "worker stopped for shutdown");
                    self.permits.release(&id);
                    return;
                }
                _ => {}
            }
        }

        // A finished, verified output wins over a cancel that arrived late.
        if cancel_requested && !matches!(outcome, WorkerOutcome::Remuxed { .. }) {
            match self.commit(&id, SessionEvent::Cancel, now, commands) {
                Ok(_) => {
                    self.permits.release(&id);
                }
                Err(err) => self.fail_internal(&id, format!("cancel not committed: {err}"), now, commands),
            }
            return;
        }

        match (phase, outcome) {
            (Phase::Capture, WorkerOutcome::Captured { fragments }) => {
                let output_path = self.plan_output_path(session, now);
                info!(
                    session = %id,
                    fragments = fragments.len(),
                    output = %output_path.display(),
                    "capture finished"
                );
                let event = SessionEvent::CaptureSucceeded {
                    output_path,
                    fragments,
                };
                match self.commit(&id, event, now, commands) {
                    Ok(_) => {
                        self.consecutive_internal = 0;
                        if let Some(session) = self.registry.get(&id) {
                            // The slot carries over from capture to remux.
                            commands.push(CoreCommand::Dispatch(Assignment {
                                session: session.clone(),
                                phase: Phase::Remux,
                            }));
                        }
                    }
                    Err(err) => self.fail_internal(&id, format!("capture result not committed: {err}"), now, commands),
                }
            }
            (Phase::Remux, WorkerOutcome::Remuxed {
                output,
                content_hash,
            }) => {
                info!(
                    session = %id,
                    output = %output.display(),
                    digest = %content_hash,
                    "recording complete"
                );
                match self.commit(&id, SessionEvent::RemuxSucceeded, now, commands) {
                    Ok(_) => {
                        self.permits.release(&id);
                        self.consecutive_internal = 0;
                    }
                    Err(err) => self.fail_internal(&id, format!("completion not committed: {err}"), now, commands),
                }
            }
            (_, WorkerOutcome::Failed { kind, detail }) => {
                self.handle_failure(&id, kind, detail, now, commands);
            }
            (_, WorkerOutcome::Cancelled) => {
                warn!(session = %id, ?phase, "worker stopped without a cancel request");
                match self.commit(&id, SessionEvent::Interrupted, now, commands) {
                    Ok(transition) => {
                        self.permits.release(&id);
                        if transition.to == SessionStatus::Queued {
                            self.requeue(&id);
                        }
                    }
                    Err(err) => self.fail_internal(&id, format!("interruption not committed: {err}"), now, commands),
                }
            }
            (phase, outcome) => {
                self.fail_internal(
                    &id,
                    format!("{phase:?} worker reported unexpected outcome {outcome:?}"),
                    now,
                    commands,
                );
            }
        }
    }

    fn handle_failure(
        &mut self,
        id: &SessionId,
        kind: ErrorKind,
        detail: String,
        now: DateTime<Utc>,
        commands: &mut Vec<CoreCommand>,
    ) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        let attempts_made = session.attempt.saturating_add(1);
        let decision = self.retry.decide(kind, attempts_made, session.max_attempts);
        warn!(
            session = %id,
            kind = %kind,
            attempt = attempts_made,
            max_attempts = session.max_attempts,
            retry = decision.is_retry(),
            detail = %detail,
            "attempt failed"
        );

        let event = SessionEvent::Failed {
            kind,
            detail,
            decision,
        };
        match self.commit(id, event, now, commands) {
            Ok(transition) => {
                self.permits.release(id);
                if transition.to == SessionStatus::Queued {
                    self.requeue(id);
                }
                if kind.class() == ErrorClass::Internal {
                    self.note_internal_fault();
                } else {
                    self.consecutive_internal = 0;
                }
            }
            Err(err) => self.fail_internal(id, format!("failure not committed: {err}"), now, commands),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::engine::core::SchedulerSettings;
    use crate::engine::{EngineEvent, RuntimeOptions};
    use crate::fs::{DiskSpaceGuard, MockFileSystem};
    use crate::retry::RetryPolicy;
    use crate::store::MemorySessionStore;
    use crate::worker::Container;

    fn core_with(max_concurrent: usize, store: MemorySessionStore, fs: MockFileSystem) -> CoreScheduler {
        let settings = SchedulerSettings {
            max_concurrent,
            max_attempts_default: 3,
            min_free_bytes: 1024,
            internal_fault_threshold: 2,
            output_directory: PathBuf::from("/out"),
            container: Container::Mp4,
        };
        let options = RuntimeOptions {
            exit_when_idle: false,
            disk_recheck_interval: Duration::from_secs(5),
        };
        let retry = RetryPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(1),
            jitter: 0.0,
        };
        let guard = DiskSpaceGuard::new(Arc::new(fs), "/out");
        CoreScheduler::new(settings, options, Box::new(store), guard, retry)
    }

    fn submit(core: &mut CoreScheduler, id: &str, now: DateTime<Utc>) -> CoreStep {
        core.step(
            EngineEvent::Submit {
                id: id.into(),
                source: format!("https://live.test/{id}"),
                max_attempts: None,
            },
            now,
        )
    }

    fn dispatched(step: &CoreStep) -> Vec<(String, Phase)> {
        step.commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::Dispatch(a) => Some((a.session.id.to_string(), a.phase)),
                _ => None,
            })
            .collect()
    }

    fn report(id: &str, phase: Phase, outcome: WorkerOutcome) -> EngineEvent {
        EngineEvent::Worker(WorkerReport {
            session_id: id.into(),
            phase,
            outcome,
        })
    }

    #[test]
    fn submit_persists_before_publishing_and_admits() {
        let store = MemorySessionStore::new();
        let mut core = core_with(1, store.clone(), MockFileSystem::new());
        let now = Utc::now();

        let step = submit(&mut core, "rec-a", now);

        assert!(store.get(&"rec-a".into()).is_some());
        assert_eq!(dispatched(&step), vec![("rec-a".to_string(), Phase::Capture)]);
        assert!(matches!(
            step.commands.first(),
            Some(CoreCommand::Publish(StateChange { old_status: None, .. }))
        ));
        assert_eq!(core.slots_in_use(), 1);
    }

    #[test]
    fn failed_submit_save_registers_nothing() {
        let store = MemorySessionStore::new();
        store.set_fail_saves(true);
        let mut core = core_with(1, store, MockFileSystem::new());

        let step = submit(&mut core, "rec-a", Utc::now());

        assert!(step.commands.is_empty());
        assert!(core.sessions().is_empty());
    }

    #[test]
    fn capture_success_keeps_the_slot_for_remux() {
        let mut core = core_with(1, MemorySessionStore::new(), MockFileSystem::new());
        let now = Utc::now();
        submit(&mut core, "rec-a", now);
        submit(&mut core, "rec-b", now);

        let step = core.step(
            report(
                "rec-a",
                Phase::Capture,
                WorkerOutcome::Captured {
                    fragments: vec!["/w/f1.ts".into()],
                },
            ),
            now,
        );

        assert_eq!(dispatched(&step), vec![("rec-a".to_string(), Phase::Remux)]);
        let a = core.session(&"rec-a".into()).cloned().unwrap();
        assert_eq!(a.status, SessionStatus::Remuxing);
        let out = a.output_path.unwrap();
        assert!(out.starts_with("/out"));
        assert!(out.to_string_lossy().ends_with("_rec-a.mp4"));
        assert_eq!(core.queued_len(), 1);
    }

    #[test]
    fn transient_failure_requeues_with_backoff_and_wakeup() {
        let mut core = core_with(1, MemorySessionStore::new(), MockFileSystem::new());
        let now = Utc::now();
        submit(&mut core, "rec-a", now);

        let step = core.step(
            report(
                "rec-a",
                Phase::Capture,
                WorkerOutcome::failed(ErrorKind::NetworkTimeout, "timed out"),
            ),
            now,
        );

        let a = core.session(&"rec-a".into()).cloned().unwrap();
        assert_eq!(a.status, SessionStatus::Queued);
        assert_eq!(a.attempt, 1);
        assert_eq!(a.last_backoff_ms, Some(100));
        assert!(dispatched(&step).is_empty());
        assert!(step.commands.iter().any(|c| matches!(c, CoreCommand::WakeAt(_))));

        let later = now + chrono::Duration::milliseconds(150);
        let step = core.step(EngineEvent::Tick, later);
        assert_eq!(dispatched(&step), vec![("rec-a".to_string(), Phase::Capture)]);
    }

    #[test]
    fn permanent_failure_fails_without_consuming_an_attempt() {
        let mut core = core_with(1, MemorySessionStore::new(), MockFileSystem::new());
        let now = Utc::now();
        submit(&mut core, "rec-a", now);

        core.step(
            report(
                "rec-a",
                Phase::Capture,
                WorkerOutcome::failed(ErrorKind::AuthenticationFailed, "401"),
            ),
            now,
        );

        let a = core.session(&"rec-a".into()).cloned().unwrap();
        assert_eq!(a.status, SessionStatus::Failed);
        assert_eq!(a.attempt, 0);
        assert_eq!(a.error_kind, Some(ErrorKind::AuthenticationFailed));
        assert_eq!(core.slots_in_use(), 0);
    }

    #[test]
    fn cancel_queued_is_immediate_and_in_flight_waits_for_worker() {
        let mut core = core_with(1, MemorySessionStore::new(), MockFileSystem::new());
        let now = Utc::now();
        submit(&mut core, "rec-a", now);
        submit(&mut core, "rec-b", now);

        core.step(EngineEvent::Cancel { id: "rec-b".into() }, now);
        assert_eq!(
            core.session(&"rec-b".into()).map(|s| s.status),
            Some(SessionStatus::Cancelled)
        );
        assert_eq!(core.queued_len(), 0);

        let step = core.step(EngineEvent::Cancel { id: "rec-a".into() }, now);
        assert_eq!(step.commands, vec![CoreCommand::StopWorker("rec-a".into())]);
        assert_eq!(
            core.session(&"rec-a".into()).map(|s| s.status),
            Some(SessionStatus::Capturing)
        );

        core.step(report("rec-a", Phase::Capture, WorkerOutcome::Cancelled), now);
        assert_eq!(
            core.session(&"rec-a".into()).map(|s| s.status),
            Some(SessionStatus::Cancelled)
        );
        assert_eq!(core.slots_in_use(), 0);

        // Terminal sessions ignore further cancels.
        let step = core.step(EngineEvent::Cancel { id: "rec-a".into() }, now);
        assert!(step.commands.is_empty());
    }

    #[test]
    fn no_admission_without_headroom() {
        let fs = MockFileSystem::new();
        fs.set_free_space(10);
        let mut core = core_with(2, MemorySessionStore::new(), fs.clone());
        let now = Utc::now();

        let step = submit(&mut core, "rec-a", now);
        assert!(dispatched(&step).is_empty());

        fs.set_free_space(1 << 30);
        let step = core.step(EngineEvent::Tick, now);
        assert_eq!(dispatched(&step), vec![("rec-a".to_string(), Phase::Capture)]);
    }

    #[test]
    fn repeated_internal_faults_pause_admission_until_resumed() {
        let mut core = core_with(1, MemorySessionStore::new(), MockFileSystem::new());
        let now = Utc::now();
        for id in ["rec-a", "rec-b", "rec-c"] {
            submit(&mut core, id, now);
        }

        core.step(
            report("rec-a", Phase::Capture, WorkerOutcome::failed(ErrorKind::Internal, "spawn")),
            now,
        );
        let step = core.step(
            report("rec-b", Phase::Capture, WorkerOutcome::failed(ErrorKind::Internal, "spawn")),
            now,
        );
        assert!(core.is_admission_paused());
        assert!(dispatched(&step).is_empty());

        let step = core.step(EngineEvent::ResumeAdmission, now);
        assert_eq!(dispatched(&step), vec![("rec-c".to_string(), Phase::Capture)]);
    }

    #[test]
    fn stale_reports_are_ignored() {
        let mut core = core_with(1, MemorySessionStore::new(), MockFileSystem::new());
        let now = Utc::now();
        submit(&mut core, "rec-a", now);

        let step = core.step(
            report("rec-a", Phase::Remux, WorkerOutcome::failed(ErrorKind::RemuxFailed, "x")),
            now,
        );
        assert!(step.commands.is_empty());
        assert_eq!(
            core.session(&"rec-a".into()).map(|s| s.status),
            Some(SessionStatus::Capturing)
        );
    }
}
