// src/engine/core.rs

//! Pure core scheduler.
//!
//! This module contains a synchronous, deterministic "core scheduler" that
//! consumes [`EngineEvent`]s and produces:
//! - an updated registry (persisted through the [`SessionStore`])
//! - a list of "commands" describing what the IO shell should do next
//!
//! The async/IO-heavy shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels
//! - handing assignments to the worker backend
//! - publishing state changes to subscribers
//! - timers and shutdown draining
//!
//! The core takes `now` as an argument everywhere, so it can be unit tested
//! without Tokio, channels, processes or a wall clock.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::engine::admission::{AdmissionQueue, PermitPool};
use crate::engine::event_handlers::{CoreCommand, CoreStep};
use crate::engine::{Assignment, EngineEvent, Phase, RuntimeOptions, ShutdownReport, StateChange};
use crate::errors::{MultirecError, Result};
use crate::fs::DiskSpaceGuard;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::session::machine::{self, SessionEvent, Transition};
use crate::session::{Session, SessionId, SessionStatus};
use crate::store::SessionStore;
use crate::types::ErrorKind;
use crate::worker::Container;

/// Scheduler-level settings; a projection of the loaded configuration.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    pub max_attempts_default: u32,
    pub min_free_bytes: u64,
    /// Consecutive internal faults that pause admission; 0 disables.
    pub internal_fault_threshold: u32,
    pub output_directory: PathBuf,
    pub container: Container,
}

/// Pure core scheduler state.
///
/// This owns:
/// - the session registry (the single owner of live session records)
/// - the admission queue and the permit pool
/// - the session store, the disk-space guard and the retry policy
///
/// It has **no** channels, no Tokio types, and does no IO except through the
/// store and the guard.
#[derive(Debug)]
pub struct CoreScheduler {
    pub(super) settings: SchedulerSettings,
    pub(super) options: RuntimeOptions,
    pub(super) registry: HashMap<SessionId, Session>,
    pub(super) queue: AdmissionQueue,
    pub(super) permits: PermitPool,
    pub(super) store: Box<dyn SessionStore>,
    pub(super) guard: DiskSpaceGuard,
    pub(super) retry: RetryPolicy,
    /// False once shutdown begins.
    pub(super) accepting: bool,
    pub(super) draining: bool,
    /// Set when internal faults reach the threshold; cleared by
    /// `ResumeAdmission`.
    pub(super) fault_paused: bool,
    pub(super) consecutive_internal: u32,
    pub(super) disk_blocked: bool,
    pub(super) next_wake: Option<DateTime<Utc>>,
}

impl CoreScheduler {
    pub fn new(
        settings: SchedulerSettings,
        options: RuntimeOptions,
        store: Box<dyn SessionStore>,
        guard: DiskSpaceGuard,
        retry: RetryPolicy,
    ) -> Self {
        let permits = PermitPool::new(settings.max_concurrent);
        Self {
            settings,
            options,
            registry: HashMap::new(),
            queue: AdmissionQueue::new(),
            permits,
            store,
            guard,
            retry,
            accepting: true,
            draining: false,
            fault_paused: false,
            consecutive_internal: 0,
            disk_blocked: false,
            next_wake: None,
        }
    }

    /// No session is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.permits.in_use() == 0 && self.registry.values().all(Session::is_terminal)
    }

    pub fn slots_in_use(&self) -> usize {
        self.permits.in_use()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_admission_paused(&self) -> bool {
        self.fault_paused
    }

    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.registry.get(id)
    }

    /// Every known session, oldest first.
    pub fn sessions(&self) -> Vec<Session> {
        let mut out: Vec<Session> = self.registry.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Load persisted non-terminal sessions and repair the ones a previous
    /// process left in flight.
    ///
    /// Queued sessions are re-queued as they are. Capturing/Remuxing sessions
    /// become Cancelled if a cancel was pending, otherwise they go through the
    /// `Interrupted` edge. A store failure here is fatal.
    pub fn reconcile(&mut self, now: DateTime<Utc>) -> Result<CoreStep> {
        let mut commands = Vec::new();
        let sessions = self.store.list_non_terminal()?;
        info!(count = sessions.len(), "reconciling persisted sessions");

        for session in sessions {
            let id = session.id.clone();
            let status = session.status;
            self.registry.insert(id.clone(), session);

            match status {
                SessionStatus::Queued => {
                    if let Some(s) = self.registry.get(&id) {
                        self.queue.push(s);
                    }
                }
                SessionStatus::Capturing | SessionStatus::Remuxing => {
                    let event = if self.registry.get(&id).is_some_and(|s| s.cancel_requested) {
                        SessionEvent::Cancel
                    } else {
                        SessionEvent::Interrupted
                    };
                    let transition = self.commit(&id, event, now, &mut commands)?;
                    warn!(
                        session = %id,
                        from = %transition.from,
                        to = %transition.to,
                        "recovered session interrupted by previous shutdown"
                    );
                    if transition.to == SessionStatus::Queued {
                        self.requeue(&id);
                    }
                }
                terminal => {
                    debug!(session = %id, status = %terminal, "store listed a terminal session as open");
                }
            }
        }

        self.run_admission(now, &mut commands);
        Ok(CoreStep::with_commands(commands))
    }

    /// Handle a single engine event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: EngineEvent, now: DateTime<Utc>) -> CoreStep {
        let mut commands = Vec::new();

        match event {
            EngineEvent::Submit {
                id,
                source,
                max_attempts,
            } => self.handle_submit(id, source, max_attempts, now, &mut commands),
            EngineEvent::Cancel { id } => self.handle_cancel(&id, now, &mut commands),
            EngineEvent::Worker(report) => self.handle_worker_report(report, now, &mut commands),
            EngineEvent::Tick => {
                // Re-armed below if a backoff is still pending.
                self.next_wake = None;
            }
            EngineEvent::ResumeAdmission => {
                if self.fault_paused {
                    info!("admission resumed");
                }
                self.fault_paused = false;
                self.consecutive_internal = 0;
            }
            EngineEvent::ListSessions { .. } | EngineEvent::Shutdown { .. } => {
                debug!("control request reached the core; handled by the runtime shell");
            }
        }

        self.run_admission(now, &mut commands);

        // In `--once` mode, exit once nothing is queued or in flight.
        let mut keep_running = true;
        if self.options.exit_when_idle && self.is_idle() && !self.draining {
            keep_running = false;
            commands.push(CoreCommand::RequestExit);
        }

        CoreStep {
            commands,
            keep_running,
        }
    }

    /// Apply `event` to a copy of the session, save it, then swap it into the
    /// registry and publish. Nothing changes if either step fails.
    pub(super) fn commit(
        &mut self,
        id: &SessionId,
        event: SessionEvent,
        now: DateTime<Utc>,
        commands: &mut Vec<CoreCommand>,
    ) -> Result<Transition> {
        let current = self
            .registry
            .get(id)
            .ok_or_else(|| MultirecError::SessionNotFound(id.to_string()))?;
        let mut next = current.clone();
        let transition = machine::apply(&mut next, event, now)?;

        self.store.save(&next)?;

        info!(
            session = %id,
            from = %transition.from,
            to = %transition.to,
            attempt = next.attempt,
            "session transition"
        );
        self.registry.insert(id.clone(), next);
        commands.push(CoreCommand::Publish(StateChange {
            session_id: id.clone(),
            old_status: Some(transition.from),
            new_status: transition.to,
            timestamp: now,
        }));
        Ok(transition)
    }

    /// Persist a field change that is not a status transition.
    pub(super) fn save_fields(&mut self, id: &SessionId, update: impl FnOnce(&mut Session)) -> Result<()> {
        let current = self
            .registry
            .get(id)
            .ok_or_else(|| MultirecError::SessionNotFound(id.to_string()))?;
        let mut next = current.clone();
        update(&mut next);
        let saved = self.store.save(&next);
        // Memory follows intent even when the write fails; the caller decides
        // what a failed write means.
        self.registry.insert(id.clone(), next);
        saved
    }

    pub(super) fn requeue(&mut self, id: &SessionId) {
        if let Some(session) = self.registry.get(id) {
            self.queue.push(session);
        }
    }

    /// Force an in-flight session to Failed(Internal) after its real
    /// transition could not be committed. Publishes only if the record
    /// reaches the store.
    pub(super) fn fail_internal(
        &mut self,
        id: &SessionId,
        detail: String,
        now: DateTime<Utc>,
        commands: &mut Vec<CoreCommand>,
    ) {
        error!(session = %id, detail = %detail, "internal fault; failing session");
        if let Some(current) = self.registry.get(id) {
            let mut next = current.clone();
            let event = SessionEvent::Failed {
                kind: ErrorKind::Internal,
                detail,
                decision: RetryDecision::Exhausted,
            };
            match machine::apply(&mut next, event, now) {
                Ok(transition) => {
                    let saved = self.store.save(&next);
                    self.registry.insert(id.clone(), next);
                    match saved {
                        Ok(()) => commands.push(CoreCommand::Publish(StateChange {
                            session_id: id.clone(),
                            old_status: Some(transition.from),
                            new_status: transition.to,
                            timestamp: now,
                        })),
                        Err(err) => {
                            error!(session = %id, error = %err, "could not persist internal failure");
                        }
                    }
                }
                Err(err) => error!(session = %id, error = %err, "cannot fail session"),
            }
        }
        self.permits.release(id);
        self.note_internal_fault();
    }

    pub(super) fn note_internal_fault(&mut self) {
        self.consecutive_internal = self.consecutive_internal.saturating_add(1);
        let threshold = self.settings.internal_fault_threshold;
        if threshold > 0 && self.consecutive_internal >= threshold && !self.fault_paused {
            self.fault_paused = true;
            error!(
                faults = self.consecutive_internal,
                "admission paused after repeated internal faults; send ResumeAdmission to continue"
            );
        }
    }

    /// `<output_directory>/<started %Y%m%dT%H%M%S>_<short id>.<ext>`
    pub(super) fn plan_output_path(&self, session: &Session, now: DateTime<Utc>) -> PathBuf {
        let started = session.started_at.unwrap_or(now);
        self.settings.output_directory.join(format!(
            "{}_{}.{}",
            started.format("%Y%m%dT%H%M%S"),
            session.id.short(),
            self.settings.container.extension()
        ))
    }

    /// Admit queued sessions while permits and disk headroom allow.
    ///
    /// This is the single admission arbiter; it runs at the end of every
    /// step, so a freed slot or a returned headroom is picked up right away.
    pub(super) fn run_admission(&mut self, now: DateTime<Utc>, commands: &mut Vec<CoreCommand>) {
        if !self.accepting || self.fault_paused {
            return;
        }

        while self.permits.available() > 0 {
            let Some(id) = self.queue.next_admissible(&self.registry, now) else {
                break;
            };

            if !self.guard.has_headroom(self.settings.min_free_bytes) {
                if !self.disk_blocked {
                    warn!(
                        min_free_bytes = self.settings.min_free_bytes,
                        queued = self.queue.len(),
                        "insufficient disk headroom; admission paused"
                    );
                    self.disk_blocked = true;
                }
                break;
            }
            if self.disk_blocked {
                info!("disk headroom restored; admission resumed");
                self.disk_blocked = false;
            }

            match self.commit(&id, SessionEvent::Admitted, now, commands) {
                Ok(_) => {
                    if let Some(session) = self.registry.get(&id) {
                        self.queue.remove(session);
                        self.permits.try_acquire(&id);
                        commands.push(CoreCommand::Dispatch(Assignment {
                            session: session.clone(),
                            phase: Phase::Capture,
                        }));
                    }
                }
                Err(err) => {
                    error!(session = %id, error = %err, "could not admit session; it stays queued");
                    self.note_internal_fault();
                    break;
                }
            }
        }

        if let Some(at) = self.queue.next_retry_at(&self.registry, now) {
            if self.next_wake.is_none_or(|current| at < current) {
                self.next_wake = Some(at);
                commands.push(CoreCommand::WakeAt(at));
            }
        }
    }

    /// Stop admitting and ask every in-flight worker to stop.
    pub fn begin_shutdown(&mut self, now: DateTime<Utc>) -> CoreStep {
        info!(
            in_flight = self.permits.in_use(),
            queued = self.queue.len(),
            at = %now,
            "shutdown requested; draining"
        );
        self.accepting = false;
        self.draining = true;
        let commands = self
            .permits
            .holders()
            .cloned()
            .map(CoreCommand::StopWorker)
            .collect();
        CoreStep {
            commands,
            keep_running: true,
        }
    }

    /// Forget workers that were force-terminated and report what is left.
    pub fn finish_shutdown(&mut self) -> ShutdownReport {
        for id in self.permits.release_all() {
            warn!(session = %id, "worker force-terminated; session left for reconciliation");
        }
        let non_terminal: Vec<Session> = self
            .sessions()
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect();
        info!(non_terminal = non_terminal.len(), "scheduler stopped");
        ShutdownReport { non_terminal }
    }
}
