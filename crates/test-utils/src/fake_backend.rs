use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use multirec::engine::{Assignment, EngineEvent, Phase, WorkerOutcome, WorkerReport};
use multirec::errors::Result;
use multirec::exec::WorkerBackend;
use multirec::session::SessionId;

#[derive(Debug, Default)]
struct FakeState {
    dispatched: Vec<(SessionId, Phase)>,
    running: BTreeMap<SessionId, Phase>,
    stopped: Vec<SessionId>,
    aborted: Vec<SessionId>,
    peak_running: usize,
    auto_complete: bool,
    stop_confirms: bool,
}

/// A fake worker backend that:
/// - records which assignments were dispatched and which stops were asked
/// - leaves every worker "running" until the test calls [`FakeWorkers::complete`]
/// - optionally completes each phase successfully on its own
/// - confirms stop requests with a `Cancelled` report unless told not to
#[derive(Debug)]
pub struct FakeBackend {
    runtime_tx: mpsc::UnboundedSender<EngineEvent>,
    state: Arc<Mutex<FakeState>>,
}

/// Test-side handle onto a [`FakeBackend`].
#[derive(Debug, Clone)]
pub struct FakeWorkers {
    runtime_tx: mpsc::UnboundedSender<EngineEvent>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new(runtime_tx: mpsc::UnboundedSender<EngineEvent>) -> (Self, FakeWorkers) {
        let state = Arc::new(Mutex::new(FakeState {
            stop_confirms: true,
            ..FakeState::default()
        }));
        let backend = Self {
            runtime_tx: runtime_tx.clone(),
            state: Arc::clone(&state),
        };
        (backend, FakeWorkers { runtime_tx, state })
    }
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn success(id: &SessionId, phase: Phase) -> WorkerOutcome {
    match phase {
        Phase::Capture => WorkerOutcome::Captured {
            fragments: vec![PathBuf::from(format!("/work/{id}/capture/fragment-00001.ts"))],
        },
        Phase::Remux => WorkerOutcome::Remuxed {
            output: PathBuf::from(format!("/out/{id}.mp4")),
            content_hash: "0".repeat(64),
        },
    }
}

impl WorkerBackend for FakeBackend {
    fn dispatch(
        &mut self,
        assignment: Assignment,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let id = assignment.session.id.clone();
            let phase = assignment.phase;
            let auto = {
                let mut state = lock(&self.state);
                state.dispatched.push((id.clone(), phase));
                state.running.insert(id.clone(), phase);
                state.peak_running = state.peak_running.max(state.running.len());
                state.auto_complete
            };
            if auto {
                lock(&self.state).running.remove(&id);
                let outcome = success(&id, phase);
                let _ = self.runtime_tx.send(EngineEvent::Worker(WorkerReport {
                    session_id: id,
                    phase,
                    outcome,
                }));
            }
            Ok(())
        })
    }

    fn stop(&mut self, id: &SessionId) {
        let confirmed = {
            let mut state = lock(&self.state);
            state.stopped.push(id.clone());
            if state.stop_confirms {
                state.running.remove(id)
            } else {
                None
            }
        };
        if let Some(phase) = confirmed {
            let _ = self.runtime_tx.send(EngineEvent::Worker(WorkerReport {
                session_id: id.clone(),
                phase,
                outcome: WorkerOutcome::Cancelled,
            }));
        }
    }

    fn abort_all(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            let ids: Vec<SessionId> = std::mem::take(&mut state.running).into_keys().collect();
            state.aborted.extend(ids);
        })
    }
}

impl FakeWorkers {
    /// Complete every dispatched phase successfully, immediately.
    pub fn set_auto_complete(&self, on: bool) {
        lock(&self.state).auto_complete = on;
    }

    /// When false, stop requests are recorded but never confirmed, which
    /// models a worker that ignores the stop until it is aborted.
    pub fn set_stop_confirms(&self, on: bool) {
        lock(&self.state).stop_confirms = on;
    }

    pub fn dispatched(&self) -> Vec<(SessionId, Phase)> {
        lock(&self.state).dispatched.clone()
    }

    pub fn running(&self) -> Vec<SessionId> {
        lock(&self.state).running.keys().cloned().collect()
    }

    pub fn is_running(&self, id: &SessionId) -> bool {
        lock(&self.state).running.contains_key(id)
    }

    pub fn stopped(&self) -> Vec<SessionId> {
        lock(&self.state).stopped.clone()
    }

    pub fn aborted(&self) -> Vec<SessionId> {
        lock(&self.state).aborted.clone()
    }

    /// Most workers that were ever running at once.
    pub fn peak_running(&self) -> usize {
        lock(&self.state).peak_running
    }

    /// Finish the running worker for `id` with `outcome`.
    ///
    /// Panics if no worker is running for `id`.
    pub fn complete(&self, id: &SessionId, outcome: WorkerOutcome) {
        let phase = lock(&self.state)
            .running
            .remove(id)
            .unwrap_or_else(|| panic!("no running worker for {id}"));
        self.runtime_tx
            .send(EngineEvent::Worker(WorkerReport {
                session_id: id.clone(),
                phase,
                outcome,
            }))
            .expect("runtime gone");
    }

    /// Finish the running worker for `id` with the phase's success outcome.
    pub fn succeed(&self, id: &SessionId) {
        let phase = lock(&self.state)
            .running
            .get(id)
            .copied()
            .unwrap_or_else(|| panic!("no running worker for {id}"));
        self.complete(id, success(id, phase));
    }

    /// Phase currently running for `id`.
    pub fn phase_of(&self, id: &SessionId) -> Option<Phase> {
        lock(&self.state).running.get(id).copied()
    }
}
