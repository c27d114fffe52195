// src/engine/handle.rs

//! Control surface of a running scheduler.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::warn;

use crate::errors::{MultirecError, Result};
use crate::session::{validate_source, Session, SessionId};

use super::{EngineEvent, ShutdownReport, StateChange};

/// Cheap, cloneable handle to a running [`super::Runtime`].
///
/// `submit`, `cancel` and `resume_admission` never block: they validate,
/// enqueue an event and return. Once the runtime has stopped every call
/// fails with [`MultirecError::SchedulerClosed`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
    events: broadcast::Sender<StateChange>,
}

impl SchedulerHandle {
    pub(super) fn new(
        tx: mpsc::UnboundedSender<EngineEvent>,
        events: broadcast::Sender<StateChange>,
    ) -> Self {
        Self { tx, events }
    }

    /// Queue a new recording and return its id.
    pub fn submit(&self, source: &str, max_attempts: Option<u32>) -> Result<SessionId> {
        validate_source(source)?;
        let id = SessionId::generate();
        self.send(EngineEvent::Submit {
            id: id.clone(),
            source: source.to_string(),
            max_attempts,
        })?;
        Ok(id)
    }

    /// Request cancellation. Idempotent; a terminal session is left alone.
    pub fn cancel(&self, id: &SessionId) -> Result<()> {
        self.send(EngineEvent::Cancel { id: id.clone() })
    }

    /// Clear an admission pause caused by repeated internal faults.
    pub fn resume_admission(&self) -> Result<()> {
        self.send(EngineEvent::ResumeAdmission)
    }

    /// Snapshot of every known session, oldest first.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineEvent::ListSessions { reply })?;
        rx.await.map_err(|_| MultirecError::SchedulerClosed)
    }

    /// Stop admitting, give in-flight workers up to `drain` to stop, then
    /// force-terminate them. Returns the sessions left non-terminal.
    pub async fn shutdown(&self, drain: Duration) -> Result<ShutdownReport> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineEvent::Shutdown { drain, reply })?;
        rx.await.map_err(|_| MultirecError::SchedulerClosed)
    }

    /// Stream of state changes from now on. Subscribing again restarts the
    /// stream; nothing is replayed.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.events.subscribe(),
        }
    }

    fn send(&self, event: EngineEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| MultirecError::SchedulerClosed)
    }
}

/// Receiving end of [`SchedulerHandle::subscribe`].
#[derive(Debug)]
pub struct EventSubscription {
    rx: broadcast::Receiver<StateChange>,
}

impl EventSubscription {
    /// Next state change, or `None` once the runtime and every handle are
    /// gone.
    ///
    /// A subscriber that falls behind skips the missed changes.
    pub async fn next(&mut self) -> Option<StateChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "state change subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
