// src/store/memory.rs

//! In-memory [`SessionStore`] used by tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::{MultirecError, Result};
use crate::session::{Session, SessionId};
use crate::store::SessionStore;

/// Cloning shares the underlying map, so a test can keep one handle while the
/// scheduler owns another.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    records: Arc<Mutex<BTreeMap<SessionId, Session>>>,
    fail_saves: Arc<AtomicBool>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `save` fail until switched back.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Seed a record without going through the scheduler.
    pub fn insert(&self, session: Session) {
        self.lock().insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.lock().get(id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SessionId, Session>> {
        // A poisoned map still holds consistent records: every write is a
        // single insert.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sorted(&self, filter: impl Fn(&Session) -> bool) -> Vec<Session> {
        let mut out: Vec<Session> = self.lock().values().filter(|s| filter(s)).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: &Session) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(MultirecError::Other(anyhow::anyhow!(
                "simulated write failure for {}",
                session.id
            )));
        }
        self.insert(session.clone());
        Ok(())
    }

    fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        Ok(self.get(id))
    }

    fn list_non_terminal(&self) -> Result<Vec<Session>> {
        Ok(self.sorted(|s| !s.is_terminal()))
    }

    fn list_all(&self) -> Result<Vec<Session>> {
        Ok(self.sorted(|_| true))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::session::SessionStatus;

    #[test]
    fn clones_share_records_and_failures_are_injectable() {
        let store = MemorySessionStore::new();
        let view = store.clone();
        let mut s = Session::new("rec-a".into(), "https://x.test/a".into(), 2, Utc::now());

        store.save(&s).unwrap();
        assert_eq!(view.list_non_terminal().unwrap().len(), 1);

        s.status = SessionStatus::Completed;
        store.save(&s).unwrap();
        assert!(view.list_non_terminal().unwrap().is_empty());
        assert_eq!(view.list_all().unwrap().len(), 1);

        view.set_fail_saves(true);
        assert!(store.save(&s).is_err());
    }
}
