// src/engine/admission.rs

//! Admission queue and concurrency permits.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::session::{Session, SessionId};

/// Queued sessions in FIFO order: submission time, then session id.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    entries: BTreeSet<(DateTime<Utc>, SessionId)>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, session: &Session) {
        self.entries
            .insert((session.created_at, session.id.clone()));
    }

    pub fn remove(&mut self, session: &Session) -> bool {
        self.entries
            .remove(&(session.created_at, session.id.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids in admission order.
    pub fn ids(&self) -> impl Iterator<Item = &SessionId> {
        self.entries.iter().map(|(_, id)| id)
    }

    /// Oldest session that is past its backoff delay.
    ///
    /// A session still waiting out a backoff does not hold up younger ones.
    pub fn next_admissible(
        &self,
        registry: &HashMap<SessionId, Session>,
        now: DateTime<Utc>,
    ) -> Option<SessionId> {
        self.ids()
            .find(|id| registry.get(*id).is_some_and(|s| s.is_admissible(now)))
            .cloned()
    }

    /// Earliest future `retry_at` among queued sessions.
    pub fn next_retry_at(
        &self,
        registry: &HashMap<SessionId, Session>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.ids()
            .filter_map(|id| registry.get(id).and_then(|s| s.retry_at))
            .filter(|at| *at > now)
            .min()
    }
}

/// Counting permit pool of fixed size.
///
/// Permits are tracked per holder so a release can never free a slot that
/// was not taken.
#[derive(Debug)]
pub struct PermitPool {
    capacity: usize,
    holders: BTreeSet<SessionId>,
}

impl PermitPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            holders: BTreeSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.holders.len()
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.holders.len())
    }

    pub fn holds(&self, id: &SessionId) -> bool {
        self.holders.contains(id)
    }

    /// Take a permit for `id`; false when none is free or `id` already has one.
    pub fn try_acquire(&mut self, id: &SessionId) -> bool {
        if self.available() == 0 || self.holders.contains(id) {
            return false;
        }
        self.holders.insert(id.clone())
    }

    pub fn release(&mut self, id: &SessionId) -> bool {
        self.holders.remove(id)
    }

    pub fn holders(&self) -> impl Iterator<Item = &SessionId> {
        self.holders.iter()
    }

    pub fn release_all(&mut self) -> Vec<SessionId> {
        std::mem::take(&mut self.holders).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn session(id: &str, created_at: DateTime<Utc>) -> Session {
        Session::new(id.into(), format!("https://x.test/{id}"), 3, created_at)
    }

    #[test]
    fn queue_orders_by_time_then_id_and_skips_backoff() {
        let t0 = Utc::now();
        let a = session("rec-b", t0);
        let b = session("rec-a", t0);
        let mut c = session("rec-c", t0 - Duration::seconds(1));
        c.retry_at = Some(t0 + Duration::seconds(30));

        let registry: HashMap<_, _> = [&a, &b, &c]
            .into_iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();
        let mut q = AdmissionQueue::new();
        for s in [&a, &b, &c] {
            q.push(s);
        }

        let order: Vec<_> = q.ids().map(|id| id.as_str().to_string()).collect();
        assert_eq!(order, vec!["rec-c", "rec-a", "rec-b"]);
        assert_eq!(q.next_admissible(&registry, t0), Some("rec-a".into()));
        assert_eq!(
            q.next_admissible(&registry, t0 + Duration::seconds(31)),
            Some("rec-c".into())
        );
        assert_eq!(q.next_retry_at(&registry, t0), c.retry_at);
    }

    #[test]
    fn permits_are_bounded_and_per_holder() {
        let mut pool = PermitPool::new(2);
        let (a, b, c) = (SessionId::from("a"), SessionId::from("b"), SessionId::from("c"));
        assert!(pool.try_acquire(&a));
        assert!(!pool.try_acquire(&a));
        assert!(pool.try_acquire(&b));
        assert!(!pool.try_acquire(&c));
        assert!(!pool.release(&c));
        assert!(pool.release(&a));
        assert_eq!(pool.available(), 1);
    }
}
