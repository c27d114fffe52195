// src/store/mod.rs

//! Persistence adapter for session records.
//!
//! The scheduler calls [`SessionStore::save`] before a transition is
//! considered committed, and before anything is published about it.

pub mod memory;
pub mod sqlite;

use std::fmt::Debug;

use crate::errors::Result;
use crate::session::{Session, SessionId};

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

/// Durable store keyed by session id.
pub trait SessionStore: Send + Debug {
    /// Insert or replace the full record.
    fn save(&self, session: &Session) -> Result<()>;

    fn load(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Every session not in a terminal status, oldest first.
    fn list_non_terminal(&self) -> Result<Vec<Session>>;

    /// Every session, oldest first.
    fn list_all(&self) -> Result<Vec<Session>>;
}
