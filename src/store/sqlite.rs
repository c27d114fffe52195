// src/store/sqlite.rs

//! SQLite-backed [`SessionStore`].
//!
//! One row per session in `sessions`, keyed by `id`, with an index on
//! `status` for reconciliation. Timestamps are RFC 3339 strings in UTC,
//! fragments a JSON array of paths.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use crate::errors::{MultirecError, Result};
use crate::session::{Session, SessionId, SessionStatus};
use crate::store::SessionStore;
use crate::types::ErrorKind;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    max_attempts INTEGER NOT NULL,
    output_path TEXT,
    error_kind TEXT,
    error_detail TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    fragments TEXT NOT NULL DEFAULT '[]',
    retry_at TEXT,
    last_backoff_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
"#;

const COLUMNS: &str = "id, source, status, attempt, max_attempts, output_path, error_kind, \
     error_detail, created_at, started_at, ended_at, cancel_requested, fragments, retry_at, \
     last_backoff_ms";

pub struct SqliteSessionStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteSessionStore")
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = FULL;
        ",
        )?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "opened session database");

        Ok(Self {
            path: Some(path),
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database; gone when the store is dropped.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| MultirecError::Other(anyhow::anyhow!("session database lock poisoned")))?;
        f(&conn)
    }

    fn query(&self, sql: &str) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], read_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?.into_session()?);
            }
            Ok(out)
        })
    }
}

impl SessionStore for SqliteSessionStore {
    fn save(&self, s: &Session) -> Result<()> {
        let fragments = serde_json::to_string(&s.fragments)
            .map_err(|e| MultirecError::CorruptRecord(format!("{}: fragments: {e}", s.id)))?;

        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO sessions ({COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    s.id.as_str(),
                    s.source,
                    s.status.as_str(),
                    s.attempt,
                    s.max_attempts,
                    s.output_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                    s.error_kind.map(|k| k.as_str()),
                    s.error_detail,
                    ts(s.created_at),
                    s.started_at.map(ts),
                    s.ended_at.map(ts),
                    s.cancel_requested,
                    fragments,
                    s.retry_at.map(ts),
                    s.last_backoff_ms.map(|v| i64::try_from(v).unwrap_or(i64::MAX)),
                ],
            )?;
            Ok(())
        })
    }

    fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM sessions WHERE id = ?1"),
                    [id.as_str()],
                    read_row,
                )
                .optional()?)
        })?;
        row.map(RawRow::into_session).transpose()
    }

    fn list_non_terminal(&self) -> Result<Vec<Session>> {
        self.query(&format!(
            "SELECT {COLUMNS} FROM sessions \
             WHERE status IN ('queued', 'capturing', 'remuxing') \
             ORDER BY created_at, id"
        ))
    }

    fn list_all(&self) -> Result<Vec<Session>> {
        self.query(&format!("SELECT {COLUMNS} FROM sessions ORDER BY created_at, id"))
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Column values as stored, before domain validation.
struct RawRow {
    id: String,
    source: String,
    status: String,
    attempt: u32,
    max_attempts: u32,
    output_path: Option<String>,
    error_kind: Option<String>,
    error_detail: Option<String>,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    cancel_requested: bool,
    fragments: String,
    retry_at: Option<String>,
    last_backoff_ms: Option<i64>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        source: row.get(1)?,
        status: row.get(2)?,
        attempt: row.get(3)?,
        max_attempts: row.get(4)?,
        output_path: row.get(5)?,
        error_kind: row.get(6)?,
        error_detail: row.get(7)?,
        created_at: row.get(8)?,
        started_at: row.get(9)?,
        ended_at: row.get(10)?,
        cancel_requested: row.get(11)?,
        fragments: row.get(12)?,
        retry_at: row.get(13)?,
        last_backoff_ms: row.get(14)?,
    })
}

impl RawRow {
    fn into_session(self) -> Result<Session> {
        let id = self.id;
        let corrupt = |what: &str, e: &dyn fmt::Display| {
            MultirecError::CorruptRecord(format!("{id}: {what}: {e}"))
        };
        let parse_ts = |what: &str, v: &str| {
            DateTime::parse_from_rfc3339(v)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(what, &e))
        };
        let parse_opt_ts = |what: &str, v: Option<String>| {
            v.map(|v| parse_ts(what, &v)).transpose()
        };

        let status: SessionStatus = self.status.parse().map_err(|e: String| corrupt("status", &e))?;
        let error_kind = self
            .error_kind
            .map(|k| k.parse::<ErrorKind>())
            .transpose()
            .map_err(|e| corrupt("error_kind", &e))?;
        let fragments: Vec<PathBuf> =
            serde_json::from_str(&self.fragments).map_err(|e| corrupt("fragments", &e))?;
        let created_at = parse_ts("created_at", &self.created_at)?;
        let started_at = parse_opt_ts("started_at", self.started_at)?;
        let ended_at = parse_opt_ts("ended_at", self.ended_at)?;
        let retry_at = parse_opt_ts("retry_at", self.retry_at)?;

        Ok(Session {
            id: SessionId::from(id.clone()),
            source: self.source,
            status,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            output_path: self.output_path.map(PathBuf::from),
            error_kind,
            error_detail: self.error_detail,
            created_at,
            started_at,
            ended_at,
            cancel_requested: self.cancel_requested,
            fragments,
            retry_at,
            last_backoff_ms: self.last_backoff_ms.and_then(|v| u64::try_from(v).ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_saves_and_filters() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let now = Utc::now();
        let mut a = Session::new("rec-a".into(), "https://x.test/a".into(), 3, now);
        let mut b = Session::new("rec-b".into(), "https://x.test/b".into(), 3, now);
        a.status = SessionStatus::Capturing;
        b.status = SessionStatus::Failed;
        b.error_kind = Some(ErrorKind::SourceNotFound);
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        let open = store.list_non_terminal().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, a.id);

        let loaded = store.load(&b.id).unwrap().unwrap();
        assert_eq!(loaded.error_kind, Some(ErrorKind::SourceNotFound));
        assert!(store.load(&"rec-missing".into()).unwrap().is_none());
    }

    #[test]
    fn unknown_status_is_reported_as_corrupt() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let s = Session::new("rec-x".into(), "https://x.test/x".into(), 1, Utc::now());
        store.save(&s).unwrap();
        store
            .with_conn(|c| {
                c.execute("UPDATE sessions SET status = 'paused' WHERE id = 'rec-x'", [])?;
                Ok(())
            })
            .unwrap();

        match store.load(&s.id) {
            Err(MultirecError::CorruptRecord(msg)) => assert!(msg.contains("status")),
            other => panic!("expected CorruptRecord, got {other:?}"),
        }
    }
}
