// tests/reconciliation.rs

use std::sync::Arc;

use chrono::{Duration, Utc};

use multirec::engine::{CoreCommand, EngineEvent, Phase, WorkerOutcome, WorkerReport};
use multirec::errors::MultirecError;
use multirec::fs::{FileSystem, MockFileSystem};
use multirec::session::{SessionId, SessionStatus};
use multirec::store::{MemorySessionStore, SessionStore, SqliteSessionStore};
use multirec::types::ErrorKind;
use multirec_test_utils::builders::{core_scheduler, scheduler_settings, SessionBuilder};
use multirec_test_utils::init_tracing;

fn dispatched(commands: &[CoreCommand]) -> Vec<(SessionId, Phase)> {
    commands
        .iter()
        .filter_map(|c| match c {
            CoreCommand::Dispatch(a) => Some((a.session.id.clone(), a.phase)),
            _ => None,
        })
        .collect()
}

#[test]
fn interrupted_sessions_are_requeued_or_failed() {
    init_tracing();
    let t0 = Utc::now() - Duration::minutes(10);
    let store = MemorySessionStore::new();
    store.insert(
        SessionBuilder::new("rec-capturing")
            .status(SessionStatus::Capturing)
            .attempt(1)
            .created_at(t0)
            .build(),
    );
    store.insert(
        SessionBuilder::new("rec-exhausted")
            .status(SessionStatus::Remuxing)
            .attempt(2)
            .max_attempts(3)
            .created_at(t0 + Duration::seconds(1))
            .build(),
    );
    store.insert(
        SessionBuilder::new("rec-cancelling")
            .status(SessionStatus::Capturing)
            .cancel_requested()
            .created_at(t0 + Duration::seconds(2))
            .build(),
    );
    store.insert(
        SessionBuilder::new("rec-done")
            .status(SessionStatus::Completed)
            .created_at(t0 - Duration::seconds(1))
            .build(),
    );

    // No headroom, so reconciliation only repairs state.
    let fs = MockFileSystem::new();
    fs.set_free_space(0);
    let mut blocked = core_scheduler(scheduler_settings(1), store.clone(), Arc::new(fs));
    let step = blocked.reconcile(Utc::now()).unwrap();
    assert!(dispatched(&step.commands).is_empty());

    let requeued = store.get(&"rec-capturing".into()).unwrap();
    assert_eq!(requeued.status, SessionStatus::Queued);
    assert_eq!(requeued.attempt, 1, "reconciliation does not consume an attempt");

    let failed = store.get(&"rec-exhausted".into()).unwrap();
    assert_eq!(failed.status, SessionStatus::Failed);
    assert_eq!(failed.error_kind, Some(ErrorKind::Interrupted));

    let cancelled = store.get(&"rec-cancelling".into()).unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);

    assert_eq!(
        store.get(&"rec-done".into()).unwrap().status,
        SessionStatus::Completed
    );

    // With headroom, the repaired session is admitted again.
    let mut core = core_scheduler(scheduler_settings(1), store.clone(), Arc::new(MockFileSystem::new()));
    let step = core.reconcile(Utc::now()).unwrap();
    assert_eq!(
        dispatched(&step.commands),
        vec![(SessionId::from("rec-capturing"), Phase::Capture)]
    );
}

#[test]
fn interrupting_the_last_permitted_try_fails_the_session() {
    init_tracing();
    let store = MemorySessionStore::new();
    let fs: Arc<dyn FileSystem> = Arc::new(MockFileSystem::new());
    let t0 = Utc::now();

    let mut core = core_scheduler(scheduler_settings(1), store.clone(), Arc::clone(&fs));
    core.step(
        EngineEvent::Submit {
            id: "rec-a".into(),
            source: "stream-a".into(),
            max_attempts: Some(2),
        },
        t0,
    );
    core.step(
        EngineEvent::Worker(WorkerReport {
            session_id: "rec-a".into(),
            phase: Phase::Capture,
            outcome: WorkerOutcome::failed(ErrorKind::NetworkTimeout, "timed out"),
        }),
        t0,
    );
    let requeued = store.get(&"rec-a".into()).unwrap();
    assert_eq!(requeued.status, SessionStatus::Queued);
    assert_eq!(requeued.attempt, 1);

    // Backoff has expired; the second and last try starts.
    let step = core.step(EngineEvent::Tick, t0 + Duration::seconds(1));
    assert_eq!(
        dispatched(&step.commands),
        vec![(SessionId::from("rec-a"), Phase::Capture)]
    );
    assert_eq!(store.get(&"rec-a".into()).unwrap().status, SessionStatus::Capturing);

    // The process dies mid-capture and starts again.
    drop(core);
    let mut restarted = core_scheduler(scheduler_settings(1), store.clone(), fs);
    let step = restarted.reconcile(t0 + Duration::seconds(2)).unwrap();
    assert!(dispatched(&step.commands).is_empty());

    let failed = store.get(&"rec-a".into()).unwrap();
    assert_eq!(failed.status, SessionStatus::Failed);
    assert_eq!(failed.error_kind, Some(ErrorKind::Interrupted));
    assert_eq!(failed.attempt, 1);
}

#[test]
fn queued_sessions_resume_in_fifo_order() {
    let t0 = Utc::now() - Duration::minutes(1);
    let store = MemorySessionStore::new();
    // Inserted out of order; created_at decides.
    for (id, offset) in [("rec-c", 2), ("rec-a", 0), ("rec-b", 1)] {
        store.insert(
            SessionBuilder::new(id)
                .created_at(t0 + Duration::seconds(offset))
                .build(),
        );
    }

    let mut core = core_scheduler(scheduler_settings(2), store, Arc::new(MockFileSystem::new()));
    let step = core.reconcile(Utc::now()).unwrap();

    assert_eq!(
        dispatched(&step.commands),
        vec![
            (SessionId::from("rec-a"), Phase::Capture),
            (SessionId::from("rec-b"), Phase::Capture),
        ]
    );
    assert_eq!(core.queued_len(), 1);
}

#[test]
fn store_failure_during_reconciliation_is_fatal() {
    let store = MemorySessionStore::new();
    store.insert(SessionBuilder::new("rec-a").status(SessionStatus::Capturing).build());
    store.set_fail_saves(true);

    let mut core = core_scheduler(scheduler_settings(1), store, Arc::new(MockFileSystem::new()));
    assert!(matches!(
        core.reconcile(Utc::now()),
        Err(MultirecError::Other(_))
    ));
}

#[test]
fn sqlite_records_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("multirec.db");

    {
        let store = SqliteSessionStore::open(&db).unwrap();
        store
            .save(
                &SessionBuilder::new("rec-a")
                    .status(SessionStatus::Remuxing)
                    .fragments(vec!["/w/rec-a/capture/fragment-00001.ts".into()])
                    .output_path("/out/20240101T000000_rec-a.mp4")
                    .build(),
            )
            .unwrap();
    }

    let store = SqliteSessionStore::open(&db).unwrap();
    let mut core = core_scheduler(scheduler_settings(1), store, Arc::new(MockFileSystem::new()));
    core.reconcile(Utc::now()).unwrap();

    let session = core.session(&"rec-a".into()).unwrap();
    assert_eq!(session.status, SessionStatus::Capturing, "requeued and admitted again");
    assert_eq!(session.fragments.len(), 1, "fragments kept for a remux-only retry");
    assert!(session.output_path.is_some());

    let reread = SqliteSessionStore::open(&db).unwrap();
    let persisted = reread.load(&"rec-a".into()).unwrap().unwrap();
    assert_eq!(persisted.status, SessionStatus::Capturing);
}
