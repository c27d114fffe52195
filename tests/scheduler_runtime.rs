// tests/scheduler_runtime.rs

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use multirec::engine::{
    CoreScheduler, Phase, Runtime, RuntimeOptions, SchedulerHandle, ShutdownReport, StateChange,
    WorkerOutcome,
};
use multirec::errors::{MultirecError, Result};
use multirec::fs::{DiskSpaceGuard, MockFileSystem};
use multirec::session::machine::is_legal;
use multirec::session::{SessionId, SessionStatus};
use multirec::store::MemorySessionStore;
use multirec::types::ErrorKind;
use multirec_test_utils::builders::{
    core_scheduler_with_options, fast_retry, runtime_options, scheduler_settings, SessionBuilder,
};
use multirec_test_utils::fake_backend::{FakeBackend, FakeWorkers};
use multirec_test_utils::{eventually, init_tracing, with_timeout};

struct Harness {
    handle: SchedulerHandle,
    workers: FakeWorkers,
    store: MemorySessionStore,
    fs: MockFileSystem,
    changes: Arc<Mutex<Vec<StateChange>>>,
    join: JoinHandle<Result<ShutdownReport>>,
}

impl Harness {
    fn start(max_concurrent: usize) -> Self {
        Self::start_with(max_concurrent, MemorySessionStore::new(), MockFileSystem::new())
    }

    fn start_with(max_concurrent: usize, store: MemorySessionStore, fs: MockFileSystem) -> Self {
        Self::start_with_options(max_concurrent, store, fs, runtime_options())
    }

    fn start_with_options(
        max_concurrent: usize,
        store: MemorySessionStore,
        fs: MockFileSystem,
        options: RuntimeOptions,
    ) -> Self {
        init_tracing();
        let core = core_scheduler_with_options(
            scheduler_settings(max_concurrent),
            options,
            store.clone(),
            Arc::new(fs.clone()),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let (backend, workers) = FakeBackend::new(tx.clone());
        let (runtime, handle) = Runtime::new(core, tx, rx, backend);

        let changes = Arc::new(Mutex::new(Vec::new()));
        let mut subscription = handle.subscribe();
        let sink = Arc::clone(&changes);
        tokio::spawn(async move {
            while let Some(change) = subscription.next().await {
                sink.lock().unwrap().push(change);
            }
        });

        let join = tokio::spawn(runtime.run());
        Self {
            handle,
            workers,
            store,
            fs,
            changes,
            join,
        }
    }

    fn status(&self, id: &SessionId) -> Option<SessionStatus> {
        self.store.get(id).map(|s| s.status)
    }

    async fn wait_for_status(&self, id: &SessionId, status: SessionStatus) {
        eventually(|| self.status(id) == Some(status)).await;
    }

    async fn wait_for_phase(&self, id: &SessionId, phase: Phase) {
        eventually(|| self.workers.phase_of(id) == Some(phase)).await;
    }

    async fn shutdown(self, drain: Duration) -> ShutdownReport {
        let report = self.handle.shutdown(drain).await.unwrap();
        let from_run = with_timeout(self.join).await.unwrap().unwrap();
        assert_eq!(report, from_run);
        report
    }
}

fn capture_order(workers: &FakeWorkers) -> Vec<SessionId> {
    workers
        .dispatched()
        .into_iter()
        .filter(|(_, phase)| *phase == Phase::Capture)
        .map(|(id, _)| id)
        .collect()
}

#[tokio::test]
async fn fifo_admission_with_a_single_slot() {
    let h = Harness::start(1);

    let a = h.handle.submit("stream-A", None).unwrap();
    let b = h.handle.submit("stream-B", None).unwrap();
    let c = h.handle.submit("stream-C", None).unwrap();

    h.wait_for_phase(&a, Phase::Capture).await;
    assert_eq!(h.status(&b), Some(SessionStatus::Queued));
    assert_eq!(h.status(&c), Some(SessionStatus::Queued));

    for id in [&a, &b, &c] {
        h.wait_for_phase(id, Phase::Capture).await;
        h.workers.succeed(id);
        h.wait_for_phase(id, Phase::Remux).await;
        h.workers.succeed(id);
        h.wait_for_status(id, SessionStatus::Completed).await;
    }

    assert_eq!(capture_order(&h.workers), vec![a.clone(), b.clone(), c.clone()]);
    assert_eq!(h.workers.peak_running(), 1);

    // Every published transition is an edge of the lifecycle.
    eventually(|| {
        h.changes
            .lock()
            .unwrap()
            .iter()
            .filter(|ch| ch.new_status == SessionStatus::Completed)
            .count()
            == 3
    })
    .await;
    for change in h.changes.lock().unwrap().iter() {
        if let Some(old) = change.old_status {
            assert!(is_legal(old, change.new_status), "illegal {old} -> {}", change.new_status);
        }
    }

    let report = h.shutdown(Duration::from_millis(100)).await;
    assert!(report.non_terminal.is_empty());
}

#[tokio::test]
async fn concurrency_never_exceeds_the_permit_pool() {
    let h = Harness::start(2);
    let ids: Vec<SessionId> = (0..5)
        .map(|i| h.handle.submit(&format!("https://live.test/{i}"), None).unwrap())
        .collect();

    eventually(|| h.workers.running().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.workers.running().len(), 2);

    h.workers.set_auto_complete(true);
    let first_two: Vec<SessionId> = h.workers.running();
    for id in &first_two {
        h.workers.succeed(id);
    }
    for id in &ids {
        h.wait_for_status(id, SessionStatus::Completed).await;
    }
    assert_eq!(h.workers.peak_running(), 2);
    h.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn transient_failure_requeues_with_backoff() {
    let h = Harness::start(1);
    let a = h.handle.submit("https://live.test/a", Some(3)).unwrap();
    h.wait_for_phase(&a, Phase::Capture).await;

    h.workers
        .complete(&a, WorkerOutcome::failed(ErrorKind::NetworkTimeout, "read timed out"));

    // Requeued for its second attempt with a recorded, non-zero backoff.
    eventually(|| h.store.get(&a).is_some_and(|s| s.attempt == 1)).await;
    let record = h.store.get(&a).unwrap();
    assert_eq!(record.error_kind, Some(ErrorKind::NetworkTimeout));
    assert_eq!(record.last_backoff_ms, Some(fast_retry().base.as_millis() as u64));

    // Admitted again once the backoff expires.
    eventually(|| capture_order(&h.workers).len() == 2).await;
    h.workers.succeed(&a);
    h.wait_for_phase(&a, Phase::Remux).await;
    h.workers.succeed(&a);
    h.wait_for_status(&a, SessionStatus::Completed).await;

    let seen: Vec<(Option<SessionStatus>, SessionStatus)> = h
        .changes
        .lock()
        .unwrap()
        .iter()
        .map(|c| (c.old_status, c.new_status))
        .collect();
    assert!(seen.contains(&(Some(SessionStatus::Capturing), SessionStatus::Queued)));
    h.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn failure_on_a_later_try_doubles_the_backoff() {
    // Persisted from an earlier run: one failure already behind it.
    let store = MemorySessionStore::new();
    store.insert(SessionBuilder::new("rec-b").attempt(1).max_attempts(3).build());
    let h = Harness::start_with(1, store, MockFileSystem::new());
    let b = SessionId::from("rec-b");
    h.wait_for_phase(&b, Phase::Capture).await;

    h.workers
        .complete(&b, WorkerOutcome::failed(ErrorKind::NetworkTimeout, "read timed out"));

    eventually(|| h.store.get(&b).is_some_and(|s| s.attempt == 2)).await;
    let record = h.store.get(&b).unwrap();
    assert_eq!(record.status, SessionStatus::Queued);
    assert_eq!(
        record.last_backoff_ms,
        Some(2 * fast_retry().base.as_millis() as u64)
    );
    h.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn backoff_expiry_readmits_without_a_disk_recheck() {
    let options = RuntimeOptions {
        disk_recheck_interval: Duration::from_secs(3600),
        ..runtime_options()
    };
    let h = Harness::start_with_options(1, MemorySessionStore::new(), MockFileSystem::new(), options);
    let a = h.handle.submit("https://live.test/a", Some(3)).unwrap();
    h.wait_for_phase(&a, Phase::Capture).await;

    h.workers
        .complete(&a, WorkerOutcome::failed(ErrorKind::NetworkError, "connection reset"));

    // Only the wake timer can bring it back within the test timeout.
    eventually(|| capture_order(&h.workers).len() == 2).await;
    assert_eq!(h.status(&a), Some(SessionStatus::Capturing));
    h.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
    let h = Harness::start(1);
    let a = h.handle.submit("https://live.test/a", Some(2)).unwrap();

    for round in 1..=2 {
        eventually(|| capture_order(&h.workers).len() == round && h.workers.is_running(&a)).await;
        h.workers
            .complete(&a, WorkerOutcome::failed(ErrorKind::NetworkError, "connection reset"));
    }

    h.wait_for_status(&a, SessionStatus::Failed).await;
    let record = h.store.get(&a).unwrap();
    assert!(record.attempt <= record.max_attempts);
    assert_eq!(record.error_kind, Some(ErrorKind::NetworkError));
    h.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn admission_waits_for_disk_headroom() {
    let fs = MockFileSystem::new();
    fs.set_free_space(0);
    let h = Harness::start_with(1, MemorySessionStore::new(), fs);

    let a = h.handle.submit("https://live.test/a", None).unwrap();
    let b = h.handle.submit("https://live.test/b", None).unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(h.workers.dispatched().is_empty());
    assert_eq!(h.status(&a), Some(SessionStatus::Queued));

    h.fs.set_free_space(u64::MAX);
    h.wait_for_phase(&a, Phase::Capture).await;
    assert_eq!(h.status(&b), Some(SessionStatus::Queued));
    h.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn cancel_queued_and_in_flight_sessions() {
    let h = Harness::start(1);
    let a = h.handle.submit("https://live.test/a", None).unwrap();
    let b = h.handle.submit("https://live.test/b", None).unwrap();
    h.wait_for_phase(&a, Phase::Capture).await;

    h.handle.cancel(&b).unwrap();
    h.wait_for_status(&b, SessionStatus::Cancelled).await;

    h.handle.cancel(&a).unwrap();
    h.wait_for_status(&a, SessionStatus::Cancelled).await;
    assert_eq!(h.workers.stopped(), vec![a.clone()]);
    assert!(h.store.get(&a).unwrap().cancel_requested);

    // Idempotent on terminal sessions.
    h.handle.cancel(&a).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.workers.stopped().len(), 1);
    assert_eq!(capture_order(&h.workers), vec![a.clone()]);
    h.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn completed_remux_wins_over_a_late_cancel() {
    let h = Harness::start(1);
    h.workers.set_stop_confirms(false);
    let a = h.handle.submit("https://live.test/a", None).unwrap();
    h.wait_for_phase(&a, Phase::Capture).await;
    h.workers.succeed(&a);
    h.wait_for_phase(&a, Phase::Remux).await;

    h.handle.cancel(&a).unwrap();
    eventually(|| h.workers.stopped().contains(&a)).await;
    h.workers.succeed(&a);

    h.wait_for_status(&a, SessionStatus::Completed).await;
    h.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn shutdown_forces_unresponsive_workers_and_reports_leftovers() {
    let h = Harness::start(2);
    h.workers.set_stop_confirms(false);
    let a = h.handle.submit("https://live.test/a", None).unwrap();
    let b = h.handle.submit("https://live.test/b", None).unwrap();
    let c = h.handle.submit("https://live.test/c", None).unwrap();
    eventually(|| h.workers.running().len() == 2).await;

    let workers = h.workers.clone();
    let handle = h.handle.clone();
    let report = h.shutdown(Duration::from_millis(50)).await;

    let mut left: Vec<SessionId> = report.non_terminal.iter().map(|s| s.id.clone()).collect();
    left.sort();
    let mut expected = vec![a.clone(), b.clone(), c.clone()];
    expected.sort();
    assert_eq!(left, expected);

    let mut aborted = workers.aborted();
    aborted.sort();
    let mut in_flight = vec![a, b];
    in_flight.sort();
    assert_eq!(aborted, in_flight);

    assert!(matches!(
        handle.submit("https://live.test/d", None),
        Err(MultirecError::SchedulerClosed)
    ));
}

#[tokio::test]
async fn submit_rejects_malformed_sources() {
    let h = Harness::start(1);
    assert!(matches!(
        h.handle.submit("not a url", None),
        Err(MultirecError::InvalidSource(_))
    ));
    assert!(matches!(
        h.handle.submit("", None),
        Err(MultirecError::InvalidSource(_))
    ));
    assert!(h.handle.list_sessions().await.unwrap().is_empty());
    h.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn list_sessions_returns_oldest_first() {
    let h = Harness::start(1);
    let a = h.handle.submit("https://live.test/a", None).unwrap();
    let b = h.handle.submit("https://live.test/b", None).unwrap();

    let listed: Vec<SessionId> = h
        .handle
        .list_sessions()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(listed, vec![a, b]);
    h.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn once_mode_exits_when_idle() {
    init_tracing();
    let store = MemorySessionStore::new();
    let fs = Arc::new(MockFileSystem::new());
    let settings = scheduler_settings(2);
    let guard = DiskSpaceGuard::new(fs, settings.output_directory.clone());
    let options = RuntimeOptions {
        exit_when_idle: true,
        disk_recheck_interval: Duration::from_millis(20),
    };
    let core = CoreScheduler::new(settings, options, Box::new(store.clone()), guard, fast_retry());

    let (tx, rx) = mpsc::unbounded_channel();
    let (backend, workers) = FakeBackend::new(tx.clone());
    workers.set_auto_complete(true);
    let (runtime, handle) = Runtime::new(core, tx, rx, backend);

    let a = handle.submit("https://live.test/a", None).unwrap();
    let b = handle.submit("https://live.test/b", None).unwrap();

    let report = with_timeout(runtime.run()).await.unwrap();
    assert!(report.non_terminal.is_empty());
    for id in [&a, &b] {
        assert_eq!(store.get(id).map(|s| s.status), Some(SessionStatus::Completed));
    }
}
