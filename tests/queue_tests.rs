//! Integration tests for the access log queue

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

use access_ledger::overflow::{encode_chunks, parse_chunks, OverflowChunk};
use access_ledger::{
    AccessEvent, AccessLogQueue, MemoryStore, QueueConfig, QueueError, RecordingNotifier,
    WorkerState,
};

struct Harness {
    queue: Arc<AccessLogQueue>,
    store: MemoryStore,
    notifier: RecordingNotifier,
    path: PathBuf,
    _temp_dir: TempDir,
}

fn setup(store: MemoryStore) -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("entitlementErrors");
    let notifier = RecordingNotifier::new();
    let config = QueueConfig::new(&path)
        .with_batch_size(10)
        .with_retry_interval(Duration::from_millis(20))
        .with_alert_recipient("ops@example.com");
    let queue = AccessLogQueue::new(config, Arc::new(store.clone()), Arc::new(notifier.clone()));

    Harness {
        queue: Arc::new(queue),
        store,
        notifier,
        path,
        _temp_dir: temp_dir,
    }
}

async fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

fn event(entitlement_id: i64) -> AccessEvent {
    AccessEvent::new(entitlement_id, 10, 7, "1.2.3.4").at(1000)
}

fn chunk(comment: &str, entitlement_id: i64) -> OverflowChunk {
    OverflowChunk::new([comment], vec![event(entitlement_id)])
}

#[tokio::test]
async fn test_enqueue_requires_started_worker() {
    let h = setup(MemoryStore::new());

    let result = h.queue.enqueue(event(1));
    assert!(matches!(result, Err(QueueError::NotRunning)));
    assert_eq!(h.queue.size(), 0);
}

#[tokio::test]
async fn test_events_committed_and_units_decremented() {
    let h = setup(MemoryStore::new().with_entitlement(5, 7, 3));
    h.queue.start_worker();

    for _ in 0..5 {
        h.queue.enqueue(event(5)).unwrap();
    }

    wait_until("five log rows", || h.store.entitlement_log().len() == 5).await;
    assert_eq!(h.store.access_log().len(), 5);
    assert_eq!(h.store.units(5), Some(0));
    assert!(h.queue.is_empty());
    assert!(h.notifier.alerts().is_empty());

    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_outage_diverts_batch_then_recovers() {
    let h = setup(MemoryStore::new().with_entitlement(5, 7, 1));
    h.store.set_offline(true);
    h.queue.start_worker();

    let accessed = AccessEvent::new(5, 10, 7, "1.2.3.4")
        .at(1000)
        .with_attribute("a", "1")
        .with_attribute("b", "2");
    h.queue.enqueue(accessed).unwrap();

    wait_until("overflow alert", || h.notifier.count() == 1).await;
    let content = fs::read_to_string(&h.path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert!(lines[0].starts_with('#'));
    assert_eq!(*lines.last().unwrap(), "5;10;7;1000;1.2.3.4;a=1&b=2");
    assert!(h.store.entitlement_log().is_empty());

    // Further failing passes stay quiet
    sleep(Duration::from_millis(150)).await;
    assert_eq!(h.notifier.count(), 1);
    assert_eq!(h.notifier.alerts()[0].recipient, "ops@example.com");

    h.store.set_offline(false);
    wait_until("overflow drained", || !h.path.exists()).await;

    let rows = h.store.entitlement_log();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].data, "a=1&b=2");
    assert_eq!(h.store.units(5), Some(0));
    assert!(!h.queue.alert_sent());

    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_second_outage_alerts_again() {
    let h = setup(MemoryStore::new());
    h.queue.start_worker();

    h.store.set_offline(true);
    h.queue.enqueue(event(1)).unwrap();
    wait_until("first alert", || h.notifier.count() == 1).await;

    h.store.set_offline(false);
    wait_until("first recovery", || !h.path.exists()).await;

    h.store.set_offline(true);
    h.queue.enqueue(event(2)).unwrap();
    wait_until("second alert", || h.notifier.count() == 2).await;

    h.store.set_offline(false);
    wait_until("second recovery", || !h.path.exists()).await;
    assert_eq!(h.store.entitlement_log().len(), 2);

    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_partial_recovery_keeps_failing_chunk_and_rest() {
    let h = setup(MemoryStore::new());
    let backlog = vec![chunk("#c1", 1), chunk("#c2", 2), chunk("#c3", 3)];
    fs::write(&h.path, encode_chunks(&backlog)).unwrap();
    h.store.fail_entitlement(2);

    h.queue.start_worker();
    wait_until("first chunk committed", || h.store.entitlement_log().len() == 1).await;
    wait_until("alert", || h.notifier.count() == 1).await;

    let remaining = parse_chunks(&fs::read_to_string(&h.path).unwrap()).unwrap();
    assert_eq!(remaining, backlog[1..].to_vec());

    h.store.heal_entitlement(2);
    wait_until("overflow drained", || !h.path.exists()).await;

    let order: Vec<i64> = h
        .store
        .entitlement_log()
        .iter()
        .map(|row| row.entitlement_id)
        .collect();
    assert_eq!(order, vec![1, 2, 3]);

    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_malformed_overflow_is_left_untouched() {
    let h = setup(MemoryStore::new());
    fs::write(&h.path, "#c\n1;2;3\n").unwrap();

    h.queue.start_worker();
    wait_until("parse alert", || h.notifier.count() == 1).await;
    assert_eq!(fs::read_to_string(&h.path).unwrap(), "#c\n1;2;3\n");

    // New events still flow
    h.queue.enqueue(event(9)).unwrap();
    wait_until("event committed", || h.store.entitlement_log().len() == 1).await;
    assert_eq!(h.queue.state(), WorkerState::Running);
    assert_eq!(h.notifier.count(), 1);

    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_stop_keeps_queued_events_for_restart() {
    let h = setup(MemoryStore::new());
    h.queue.start_worker();

    for id in 0..25 {
        h.queue.enqueue(event(id)).unwrap();
    }
    h.queue.stop();
    h.queue
        .wait_for_state(|s| *s == WorkerState::Stopped)
        .await;

    assert_eq!(h.store.entitlement_log().len() + h.queue.size(), 25);
    assert!(matches!(
        h.queue.enqueue(event(99)),
        Err(QueueError::NotRunning)
    ));

    h.queue.start_worker();
    wait_until("restart drains queue", || h.store.entitlement_log().len() == 25).await;
    assert!(h.queue.is_empty());

    let order: Vec<i64> = h
        .store
        .entitlement_log()
        .iter()
        .map(|row| row.entitlement_id)
        .collect();
    assert_eq!(order, (0..25).collect::<Vec<_>>());

    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_terminated_worker_can_be_restarted() {
    let h = setup(MemoryStore::new());
    h.store.set_refuse_connections(true);

    h.queue.start_worker();
    h.queue
        .wait_for_state(|s| *s == WorkerState::Terminated)
        .await;
    assert!(matches!(h.queue.enqueue(event(1)), Err(QueueError::NotRunning)));

    h.store.set_refuse_connections(false);
    h.queue.start_worker();
    h.queue
        .wait_for_state(|s| *s == WorkerState::Running)
        .await;

    h.queue.enqueue(event(1)).unwrap();
    wait_until("event committed", || h.store.entitlement_log().len() == 1).await;

    h.queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers() {
    let h = setup(MemoryStore::new());
    h.queue.start_worker();

    let producers = (0..8).map(|p| {
        let queue = Arc::clone(&h.queue);
        tokio::spawn(async move {
            for n in 0..50 {
                queue.enqueue(event(p * 1000 + n)).unwrap();
            }
        })
    });
    for result in join_all(producers).await {
        result.unwrap();
    }

    wait_until("all events committed", || h.store.entitlement_log().len() == 400).await;
    assert!(h.queue.is_empty());

    // Per-producer order is preserved
    let rows = h.store.entitlement_log();
    for p in 0..8i64 {
        let ids: Vec<i64> = rows
            .iter()
            .map(|row| row.entitlement_id)
            .filter(|id| id / 1000 == p)
            .collect();
        assert_eq!(ids, (0..50).map(|n| p * 1000 + n).collect::<Vec<_>>());
    }

    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_recover_text_appends_unresolved_to_canonical() {
    let h = setup(MemoryStore::new());
    h.store.fail_entitlement(2);
    let text = encode_chunks(&[chunk("#c1", 1), chunk("#c2", 2)]);

    let report = h.queue.recover_text(&text).await.unwrap();
    assert_eq!(report.chunks_found, 2);
    assert_eq!(report.chunks_processed, 1);
    assert!(report.alert_sent);

    let canonical = parse_chunks(&fs::read_to_string(&h.path).unwrap()).unwrap();
    assert_eq!(canonical, vec![chunk("#c2", 2)]);
}

#[tokio::test]
async fn test_recover_file_moves_remainder_to_canonical() {
    let h = setup(MemoryStore::new());
    let exported = h.path.with_file_name("archived");
    fs::write(&exported, encode_chunks(&[chunk("#old", 4)])).unwrap();

    h.store.set_offline(true);
    let report = h.queue.recover_file(&exported).await.unwrap();
    assert!(!report.is_success());
    assert!(h.queue.alert_sent());
    assert!(!exported.exists());
    let canonical = parse_chunks(&fs::read_to_string(&h.path).unwrap()).unwrap();
    assert_eq!(canonical, vec![chunk("#old", 4)]);

    h.queue.clear_alert_flag();
    assert!(!h.queue.alert_sent());

    h.store.set_offline(false);
    let report = h.queue.recover().await.unwrap();
    assert!(report.is_success());
    assert!(!h.path.exists());
    assert_eq!(h.store.entitlement_log()[0].entitlement_id, 4);
}

#[tokio::test]
async fn test_worker_retries_remainder_of_recovered_file() {
    let h = setup(MemoryStore::new());
    let exported = h.path.with_file_name("archived");
    fs::write(&exported, encode_chunks(&[chunk("#a", 1), chunk("#b", 2)])).unwrap();
    h.store.fail_entitlement(2);

    h.queue.recover_file(&exported).await.unwrap();
    assert_eq!(h.store.entitlement_log().len(), 1);

    h.queue.start_worker();
    h.store.heal_entitlement(2);
    wait_until("moved chunk committed", || h.store.entitlement_log().len() == 2).await;
    wait_until("overflow drained", || !h.path.exists()).await;

    h.queue.shutdown().await;
}

#[tokio::test]
async fn test_stop_then_start_keeps_worker_running() {
    let h = setup(MemoryStore::new());
    h.queue.start_worker();
    h.queue
        .wait_for_state(|s| *s == WorkerState::Running)
        .await;

    h.queue.stop();
    h.queue.start_worker();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(h.queue.state(), WorkerState::Running);
    h.queue.enqueue(event(3)).unwrap();
    wait_until("event committed", || h.store.entitlement_log().len() == 1).await;

    h.queue.shutdown().await;
}
