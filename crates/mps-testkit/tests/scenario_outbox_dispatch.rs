use std::sync::Arc;
use std::time::Duration;

use mps_reconcile::RemoteRecord;
use mps_runtime::{apply_remote, Cause, DeliveryError, OutboxDispatcher, RetryPolicy};
use mps_schemas::{EntityType, OutboxStatus};
use mps_testkit::{snapshot, test_context, RecordingSink, TestEnv};

fn dispatcher(env: &TestEnv, sink: Arc<RecordingSink>, max_attempts: u32) -> OutboxDispatcher {
    OutboxDispatcher::new(
        env.store.clone(),
        sink,
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        10,
        Duration::from_secs(60),
        64,
    )
}

async fn seed_events(env: &TestEnv, n: usize) {
    for i in 0..n {
        let rec = RemoteRecord::decode_snapshot(snapshot(&format!("1-{i}"), "delivered")).unwrap();
        apply_remote(&env.ctx, "acme", EntityType::PostingFbs, &rec, Cause::Sync)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn pending_rows_are_delivered_once_in_creation_order() {
    let env = test_context();
    seed_events(&env, 3).await;
    let sink = Arc::new(RecordingSink::new());
    let d = dispatcher(&env, sink.clone(), 3);

    let report = d.dispatch_once().await.unwrap();
    assert_eq!((report.claimed, report.sent), (3, 3));

    let again = d.dispatch_once().await.unwrap();
    assert_eq!(again.claimed, 0);

    let delivered: Vec<String> = sink.delivered().into_iter().map(|e| e.aggregate_id).collect();
    assert_eq!(delivered, vec!["1-0", "1-1", "1-2"]);
    assert!(env
        .store
        .outbox()
        .await
        .iter()
        .all(|e| e.status == OutboxStatus::Sent && e.sent_at.is_some()));
}

#[tokio::test]
async fn retryable_failure_backs_off_then_succeeds() {
    let env = test_context();
    seed_events(&env, 1).await;
    let sink = Arc::new(RecordingSink::new());
    sink.fail_next(DeliveryError::Retryable("503 from downstream".into()));
    let d = dispatcher(&env, sink.clone(), 3);

    let first = d.dispatch_once().await.unwrap();
    assert_eq!(first.retried, 1);
    let row = env.store.outbox().await.remove(0);
    assert_eq!(row.status, OutboxStatus::Pending);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("503 from downstream"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = d.dispatch_once().await.unwrap();
    assert_eq!(second.sent, 1);
    assert_eq!(sink.delivered().len(), 1);
    assert_eq!(env.store.outbox().await[0].status, OutboxStatus::Sent);
}

#[tokio::test]
async fn permanent_failure_marks_row_failed_immediately() {
    let env = test_context();
    seed_events(&env, 1).await;
    let sink = Arc::new(RecordingSink::new());
    sink.fail_next(DeliveryError::Permanent("400 bad payload".into()));
    let d = dispatcher(&env, sink.clone(), 5);

    let report = d.dispatch_once().await.unwrap();
    assert_eq!(report.failed, 1);
    let row = env.store.outbox().await.remove(0);
    assert_eq!(row.status, OutboxStatus::Failed);
    assert!(sink.delivered().is_empty());
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let env = test_context();
    seed_events(&env, 1).await;
    let sink = Arc::new(RecordingSink::new());
    for _ in 0..2 {
        sink.fail_next(DeliveryError::Retryable("timeout".into()));
    }
    let d = dispatcher(&env, sink.clone(), 2);

    assert_eq!(d.dispatch_once().await.unwrap().retried, 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(d.dispatch_once().await.unwrap().failed, 1);

    let row = env.store.outbox().await.remove(0);
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.retry_count, 2);
}

#[tokio::test]
async fn claimed_rows_are_leased_away_from_a_second_dispatcher() {
    let env = test_context();
    seed_events(&env, 2).await;
    use mps_db::Store;

    let now = chrono::Utc::now();
    let claimed = env
        .store
        .outbox_claim_due(now, 10, now + chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);

    let sink = Arc::new(RecordingSink::new());
    let report = dispatcher(&env, sink, 3).dispatch_once().await.unwrap();
    assert_eq!(report.claimed, 0);
}

#[tokio::test]
async fn spawned_dispatcher_drains_and_stops_on_shutdown() {
    let env = test_context();
    seed_events(&env, 2).await;
    let sink = Arc::new(RecordingSink::new());
    let (tx, rx) = tokio::sync::watch::channel(false);

    let handle = dispatcher(&env, sink.clone(), 3).spawn(Duration::from_millis(5), rx);
    for _ in 0..100 {
        if sink.delivered().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(sink.delivered().len(), 2);
}
