use std::sync::Arc;
use std::time::Duration;

use mps_runtime::{fetch_and_apply, ApplyOutcome, FollowUpJob, GatewayError, WorkQueue};
use mps_schemas::{EntityType, OperationStatus};
use mps_testkit::{snapshot, test_context};

fn job(number: &str) -> FollowUpJob {
    FollowUpJob {
        tenant: "acme".into(),
        entity_type: EntityType::PostingFbs,
        posting_number: number.into(),
        webhook_id: None,
    }
}

#[tokio::test]
async fn fetches_full_posting_and_applies_it() {
    let env = test_context();
    env.gateway.put_posting(snapshot("7-1", "delivered"));

    let out = fetch_and_apply(&env.ctx, &job("7-1")).await.unwrap();
    let p = out.posting().unwrap();
    assert_eq!(p.operation_status, OperationStatus::Delivered);
    assert_eq!(env.gateway.fetched(), vec!["7-1".to_string()]);

    let outbox = env.store.outbox().await;
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].payload["cause"], "follow_up");
}

#[tokio::test]
async fn unknown_remote_posting_is_a_noop() {
    let env = test_context();
    let out = fetch_and_apply(&env.ctx, &job("404-1")).await.unwrap();
    assert_eq!(out, ApplyOutcome::Unchanged);
    assert!(env.store.postings().await.is_empty());
}

#[tokio::test]
async fn slow_remote_times_out() {
    let env = mps_testkit::test_context_with(mps_runtime::EngineSettings {
        fetch_timeout: Duration::from_millis(10),
        fetch_retry: mps_runtime::RetryPolicy::none(),
        ..mps_testkit::fast_settings()
    });
    env.gateway.put_posting(snapshot("7-1", "delivered"));
    env.gateway.set_delay(Duration::from_millis(200));

    let err = fetch_and_apply(&env.ctx, &job("7-1")).await.unwrap_err();
    let root = err.downcast_ref::<GatewayError>().unwrap();
    assert!(matches!(root, GatewayError::Timeout(_)));
    assert!(env.store.postings().await.is_empty());
}

#[tokio::test]
async fn queue_workers_run_follow_ups_and_count_results() {
    let env = test_context();
    env.gateway.put_posting(snapshot("7-1", "delivered"));
    env.gateway.put_posting(snapshot("7-2", "awaiting_packaging"));
    let ctx = Arc::new(env.ctx.clone());

    let queue = WorkQueue::spawn("follow-up", 8, 2, move |j: FollowUpJob| {
        let ctx = Arc::clone(&ctx);
        async move { fetch_and_apply(&ctx, &j).await.map(|_| ()) }
    });
    queue.try_enqueue(job("7-1")).unwrap();
    queue.try_enqueue(job("7-2")).unwrap();
    queue.try_enqueue(job("7-3")).unwrap();

    let stats_before = queue.stats();
    assert_eq!(stats_before.enqueued, 3);
    queue.shutdown().await;

    let mut numbers: Vec<String> = env
        .store
        .postings()
        .await
        .into_iter()
        .map(|p| p.posting_number)
        .collect();
    numbers.sort();
    assert_eq!(numbers, vec!["7-1", "7-2"]);
}
