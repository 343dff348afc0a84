//! Scenario: admin and webhook routes against the in-memory engine.
//!
//! Everything runs in-process through `tower::ServiceExt::oneshot`; no DB or
//! network required.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use mps_daemon::{routes, state::AppState};
use mps_schemas::{EntityType, OperationStatus};
use mps_testkit::{snapshot, test_context, TestEnv};
use mps_webhook::{
    sign_body, IngestSettings, TenantDirectory, WebhookIngestor, HEADER_EVENT_ID,
    HEADER_EVENT_TYPE, HEADER_SIGNATURE,
};
use serde_json::{json, Value};
use tower::ServiceExt; // oneshot

const SECRET: &str = "whsec-acme";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn app_state(env: &TestEnv) -> Arc<AppState> {
    let tenants = TenantDirectory::default().with_tenant("acme", &["555"], Some(SECRET));
    let ingestor = WebhookIngestor::new(env.ctx.clone(), tenants, IngestSettings::default());
    Arc::new(AppState::new(
        env.ctx.clone(),
        ingestor,
        vec!["acme".to_string()],
    ))
}

async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

fn get(uri: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

fn webhook(event_type: &str, event_id: &str, body: Value, secret: &str) -> Request<axum::body::Body> {
    let raw = serde_json::to_vec(&body).unwrap();
    Request::builder()
        .method("POST")
        .uri("/webhooks/platform")
        .header(HEADER_EVENT_TYPE, event_type)
        .header(HEADER_EVENT_ID, event_id)
        .header(HEADER_SIGNATURE, sign_body(secret, &raw))
        .body(axum::body::Body::from(raw))
        .unwrap()
}

fn delivered(number: &str) -> Value {
    json!({"posting_number": number, "seller_id": 555, "changed_at": "2024-03-01T12:00:00Z"})
}

async fn seed(env: &TestEnv, number: &str, status: &str) {
    mps_runtime::apply_remote(
        &env.ctx,
        "acme",
        EntityType::PostingFbs,
        &mps_reconcile::RemoteRecord::decode_snapshot(snapshot(number, status)).unwrap(),
        mps_runtime::Cause::Sync,
    )
    .await
    .unwrap();
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_service_name() {
    let env = test_context();
    let (status, body) = call(routes::build_router(app_state(&env)), get("/v1/health")).await;

    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "mps-daemon");
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn webhook_is_processed_then_deduplicated() {
    let env = test_context();
    let st = app_state(&env);

    let (status, body) = call(
        routes::build_router(Arc::clone(&st)),
        webhook("posting.delivered", "evt-1", delivered("X"), SECRET),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["disposition"], "processed");

    let (status, body) = call(
        routes::build_router(Arc::clone(&st)),
        webhook("posting.delivered", "evt-1", delivered("X"), SECRET),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["disposition"], "duplicate");

    assert_eq!(env.store.outbox().await.len(), 1);
}

#[tokio::test]
async fn webhook_with_bad_signature_is_401_and_not_stored() {
    let env = test_context();
    let (status, body) = call(
        routes::build_router(app_state(&env)),
        webhook("posting.delivered", "evt-1", delivered("X"), "wrong-secret"),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(parse_json(body)["error"].is_string());
    assert!(env.store.webhooks().await.is_empty());
}

#[tokio::test]
async fn ping_is_acknowledged() {
    let env = test_context();
    let (status, body) = call(
        routes::build_router(app_state(&env)),
        webhook("ping", "p-1", json!({"seller_id": 555}), SECRET),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["disposition"], "ping");
    assert!(env.store.webhooks().await.is_empty());
}

#[tokio::test]
async fn failed_handling_returns_500_for_redelivery() {
    let env = test_context();
    env.store.faults().fail_commits(1);

    let (status, body) = call(
        routes::build_router(app_state(&env)),
        webhook("posting.delivered", "evt-9", delivered("X"), SECRET),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let json = parse_json(body);
    assert_eq!(json["success"], false);
    assert_eq!(json["disposition"], "failed");
}

#[tokio::test]
async fn webhook_list_and_retry_of_processed_row() {
    let env = test_context();
    let st = app_state(&env);
    call(
        routes::build_router(Arc::clone(&st)),
        webhook("posting.delivered", "evt-1", delivered("X"), SECRET),
    )
    .await;

    let (status, body) = call(
        routes::build_router(Arc::clone(&st)),
        get("/v1/webhooks?tenant=acme&status=processed"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let list = parse_json(body);
    assert_eq!(list.as_array().unwrap().len(), 1);
    let id = list[0]["id"].as_str().unwrap().to_string();

    let (status, _) = call(
        routes::build_router(Arc::clone(&st)),
        post_json(&format!("/v1/webhooks/retry/{id}"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(
        routes::build_router(Arc::clone(&st)),
        get("/v1/webhooks?status=bogus"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sync_trigger_returns_batch_id_and_run_completes() {
    let env = test_context();
    env.gateway
        .push_page(vec![snapshot("1-1", "awaiting_packaging")], Some("c1"), false);
    let st = app_state(&env);

    let (status, body) = call(
        routes::build_router(Arc::clone(&st)),
        post_json(
            "/v1/sync/trigger",
            json!({"tenant": "acme", "entity_type": "posting_fbs"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let batch_id = parse_json(body)["batch_id"].as_str().unwrap().to_string();

    let mut run = Value::Null;
    for _ in 0..100 {
        let (status, body) = call(
            routes::build_router(Arc::clone(&st)),
            get(&format!("/v1/sync/runs/{batch_id}")),
        )
        .await;
        if status == StatusCode::OK {
            run = parse_json(body);
            if run["status"] != "started" {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(run["status"], "success");
    assert_eq!(env.store.postings().await.len(), 1);

    let cp = env
        .store
        .checkpoint("acme", EntityType::PostingFbs)
        .await
        .unwrap();
    assert_eq!(cp.cursor.as_deref(), Some("c1"));
}

#[tokio::test]
async fn sync_trigger_rejects_unknown_tenant() {
    let env = test_context();
    let (status, _) = call(
        routes::build_router(app_state(&env)),
        post_json(
            "/v1/sync/trigger",
            json!({"tenant": "nobody", "entity_type": "posting_fbs"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn paused_checkpoint_refuses_trigger_until_resumed() {
    let env = test_context();
    let st = app_state(&env);

    let (status, body) = call(
        routes::build_router(Arc::clone(&st)),
        post_json("/v1/checkpoints/acme/posting_fbs/pause", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["config"]["paused"], true);

    let trigger = || {
        post_json(
            "/v1/sync/trigger",
            json!({"tenant": "acme", "entity_type": "posting_fbs"}),
        )
    };
    let (status, _) = call(routes::build_router(Arc::clone(&st)), trigger()).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(
        routes::build_router(Arc::clone(&st)),
        post_json("/v1/checkpoints/acme/posting_fbs/resume", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    env.gateway.push_page(vec![], None, false);
    let (status, _) = call(routes::build_router(Arc::clone(&st)), trigger()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn second_trigger_while_running_is_409() {
    let env = test_context();
    let st = app_state(&env);
    let _slot = st
        .try_begin_sync("acme", EntityType::PostingFbs)
        .expect("slot free");

    let (status, body) = call(
        routes::build_router(Arc::clone(&st)),
        post_json(
            "/v1/sync/trigger",
            json!({"tenant": "acme", "entity_type": "posting_fbs"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(parse_json(body)["error"]
        .as_str()
        .unwrap()
        .contains("already running"));

    let (_, body) = call(routes::build_router(Arc::clone(&st)), get("/v1/stats")).await;
    assert_eq!(parse_json(body)["syncs_in_flight"], json!(["acme/posting_fbs"]));
}

// ---------------------------------------------------------------------------
// Postings
// ---------------------------------------------------------------------------

#[tokio::test]
async fn posting_get_and_unknown_posting() {
    let env = test_context();
    seed(&env, "1-1", "awaiting_packaging").await;
    let st = app_state(&env);

    let (status, body) = call(routes::build_router(Arc::clone(&st)), get("/v1/postings/1-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["posting_number"], "1-1");

    let (status, _) = call(routes::build_router(Arc::clone(&st)), get("/v1/postings/9-9")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn operator_actions_map_errors_to_status_codes() {
    let env = test_context();
    seed(&env, "1-1", "awaiting_packaging").await;
    let st = app_state(&env);

    let req = Request::builder()
        .method("POST")
        .uri("/v1/postings/1-1/actions")
        .header("content-type", "application/json")
        .header(routes::HEADER_OPERATOR, "alice")
        .body(axum::body::Body::from(
            json!({"action": "prepare_stock"}).to_string(),
        ))
        .unwrap();
    let (status, body) = call(routes::build_router(Arc::clone(&st)), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["changed"], true);
    assert_eq!(
        env.store.postings().await[0].operation_status,
        OperationStatus::Allocated
    );
    assert_eq!(env.audit.records().last().unwrap().actor, "operator:alice");

    let (status, _) = call(
        routes::build_router(Arc::clone(&st)),
        post_json("/v1/postings/1-1/actions", json!({"action": "mark_printed"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(
        routes::build_router(Arc::clone(&st)),
        post_json(
            "/v1/postings/1-1/actions",
            json!({"action": "set_purchase_price", "price": "-1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        routes::build_router(Arc::clone(&st)),
        post_json("/v1/postings/9-9/actions", json!({"action": "discard"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Outbox / stats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outbox_and_stats_reflect_committed_mutations() {
    let env = test_context();
    seed(&env, "1-1", "awaiting_packaging").await;
    let st = app_state(&env);

    let (status, body) = call(
        routes::build_router(Arc::clone(&st)),
        get("/v1/outbox?status=pending&aggregate_id=1-1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rows = parse_json(body);
    assert_eq!(rows.as_array().unwrap().len(), 1);
    assert_eq!(rows[0]["event_type"], "posting.created");

    let (status, body) = call(routes::build_router(Arc::clone(&st)), get("/v1/stats?tenant=acme")).await;
    assert_eq!(status, StatusCode::OK);
    let stats = parse_json(body);
    assert_eq!(stats["outbox_by_status"]["pending"], 1);
    assert!(stats["follow_up_queue"].is_null());
}
