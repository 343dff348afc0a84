use std::time::Duration;

use chrono::{TimeZone, Utc};
use httpmock::prelude::*;
use mps_platform::{HttpSink, PlatformGateway};
use mps_runtime::{DeliveryError, GatewayError, OutboxSink, PullRequest, RemoteGateway};
use mps_schemas::{EntityType, OutboxEvent, OutboxStatus};
use serde_json::json;
use uuid::Uuid;

fn gateway(server: &MockServer) -> PlatformGateway {
    PlatformGateway::new(
        server.base_url(),
        "cid".to_string(),
        "key".to_string(),
        Duration::from_secs(5),
    )
    .unwrap()
}

fn pull_req(cursor: Option<&str>) -> PullRequest {
    PullRequest {
        tenant: "acme".to_string(),
        entity_type: EntityType::PostingFbs,
        cursor: cursor.map(str::to_string),
        since: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        to: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        page_size: 2,
    }
}

#[tokio::test]
async fn pull_sends_window_cursor_and_credentials() {
    let server = MockServer::start_async().await;
    let m = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v3/posting/fbs/list")
                .header("Client-Id", "cid")
                .header("Api-Key", "key")
                .header("X-Tenant", "acme")
                .json_body_partial(
                    r#"{"filter":{"since":"2024-01-01T00:00:00Z","to":"2024-01-02T00:00:00Z"},"limit":2,"last_id":"page-5"}"#,
                );
            then.status(200).json_body(json!({
                "result": {
                    "postings": [{"posting_number": "1-1"}, {"posting_number": "1-2"}],
                    "has_next": true,
                    "last_id": "page-6"
                }
            }));
        })
        .await;

    let page = gateway(&server).pull(&pull_req(Some("page-5"))).await.unwrap();
    m.assert_async().await;
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.next_cursor.as_deref(), Some("page-6"));
    assert!(page.has_more);
}

#[tokio::test]
async fn pull_maps_status_codes_to_retry_classes() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v3/posting/fbs/list");
            then.status(429).header("Retry-After", "3").body("slow down");
        })
        .await;
    let err = gateway(&server).pull(&pull_req(None)).await.unwrap_err();
    assert_eq!(
        err,
        GatewayError::RateLimited {
            retry_after: Some(Duration::from_secs(3))
        }
    );
    assert!(err.is_retryable());

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v3/posting/fbs/list");
            then.status(503).body("maintenance");
        })
        .await;
    let err = gateway(&server).pull(&pull_req(None)).await.unwrap_err();
    assert!(matches!(err, GatewayError::Server { status: 503, .. }));
    assert!(err.is_retryable());

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v3/posting/fbs/list");
            then.status(403).body("bad key");
        })
        .await;
    let err = gateway(&server).pull(&pull_req(None)).await.unwrap_err();
    assert!(matches!(err, GatewayError::Rejected { status: 403, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn fetch_posting_returns_none_on_404() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v3/posting/fbo/get")
                .json_body(json!({"posting_number": "9-9"}));
            then.status(404);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v3/posting/fbo/get")
                .json_body(json!({"posting_number": "1-1"}));
            then.status(200)
                .json_body(json!({"result": {"posting_number": "1-1", "status": "delivered"}}));
        })
        .await;

    let gw = gateway(&server);
    let missing = gw
        .fetch_posting("acme", EntityType::PostingFbo, "9-9")
        .await
        .unwrap();
    assert!(missing.is_none());

    let found = gw
        .fetch_posting("acme", EntityType::PostingFbo, "1-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found["status"], "delivered");
}

fn outbox_event() -> OutboxEvent {
    OutboxEvent {
        event_id: Uuid::new_v4(),
        aggregate_type: "posting".to_string(),
        aggregate_id: "1-1".to_string(),
        event_type: "posting.status_changed".to_string(),
        payload: json!({"posting_number": "1-1"}),
        status: OutboxStatus::Pending,
        retry_count: 0,
        next_retry_at: Utc::now(),
        last_error: None,
        created_at: Utc::now(),
        sent_at: None,
    }
}

#[tokio::test]
async fn http_sink_sends_event_id_header() {
    let server = MockServer::start_async().await;
    let ev = outbox_event();
    let id = ev.event_id.to_string();
    let m = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/events")
                .header("X-Event-Id", id.as_str())
                .json_body_partial(r#"{"aggregate_id":"1-1","event_type":"posting.status_changed"}"#);
            then.status(202);
        })
        .await;

    let sink = HttpSink::new(server.url("/events"), Duration::from_secs(5)).unwrap();
    sink.deliver(&ev).await.unwrap();
    m.assert_async().await;
}

#[tokio::test]
async fn http_sink_separates_retryable_from_permanent() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/flaky");
            then.status(502);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/strict");
            then.status(422).body("schema mismatch");
        })
        .await;

    let ev = outbox_event();
    let flaky = HttpSink::new(server.url("/flaky"), Duration::from_secs(5)).unwrap();
    assert!(matches!(
        flaky.deliver(&ev).await,
        Err(DeliveryError::Retryable(_))
    ));

    let strict = HttpSink::new(server.url("/strict"), Duration::from_secs(5)).unwrap();
    match strict.deliver(&ev).await {
        Err(DeliveryError::Permanent(msg)) => assert!(msg.contains("422")),
        other => panic!("expected permanent failure, got {other:?}"),
    }
}
