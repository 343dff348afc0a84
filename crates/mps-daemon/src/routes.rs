//! Axum router and all HTTP handlers for mps-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers only map HTTP to engine calls; no
//! reconciliation logic lives here.

use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use mps_fulfillment::CommandError;
use mps_db::{OutboxFilter, RunFilter, WebhookFilter};
use mps_runtime::{apply_operator, ApplyError, ApplyOutcome, OperatorAction};
use mps_schemas::{EntityType, OutboxStatus, WebhookStatus};
use mps_webhook::{IncomingWebhook, IngestError, HEADER_EVENT_ID, HEADER_EVENT_TYPE, HEADER_SIGNATURE};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;
use uuid::Uuid;

use crate::{
    api_types::{
        ErrorResponse, HealthResponse, LimitQuery, OperatorActionResponse, OutboxQuery, RunQuery,
        StatsResponse, SyncTriggerRequest, SyncTriggerResponse, TenantQuery, WebhookQuery,
    },
    state::{spawn_sync, uptime_secs, AppState, BusMsg},
};

/// Header naming the operator behind an admin action (audit actor).
pub const HEADER_OPERATOR: &str = "X-Operator";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/platform", post(webhook_receive))
        .route("/v1/health", get(health))
        .route("/v1/stream", get(stream))
        .route("/v1/checkpoints", get(checkpoints_list))
        .route("/v1/checkpoints/:tenant/:entity_type/pause", post(checkpoint_pause))
        .route("/v1/checkpoints/:tenant/:entity_type/resume", post(checkpoint_resume))
        .route("/v1/sync/trigger", post(sync_trigger))
        .route("/v1/sync/runs", get(sync_runs_list))
        .route("/v1/sync/runs/:batch_id", get(sync_run_get))
        .route("/v1/webhooks", get(webhooks_list))
        .route("/v1/webhooks/retry/:id", post(webhook_retry))
        .route("/v1/webhooks/recover-stale", post(webhooks_recover_stale))
        .route("/v1/outbox", get(outbox_list))
        .route("/v1/stats", get(stats))
        .route("/v1/postings/:posting_number", get(posting_get))
        .route("/v1/postings/:posting_number/actions", post(posting_action))
        .with_state(state)
}

fn error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: msg.into() })).into_response()
}

fn internal(e: anyhow::Error) -> Response {
    let msg = format!("{e:#}");
    tracing::error!(error = %msg, "admin request failed");
    error(StatusCode::INTERNAL_SERVER_ERROR, msg)
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// POST /webhooks/platform
// ---------------------------------------------------------------------------

/// Inbound platform webhook. `200` once the event is recorded (processed,
/// ignored or duplicate), `500` when handling failed and a redelivery is
/// wanted, 4xx for rejected deliveries.
pub(crate) async fn webhook_receive(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req = IncomingWebhook {
        event_type: header(&headers, HEADER_EVENT_TYPE),
        event_id: header(&headers, HEADER_EVENT_ID),
        signature: header(&headers, HEADER_SIGNATURE),
        body: body.to_vec(),
    };
    match st.ingestor.receive(req).await {
        Ok(resp) => {
            let code = if resp.success {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (code, Json(resp)).into_response()
        }
        Err(e) => ingest_error(e),
    }
}

fn ingest_error(e: IngestError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!(error = %format!("{e:#}"), "webhook ingestion failed");
    }
    error(status, e.to_string())
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
            uptime_secs: uptime_secs(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

pub(crate) async fn checkpoints_list(
    State(st): State<Arc<AppState>>,
    Query(q): Query<TenantQuery>,
) -> Response {
    match st.ctx.store.checkpoint_list(q.tenant.as_deref()).await {
        Ok(list) => (StatusCode::OK, Json(list)).into_response(),
        Err(e) => internal(e),
    }
}

pub(crate) async fn checkpoint_pause(
    State(st): State<Arc<AppState>>,
    Path((tenant, entity_type)): Path<(String, EntityType)>,
) -> Response {
    set_paused(&st, &tenant, entity_type, true).await
}

pub(crate) async fn checkpoint_resume(
    State(st): State<Arc<AppState>>,
    Path((tenant, entity_type)): Path<(String, EntityType)>,
) -> Response {
    set_paused(&st, &tenant, entity_type, false).await
}

async fn set_paused(st: &AppState, tenant: &str, entity_type: EntityType, paused: bool) -> Response {
    if !st.knows_tenant(tenant) {
        return error(StatusCode::NOT_FOUND, format!("unknown tenant '{tenant}'"));
    }
    match st
        .ctx
        .store
        .checkpoint_set_paused(tenant, entity_type, paused, chrono::Utc::now())
        .await
    {
        Ok(cp) => {
            info!(tenant, entity_type = %entity_type, paused, "checkpoint pause toggled");
            (StatusCode::OK, Json(cp)).into_response()
        }
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Schedule a run and return its `batch_id` at once (`202`). `409` while the
/// key is paused or already running.
pub(crate) async fn sync_trigger(
    State(st): State<Arc<AppState>>,
    Json(req): Json<SyncTriggerRequest>,
) -> Response {
    if !st.knows_tenant(&req.tenant) {
        return error(StatusCode::NOT_FOUND, format!("unknown tenant '{}'", req.tenant));
    }
    let cp = match st
        .ctx
        .store
        .checkpoint_load_or_create(&req.tenant, req.entity_type)
        .await
    {
        Ok(cp) => cp,
        Err(e) => return internal(e),
    };
    if cp.is_paused() {
        return error(StatusCode::CONFLICT, "checkpoint is paused");
    }
    let Some(slot) = st.try_begin_sync(&req.tenant, req.entity_type) else {
        return error(StatusCode::CONFLICT, "a sync for this key is already running");
    };

    let batch_id = Uuid::new_v4();
    info!(%batch_id, tenant = %req.tenant, entity_type = %req.entity_type, full_sync = req.full_sync, "sync/trigger");
    spawn_sync(
        Arc::clone(&st),
        slot,
        batch_id,
        req.tenant.clone(),
        req.entity_type,
        req.full_sync,
    );

    (
        StatusCode::ACCEPTED,
        Json(SyncTriggerResponse {
            batch_id,
            tenant: req.tenant,
            entity_type: req.entity_type,
            full_sync: req.full_sync,
        }),
    )
        .into_response()
}

pub(crate) async fn sync_runs_list(
    State(st): State<Arc<AppState>>,
    Query(q): Query<RunQuery>,
) -> Response {
    let filter = RunFilter {
        tenant: q.tenant,
        entity_type: q.entity_type,
        limit: q.limit.unwrap_or(50),
    };
    match st.ctx.store.sync_run_list(&filter).await {
        Ok(runs) => (StatusCode::OK, Json(runs)).into_response(),
        Err(e) => internal(e),
    }
}

pub(crate) async fn sync_run_get(
    State(st): State<Arc<AppState>>,
    Path(batch_id): Path<Uuid>,
) -> Response {
    match st.ctx.store.sync_run_get(batch_id).await {
        Ok(Some(run)) => (StatusCode::OK, Json(run)).into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, format!("sync run {batch_id} not found")),
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

pub(crate) async fn webhooks_list(
    State(st): State<Arc<AppState>>,
    Query(q): Query<WebhookQuery>,
) -> Response {
    let status = match q.status.as_deref().map(WebhookStatus::parse).transpose() {
        Ok(s) => s,
        Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let filter = WebhookFilter {
        tenant: q.tenant,
        status,
        stale_before: None,
        limit: q.limit.unwrap_or(50),
    };
    match st.ctx.store.webhook_list(&filter).await {
        Ok(list) => (StatusCode::OK, Json(list)).into_response(),
        Err(e) => internal(e),
    }
}

pub(crate) async fn webhook_retry(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match st.ingestor.retry(id).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => ingest_error(e),
    }
}

pub(crate) async fn webhooks_recover_stale(
    State(st): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Response {
    match st.ingestor.recover_stale(q.limit.unwrap_or(100)).await {
        Ok(recovered) => (StatusCode::OK, Json(recovered)).into_response(),
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// Outbox / stats
// ---------------------------------------------------------------------------

pub(crate) async fn outbox_list(
    State(st): State<Arc<AppState>>,
    Query(q): Query<OutboxQuery>,
) -> Response {
    let status = match q.status.as_deref().map(OutboxStatus::parse).transpose() {
        Ok(s) => s,
        Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let filter = OutboxFilter {
        status,
        aggregate_id: q.aggregate_id,
        limit: q.limit.unwrap_or(100),
    };
    match st.ctx.store.outbox_list(&filter).await {
        Ok(list) => (StatusCode::OK, Json(list)).into_response(),
        Err(e) => internal(e),
    }
}

pub(crate) async fn stats(State(st): State<Arc<AppState>>, Query(q): Query<TenantQuery>) -> Response {
    match st.ctx.store.stats(q.tenant.as_deref()).await {
        Ok(stats) => (
            StatusCode::OK,
            Json(StatsResponse {
                stats,
                follow_up_queue: st.ingestor.follow_up_stats(),
                syncs_in_flight: st.syncs_in_flight(),
            }),
        )
            .into_response(),
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// Postings
// ---------------------------------------------------------------------------

pub(crate) async fn posting_get(
    State(st): State<Arc<AppState>>,
    Path(posting_number): Path<String>,
) -> Response {
    match st.ctx.store.posting_get(&posting_number).await {
        Ok(Some(p)) => (StatusCode::OK, Json(p)).into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, format!("posting {posting_number} not found")),
        Err(e) => internal(e),
    }
}

/// Operator action. `409` for a command illegal in the current state or a
/// persistent version conflict, `400` for bad input.
pub(crate) async fn posting_action(
    State(st): State<Arc<AppState>>,
    Path(posting_number): Path<String>,
    headers: HeaderMap,
    Json(action): Json<OperatorAction>,
) -> Response {
    let actor = header(&headers, HEADER_OPERATOR)
        .map(|a| format!("operator:{a}"))
        .unwrap_or_else(|| "operator".to_string());

    let changed = match apply_operator(&st.ctx, &posting_number, &action, &actor).await {
        Ok(ApplyOutcome::Unchanged) => false,
        Ok(_) => true,
        Err(e) => return apply_error(e),
    };
    match st.ctx.store.posting_get(&posting_number).await {
        Ok(Some(posting)) => {
            (StatusCode::OK, Json(OperatorActionResponse { changed, posting })).into_response()
        }
        Ok(None) => error(StatusCode::NOT_FOUND, format!("posting {posting_number} not found")),
        Err(e) => internal(e),
    }
}

fn apply_error(e: ApplyError) -> Response {
    match e {
        ApplyError::NotFound(_) => error(StatusCode::NOT_FOUND, e.to_string()),
        ApplyError::Command(CommandError::Invalid(_)) => {
            error(StatusCode::BAD_REQUEST, e.to_string())
        }
        ApplyError::Command(CommandError::Illegal { .. }) | ApplyError::Conflict { .. } => {
            error(StatusCode::CONFLICT, e.to_string())
        }
        ApplyError::Reconcile(_) => error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        ApplyError::Store(inner) => internal(inner),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::SyncFinished(_) => "sync_finished",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
