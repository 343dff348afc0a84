//! Shared runtime state for mps-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. Everything here is
//! cheap to clone; the engine itself lives behind [`EngineContext`].

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mps_runtime::{EngineContext, SyncEngine, SyncOutcome, SyncReport};
use mps_schemas::EntityType;
use mps_webhook::WebhookIngestor;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BusMsg: SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    SyncFinished(SyncReport),
    LogLine { level: String, msg: String },
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

type SyncKey = (String, EntityType);

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub ctx: EngineContext,
    pub ingestor: Arc<WebhookIngestor>,
    pub sync: SyncEngine,
    /// Tenants the admin surface accepts. Empty = no restriction.
    pub tenants: Arc<Vec<String>>,
    in_flight: Arc<Mutex<BTreeSet<SyncKey>>>,
}

impl AppState {
    pub fn new(ctx: EngineContext, ingestor: WebhookIngestor, tenants: Vec<String>) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            bus,
            build: BuildInfo {
                service: "mps-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            sync: SyncEngine::new(ctx.clone()),
            ctx,
            ingestor: Arc::new(ingestor),
            tenants: Arc::new(tenants),
            in_flight: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn knows_tenant(&self, tenant: &str) -> bool {
        self.tenants.is_empty() || self.tenants.iter().any(|t| t == tenant)
    }

    /// Reserve the single sync slot of `(tenant, entity_type)`. `None` while
    /// another run holds it; the slot is released when the guard drops.
    pub fn try_begin_sync(&self, tenant: &str, entity_type: EntityType) -> Option<SyncSlot> {
        let key = (tenant.to_string(), entity_type);
        if !lock(&self.in_flight).insert(key.clone()) {
            return None;
        }
        Some(SyncSlot {
            set: Arc::clone(&self.in_flight),
            key,
        })
    }

    /// Keys with a run in flight, as `tenant/entity_type`.
    pub fn syncs_in_flight(&self) -> Vec<String> {
        lock(&self.in_flight)
            .iter()
            .map(|(t, e)| format!("{t}/{e}"))
            .collect()
    }
}

/// Held by a running sync task.
pub struct SyncSlot {
    set: Arc<Mutex<BTreeSet<SyncKey>>>,
    key: SyncKey,
}

impl Drop for SyncSlot {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.key);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Run one sync in the background, holding `slot` until it finishes.
pub fn spawn_sync(
    state: Arc<AppState>,
    slot: SyncSlot,
    batch_id: Uuid,
    tenant: String,
    entity_type: EntityType,
    full_sync: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _slot = slot;
        match state
            .sync
            .run(batch_id, &tenant, entity_type, full_sync, None)
            .await
        {
            Ok(SyncOutcome::Finished(report)) => {
                let _ = state.bus.send(BusMsg::SyncFinished(report));
            }
            Ok(SyncOutcome::Paused) => {
                tracing::info!(%batch_id, tenant = %tenant, entity_type = %entity_type, "triggered sync found checkpoint paused");
            }
            Err(e) => {
                let msg = format!("{e:#}");
                tracing::error!(%batch_id, tenant = %tenant, entity_type = %entity_type, error = %msg, "sync aborted");
                let _ = state.bus.send(BusMsg::LogLine {
                    level: "ERROR".to_string(),
                    msg: format!("sync {batch_id} aborted: {msg}"),
                });
            }
        }
    })
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}
