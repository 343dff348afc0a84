//! Request and response types for the mps-daemon HTTP endpoints.
//!
//! No business logic lives here.

use mps_db::Stats;
use mps_runtime::QueueStats;
use mps_schemas::{EntityType, Posting};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

/// Body of every non-2xx admin response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTriggerRequest {
    pub tenant: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub full_sync: bool,
}

/// Returned as soon as the run is scheduled; poll `/v1/sync/runs/{batch_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTriggerResponse {
    pub batch_id: Uuid,
    pub tenant: String,
    pub entity_type: EntityType,
    pub full_sync: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantQuery {
    pub tenant: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunQuery {
    pub tenant: Option<String>,
    pub entity_type: Option<EntityType>,
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Webhooks / outbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookQuery {
    pub tenant: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboxQuery {
    pub status: Option<String>,
    pub aggregate_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Stats / postings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: Stats,
    pub follow_up_queue: Option<QueueStats>,
    pub syncs_in_flight: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperatorActionResponse {
    /// `false` when the action was already in effect.
    pub changed: bool,
    pub posting: Posting,
}
