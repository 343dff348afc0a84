use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mps_schemas::{
    Checkpoint, EntityType, NewOutboxEvent, NewWebhookEvent, OutboxEvent, OutboxStatus,
    PageCommit, Posting, SyncRun, WebhookCompletion, WebhookEvent, WebhookStatus,
};
use serde::Serialize;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Query filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub tenant: Option<String>,
    pub entity_type: Option<EntityType>,
    pub limit: i64,
}

#[derive(Debug, Clone, Default)]
pub struct WebhookFilter {
    pub tenant: Option<String>,
    pub status: Option<WebhookStatus>,
    /// Only `processing` rows not touched since this instant.
    pub stale_before: Option<DateTime<Utc>>,
    pub limit: i64,
}

#[derive(Debug, Clone, Default)]
pub struct OutboxFilter {
    pub status: Option<OutboxStatus>,
    pub aggregate_id: Option<String>,
    pub limit: i64,
}

pub(crate) fn clamp_limit(limit: i64) -> i64 {
    if limit <= 0 {
        100
    } else {
        limit.min(1000)
    }
}

/// Row counts grouped by status, per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub postings_by_operation_status: BTreeMap<String, i64>,
    pub webhooks_by_status: BTreeMap<String, i64>,
    pub outbox_by_status: BTreeMap<String, i64>,
    pub sync_runs_by_status: BTreeMap<String, i64>,
    pub checkpoints_by_status: BTreeMap<String, i64>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Persistence boundary shared by the sync engine, the webhook ingestor, the
/// outbox dispatcher and the admin surface.
///
/// Every method is its own short transaction except the posting mutations,
/// which go through [`Store::begin`] so the posting write and its outbox row
/// commit together.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- checkpoints --------------------------------------------------------

    async fn checkpoint_load_or_create(
        &self,
        tenant: &str,
        entity_type: EntityType,
    ) -> Result<Checkpoint>;

    /// Mark the key `running` and clear the last error. A full sync also resets
    /// `retry_count`.
    async fn checkpoint_begin_run(
        &self,
        tenant: &str,
        entity_type: EntityType,
        full_sync: bool,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint>;

    /// Persist the cursor and counters after a fully applied page. The
    /// watermark never moves backwards.
    async fn checkpoint_commit_page(
        &self,
        tenant: &str,
        entity_type: EntityType,
        page: &PageCommit,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// `running → idle`, stamping `last_sync_at`.
    async fn checkpoint_finish(
        &self,
        tenant: &str,
        entity_type: EntityType,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// `running → failed`. Cursor is left as last committed.
    async fn checkpoint_fail(
        &self,
        tenant: &str,
        entity_type: EntityType,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn checkpoint_set_paused(
        &self,
        tenant: &str,
        entity_type: EntityType,
        paused: bool,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint>;

    async fn checkpoint_list(&self, tenant: Option<&str>) -> Result<Vec<Checkpoint>>;

    // ---- sync runs ----------------------------------------------------------

    async fn sync_run_insert(&self, run: &SyncRun) -> Result<()>;

    async fn sync_run_finalize(&self, run: &SyncRun) -> Result<()>;

    async fn sync_run_get(&self, batch_id: Uuid) -> Result<Option<SyncRun>>;

    /// Newest first.
    async fn sync_run_list(&self, filter: &RunFilter) -> Result<Vec<SyncRun>>;

    // ---- webhook inbox ------------------------------------------------------

    /// Insert unless the idempotency key already exists. Returns `true` if the
    /// row was inserted.
    async fn webhook_insert(&self, event: &NewWebhookEvent) -> Result<bool>;

    async fn webhook_by_key(&self, idempotency_key: &str) -> Result<Option<WebhookEvent>>;

    async fn webhook_by_id(&self, id: Uuid) -> Result<Option<WebhookEvent>>;

    /// Move the row to `processing` if its status is one of `from`, or if it
    /// is a `processing` row last touched before `stale_before`. Returns
    /// `true` when this caller won the claim.
    async fn webhook_claim(
        &self,
        id: Uuid,
        from: &[WebhookStatus],
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Write the terminal outcome. A `failed` completion bumps `retry_count`.
    async fn webhook_finish(&self, id: Uuid, done: &WebhookCompletion) -> Result<()>;

    /// Newest first.
    async fn webhook_list(&self, filter: &WebhookFilter) -> Result<Vec<WebhookEvent>>;

    // ---- postings -----------------------------------------------------------

    async fn posting_get(&self, posting_number: &str) -> Result<Option<Posting>>;

    async fn posting_list(&self, tenant: &str, limit: i64) -> Result<Vec<Posting>>;

    /// Start a unit of work for one posting mutation. Dropping the returned
    /// handle without calling [`StoreTx::commit`] rolls everything back.
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    // ---- outbox -------------------------------------------------------------

    /// Lease up to `limit` due `pending` rows by pushing their
    /// `next_retry_at` to `lease_until`. A crashed dispatcher's lease simply
    /// expires.
    async fn outbox_claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>>;

    async fn outbox_mark_sent(&self, event_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    async fn outbox_mark_retry(
        &self,
        event_id: Uuid,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()>;

    async fn outbox_mark_failed(&self, event_id: Uuid, error: &str) -> Result<()>;

    /// Oldest first.
    async fn outbox_list(&self, filter: &OutboxFilter) -> Result<Vec<OutboxEvent>>;

    // ---- stats --------------------------------------------------------------

    async fn stats(&self, tenant: Option<&str>) -> Result<Stats>;
}

/// One posting mutation and its outbox row.
#[async_trait]
pub trait StoreTx: Send {
    async fn posting_load(&mut self, posting_number: &str) -> Result<Option<Posting>>;

    /// Insert a new posting at version 1. Returns `false` if the posting
    /// number already exists (a concurrent writer got there first).
    async fn posting_insert(&mut self, posting: &Posting, now: DateTime<Utc>) -> Result<bool>;

    /// Write `posting` if the stored version still equals `expected_version`,
    /// bumping it by one. Returns `false` on a version conflict.
    async fn posting_update(
        &mut self,
        posting: &Posting,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn outbox_insert(&mut self, event: &NewOutboxEvent, now: DateTime<Utc>) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
