use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mps_db::{OutboxFilter, RunFilter, Stats, Store, StoreTx, WebhookFilter};
use mps_schemas::{
    Checkpoint, CheckpointStatus, EntityType, NewOutboxEvent, NewWebhookEvent, OutboxEvent,
    OutboxStatus, PageCommit, Posting, SyncRun, WebhookCompletion, WebhookEvent, WebhookStatus,
};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
struct State {
    checkpoints: BTreeMap<(String, EntityType), Checkpoint>,
    runs: Vec<SyncRun>,
    webhooks: Vec<WebhookEvent>,
    postings: BTreeMap<String, Posting>,
    outbox: Vec<OutboxEvent>,
}

/// Countdown switches. Each `fail_*` call arms the next N operations.
#[derive(Debug, Default)]
pub struct Faults {
    commits: AtomicU32,
    outbox_inserts: AtomicU32,
    version_conflicts: AtomicU32,
    checkpoint_commits: AtomicU32,
}

impl Faults {
    pub fn fail_commits(&self, n: u32) {
        self.commits.store(n, Ordering::SeqCst);
    }

    pub fn fail_outbox_inserts(&self, n: u32) {
        self.outbox_inserts.store(n, Ordering::SeqCst);
    }

    /// The next `n` `posting_update` calls report a version conflict.
    pub fn conflict_updates(&self, n: u32) {
        self.version_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn fail_checkpoint_commits(&self, n: u32) {
        self.checkpoint_commits.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory [`Store`].
///
/// A transaction holds the store lock from `begin` until commit or drop and
/// stages its writes on a private copy; only `commit` publishes them.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    pub async fn postings(&self) -> Vec<Posting> {
        self.state.lock().await.postings.values().cloned().collect()
    }

    pub async fn outbox(&self) -> Vec<OutboxEvent> {
        self.state.lock().await.outbox.clone()
    }

    pub async fn webhooks(&self) -> Vec<WebhookEvent> {
        self.state.lock().await.webhooks.clone()
    }

    pub async fn runs(&self) -> Vec<SyncRun> {
        self.state.lock().await.runs.clone()
    }

    pub async fn checkpoint(&self, tenant: &str, entity_type: EntityType) -> Option<Checkpoint> {
        self.state
            .lock()
            .await
            .checkpoints
            .get(&(tenant.to_string(), entity_type))
            .cloned()
    }

    /// Overwrite (or create) a checkpoint row directly.
    pub async fn seed_checkpoint(&self, cp: Checkpoint) {
        self.state
            .lock()
            .await
            .checkpoints
            .insert((cp.tenant.clone(), cp.entity_type), cp);
    }

    /// Put a posting in place as if committed. Version 0 is bumped to 1.
    pub async fn seed_posting(&self, mut p: Posting) {
        if p.version < 1 {
            p.version = 1;
        }
        p.updated_at.get_or_insert_with(Utc::now);
        self.state
            .lock()
            .await
            .postings
            .insert(p.posting_number.clone(), p);
    }

    /// Backdate a webhook row's `updated_at` (stale-processing tests).
    pub async fn touch_webhook(&self, id: Uuid, status: WebhookStatus, updated_at: DateTime<Utc>) {
        let mut st = self.state.lock().await;
        if let Some(w) = st.webhooks.iter_mut().find(|w| w.id == id) {
            w.status = status;
            w.updated_at = updated_at;
        }
    }
}

fn checkpoint_mut<'a>(
    st: &'a mut State,
    tenant: &str,
    entity_type: EntityType,
) -> &'a mut Checkpoint {
    st.checkpoints
        .entry((tenant.to_string(), entity_type))
        .or_insert_with(|| Checkpoint::new(tenant, entity_type))
}

fn clamp(limit: i64) -> usize {
    if limit <= 0 {
        100
    } else {
        limit.min(1000) as usize
    }
}

fn count_by<I: Iterator<Item = String>>(keys: I) -> BTreeMap<String, i64> {
    let mut out = BTreeMap::new();
    for k in keys {
        *out.entry(k).or_insert(0) += 1;
    }
    out
}

#[async_trait]
impl Store for MemStore {
    async fn checkpoint_load_or_create(
        &self,
        tenant: &str,
        entity_type: EntityType,
    ) -> Result<Checkpoint> {
        let mut st = self.state.lock().await;
        Ok(checkpoint_mut(&mut st, tenant, entity_type).clone())
    }

    async fn checkpoint_begin_run(
        &self,
        tenant: &str,
        entity_type: EntityType,
        full_sync: bool,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let mut st = self.state.lock().await;
        let cp = checkpoint_mut(&mut st, tenant, entity_type);
        cp.status = CheckpointStatus::Running;
        cp.last_error = None;
        if full_sync {
            cp.retry_count = 0;
        }
        cp.updated_at = Some(now);
        Ok(cp.clone())
    }

    async fn checkpoint_commit_page(
        &self,
        tenant: &str,
        entity_type: EntityType,
        page: &PageCommit,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if Faults::take(&self.faults.checkpoint_commits) {
            bail!("injected checkpoint commit failure");
        }
        let mut st = self.state.lock().await;
        let cp = st
            .checkpoints
            .get_mut(&(tenant.to_string(), entity_type))
            .ok_or_else(|| anyhow!("checkpoint {tenant}/{entity_type} missing"))?;
        cp.cursor = page.cursor.clone();
        cp.watermark = match (cp.watermark, page.watermark) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        cp.processed += page.processed;
        cp.success += page.success;
        cp.failed += page.failed;
        cp.updated_at = Some(now);
        Ok(())
    }

    async fn checkpoint_finish(
        &self,
        tenant: &str,
        entity_type: EntityType,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut st = self.state.lock().await;
        if let Some(cp) = st.checkpoints.get_mut(&(tenant.to_string(), entity_type)) {
            cp.status = CheckpointStatus::Idle;
            cp.last_sync_at = Some(now);
            cp.last_error = None;
            cp.updated_at = Some(now);
        }
        Ok(())
    }

    async fn checkpoint_fail(
        &self,
        tenant: &str,
        entity_type: EntityType,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut st = self.state.lock().await;
        if let Some(cp) = st.checkpoints.get_mut(&(tenant.to_string(), entity_type)) {
            cp.status = CheckpointStatus::Failed;
            cp.retry_count += 1;
            cp.last_error = Some(error.to_string());
            cp.updated_at = Some(now);
        }
        Ok(())
    }

    async fn checkpoint_set_paused(
        &self,
        tenant: &str,
        entity_type: EntityType,
        paused: bool,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let mut st = self.state.lock().await;
        let cp = checkpoint_mut(&mut st, tenant, entity_type);
        if !cp.config.is_object() {
            cp.config = Value::Object(Default::default());
        }
        if let Some(obj) = cp.config.as_object_mut() {
            obj.insert("paused".to_string(), Value::Bool(paused));
        }
        cp.updated_at = Some(now);
        Ok(cp.clone())
    }

    async fn checkpoint_list(&self, tenant: Option<&str>) -> Result<Vec<Checkpoint>> {
        let st = self.state.lock().await;
        Ok(st
            .checkpoints
            .values()
            .filter(|c| tenant.map_or(true, |t| c.tenant == t))
            .cloned()
            .collect())
    }

    async fn sync_run_insert(&self, run: &SyncRun) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.runs.iter().any(|r| r.batch_id == run.batch_id) {
            bail!("duplicate batch_id {}", run.batch_id);
        }
        st.runs.push(run.clone());
        Ok(())
    }

    async fn sync_run_finalize(&self, run: &SyncRun) -> Result<()> {
        let mut st = self.state.lock().await;
        if let Some(r) = st.runs.iter_mut().find(|r| r.batch_id == run.batch_id) {
            *r = run.clone();
        }
        Ok(())
    }

    async fn sync_run_get(&self, batch_id: Uuid) -> Result<Option<SyncRun>> {
        let st = self.state.lock().await;
        Ok(st.runs.iter().find(|r| r.batch_id == batch_id).cloned())
    }

    async fn sync_run_list(&self, filter: &RunFilter) -> Result<Vec<SyncRun>> {
        let st = self.state.lock().await;
        let mut out: Vec<SyncRun> = st
            .runs
            .iter()
            .filter(|r| filter.tenant.as_deref().map_or(true, |t| r.tenant == t))
            .filter(|r| filter.entity_type.map_or(true, |e| r.entity_type == e))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(clamp(filter.limit));
        Ok(out)
    }

    async fn webhook_insert(&self, ev: &NewWebhookEvent) -> Result<bool> {
        let mut st = self.state.lock().await;
        if st
            .webhooks
            .iter()
            .any(|w| w.idempotency_key == ev.idempotency_key)
        {
            return Ok(false);
        }
        st.webhooks.push(WebhookEvent {
            id: ev.id,
            event_id: ev.event_id.clone(),
            idempotency_key: ev.idempotency_key.clone(),
            event_type: ev.event_type.clone(),
            tenant: ev.tenant.clone(),
            payload: ev.payload.clone(),
            signature: ev.signature.clone(),
            verified: ev.verified,
            status: ev.status,
            retry_count: 0,
            entity_type: None,
            entity_id: None,
            error: None,
            received_at: ev.received_at,
            processed_at: None,
            updated_at: ev.received_at,
        });
        Ok(true)
    }

    async fn webhook_by_key(&self, idempotency_key: &str) -> Result<Option<WebhookEvent>> {
        let st = self.state.lock().await;
        Ok(st
            .webhooks
            .iter()
            .find(|w| w.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn webhook_by_id(&self, id: Uuid) -> Result<Option<WebhookEvent>> {
        let st = self.state.lock().await;
        Ok(st.webhooks.iter().find(|w| w.id == id).cloned())
    }

    async fn webhook_claim(
        &self,
        id: Uuid,
        from: &[WebhookStatus],
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut st = self.state.lock().await;
        let Some(w) = st.webhooks.iter_mut().find(|w| w.id == id) else {
            return Ok(false);
        };
        let stale = w.status == WebhookStatus::Processing && w.updated_at < stale_before;
        if !from.contains(&w.status) && !stale {
            return Ok(false);
        }
        w.status = WebhookStatus::Processing;
        w.updated_at = now;
        Ok(true)
    }

    async fn webhook_finish(&self, id: Uuid, done: &WebhookCompletion) -> Result<()> {
        let mut st = self.state.lock().await;
        if let Some(w) = st.webhooks.iter_mut().find(|w| w.id == id) {
            w.status = done.status;
            if done.entity_type.is_some() {
                w.entity_type = done.entity_type.clone();
            }
            if done.entity_id.is_some() {
                w.entity_id = done.entity_id.clone();
            }
            w.error = done.error.clone();
            w.processed_at = Some(done.finished_at);
            w.updated_at = done.finished_at;
            if done.status == WebhookStatus::Failed {
                w.retry_count += 1;
            }
        }
        Ok(())
    }

    async fn webhook_list(&self, filter: &WebhookFilter) -> Result<Vec<WebhookEvent>> {
        let st = self.state.lock().await;
        let mut out: Vec<WebhookEvent> = st
            .webhooks
            .iter()
            .filter(|w| filter.tenant.as_deref().map_or(true, |t| w.tenant == t))
            .filter(|w| filter.status.map_or(true, |s| w.status == s))
            .filter(|w| {
                filter.stale_before.map_or(true, |before| {
                    w.status == WebhookStatus::Processing && w.updated_at < before
                })
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        out.truncate(clamp(filter.limit));
        Ok(out)
    }

    async fn posting_get(&self, posting_number: &str) -> Result<Option<Posting>> {
        let st = self.state.lock().await;
        Ok(st.postings.get(posting_number).cloned())
    }

    async fn posting_list(&self, tenant: &str, limit: i64) -> Result<Vec<Posting>> {
        let st = self.state.lock().await;
        let mut out: Vec<Posting> = st
            .postings
            .values()
            .filter(|p| p.tenant == tenant)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out.truncate(clamp(limit));
        Ok(out)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let staged = (*guard).clone();
        Ok(Box::new(MemTx {
            guard,
            staged,
            faults: Arc::clone(&self.faults),
        }))
    }

    async fn outbox_claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>> {
        let mut st = self.state.lock().await;
        let mut due: Vec<&mut OutboxEvent> = st
            .outbox
            .iter_mut()
            .filter(|e| e.status == OutboxStatus::Pending && e.next_retry_at <= now)
            .collect();
        due.sort_by_key(|e| e.created_at);
        Ok(due
            .into_iter()
            .take(limit.max(1) as usize)
            .map(|e| {
                e.next_retry_at = lease_until;
                e.clone()
            })
            .collect())
    }

    async fn outbox_mark_sent(&self, event_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut st = self.state.lock().await;
        if let Some(e) = st
            .outbox
            .iter_mut()
            .find(|e| e.event_id == event_id && e.status == OutboxStatus::Pending)
        {
            e.status = OutboxStatus::Sent;
            e.sent_at = Some(now);
            e.last_error = None;
        }
        Ok(())
    }

    async fn outbox_mark_retry(
        &self,
        event_id: Uuid,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let mut st = self.state.lock().await;
        if let Some(e) = st
            .outbox
            .iter_mut()
            .find(|e| e.event_id == event_id && e.status == OutboxStatus::Pending)
        {
            e.retry_count += 1;
            e.next_retry_at = next_retry_at;
            e.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn outbox_mark_failed(&self, event_id: Uuid, error: &str) -> Result<()> {
        let mut st = self.state.lock().await;
        if let Some(e) = st
            .outbox
            .iter_mut()
            .find(|e| e.event_id == event_id && e.status == OutboxStatus::Pending)
        {
            e.status = OutboxStatus::Failed;
            e.retry_count += 1;
            e.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn outbox_list(&self, filter: &OutboxFilter) -> Result<Vec<OutboxEvent>> {
        let st = self.state.lock().await;
        let mut out: Vec<OutboxEvent> = st
            .outbox
            .iter()
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .filter(|e| {
                filter
                    .aggregate_id
                    .as_deref()
                    .map_or(true, |a| e.aggregate_id == a)
            })
            .cloned()
            .collect();
        out.sort_by_key(|e| e.created_at);
        out.truncate(clamp(filter.limit));
        Ok(out)
    }

    async fn stats(&self, tenant: Option<&str>) -> Result<Stats> {
        let st = self.state.lock().await;
        let owns = |t: &str| tenant.map_or(true, |want| t == want);
        Ok(Stats {
            postings_by_operation_status: count_by(
                st.postings
                    .values()
                    .filter(|p| owns(&p.tenant))
                    .map(|p| p.operation_status.as_str().to_string()),
            ),
            webhooks_by_status: count_by(
                st.webhooks
                    .iter()
                    .filter(|w| owns(&w.tenant))
                    .map(|w| w.status.as_str().to_string()),
            ),
            outbox_by_status: count_by(
                st.outbox
                    .iter()
                    .filter(|e| {
                        tenant.is_none()
                            || st
                                .postings
                                .get(&e.aggregate_id)
                                .is_some_and(|p| owns(&p.tenant))
                    })
                    .map(|e| e.status.as_str().to_string()),
            ),
            sync_runs_by_status: count_by(
                st.runs
                    .iter()
                    .filter(|r| owns(&r.tenant))
                    .map(|r| r.status.as_str().to_string()),
            ),
            checkpoints_by_status: count_by(
                st.checkpoints
                    .values()
                    .filter(|c| owns(&c.tenant))
                    .map(|c| c.status.as_str().to_string()),
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

struct MemTx {
    guard: OwnedMutexGuard<State>,
    staged: State,
    faults: Arc<Faults>,
}

#[async_trait]
impl StoreTx for MemTx {
    async fn posting_load(&mut self, posting_number: &str) -> Result<Option<Posting>> {
        Ok(self.staged.postings.get(posting_number).cloned())
    }

    async fn posting_insert(&mut self, posting: &Posting, now: DateTime<Utc>) -> Result<bool> {
        if self.staged.postings.contains_key(&posting.posting_number) {
            return Ok(false);
        }
        let mut p = posting.clone();
        p.version = 1;
        p.updated_at = Some(now);
        self.staged.postings.insert(p.posting_number.clone(), p);
        Ok(true)
    }

    async fn posting_update(
        &mut self,
        posting: &Posting,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if Faults::take(&self.faults.version_conflicts) {
            return Ok(false);
        }
        let Some(current) = self.staged.postings.get_mut(&posting.posting_number) else {
            return Ok(false);
        };
        if current.version != expected_version {
            return Ok(false);
        }
        // Tracking rows are insert-only.
        let mut tracking = current.tracking_numbers.clone();
        for n in &posting.tracking_numbers {
            if !tracking.contains(n) {
                tracking.push(n.clone());
            }
        }
        tracking.sort();

        let mut p = posting.clone();
        p.tracking_numbers = tracking;
        p.version = expected_version + 1;
        p.updated_at = Some(now);
        *current = p;
        Ok(true)
    }

    async fn outbox_insert(&mut self, event: &NewOutboxEvent, now: DateTime<Utc>) -> Result<()> {
        if Faults::take(&self.faults.outbox_inserts) {
            bail!("injected outbox insert failure");
        }
        if self
            .staged
            .outbox
            .iter()
            .any(|e| e.event_id == event.event_id)
        {
            bail!("duplicate outbox event_id {}", event.event_id);
        }
        self.staged.outbox.push(OutboxEvent {
            event_id: event.event_id,
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            next_retry_at: now,
            last_error: None,
            created_at: now,
            sent_at: None,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if Faults::take(&self.faults.commits) {
            bail!("injected commit failure");
        }
        let MemTx {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }
}
