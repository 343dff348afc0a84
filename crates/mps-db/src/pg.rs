//! Postgres implementation of [`Store`].
//!
//! Runtime-checked queries only (no `query!` macros) so the crate builds
//! without a live database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mps_schemas::{
    Checkpoint, CheckpointStatus, EntityType, NewOutboxEvent, NewWebhookEvent, OperationStatus,
    OutboxEvent, OutboxStatus, PageCommit, Posting, SyncCounts, SyncRun, SyncRunStatus,
    WebhookCompletion, WebhookEvent, WebhookStatus,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::store::{clamp_limit, OutboxFilter, RunFilter, Stats, Store, StoreTx, WebhookFilter};

const CHECKPOINT_COLS: &str = "tenant, entity_type, cursor, watermark, status, processed, success, failed, \
     retry_count, config, last_sync_at, last_error, updated_at";

const SYNC_RUN_COLS: &str = "batch_id, tenant, entity_type, full_sync, status, processed, success, failed, \
     skipped, started_at, finished_at, duration_ms, error";

const WEBHOOK_COLS: &str = "id, event_id, idempotency_key, event_type, tenant, payload, signature, verified, \
     status, retry_count, entity_type, entity_id, error, received_at, processed_at, updated_at";

const OUTBOX_COLS: &str = "event_id, aggregate_type, aggregate_id, event_type, payload, status, retry_count, \
     next_retry_at, last_error, created_at, sent_at";

const POSTING_SELECT: &str = r#"
    select p.posting_number, p.tenant, p.entity_type,
           p.remote_status, p.remote_substatus, p.in_process_at, p.shipment_date,
           p.delivering_date, p.delivered_at, p.cancel_reason, p.remote_tracking_number,
           p.raw_snapshot,
           p.operation_status, p.purchase_price_micros, p.notes, p.printed, p.stock_deducted,
           p.has_tracking, p.total_price_micros, p.skus,
           p.version, p.updated_at,
           coalesce(
             (select array_agg(t.tracking_number order by t.tracking_number collate "C")
                from tracking_numbers t
               where t.posting_number = p.posting_number),
             '{}'::text[]
           ) as tracking_numbers
      from postings p
"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn checkpoint_from_row(row: &PgRow) -> Result<Checkpoint> {
    let entity: String = row.try_get("entity_type")?;
    let status: String = row.try_get("status")?;
    Ok(Checkpoint {
        tenant: row.try_get("tenant")?,
        entity_type: EntityType::parse(&entity)?,
        cursor: row.try_get("cursor")?,
        watermark: row.try_get("watermark")?,
        status: CheckpointStatus::parse(&status)?,
        processed: row.try_get("processed")?,
        success: row.try_get("success")?,
        failed: row.try_get("failed")?,
        retry_count: row.try_get("retry_count")?,
        config: row.try_get("config")?,
        last_sync_at: row.try_get("last_sync_at")?,
        last_error: row.try_get("last_error")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn sync_run_from_row(row: &PgRow) -> Result<SyncRun> {
    let entity: String = row.try_get("entity_type")?;
    let status: String = row.try_get("status")?;
    Ok(SyncRun {
        batch_id: row.try_get("batch_id")?,
        tenant: row.try_get("tenant")?,
        entity_type: EntityType::parse(&entity)?,
        full_sync: row.try_get("full_sync")?,
        status: SyncRunStatus::parse(&status)?,
        counts: SyncCounts {
            processed: row.try_get("processed")?,
            success: row.try_get("success")?,
            failed: row.try_get("failed")?,
            skipped: row.try_get("skipped")?,
        },
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: row.try_get("duration_ms")?,
        error: row.try_get("error")?,
    })
}

fn webhook_from_row(row: &PgRow) -> Result<WebhookEvent> {
    let status: String = row.try_get("status")?;
    Ok(WebhookEvent {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        event_type: row.try_get("event_type")?,
        tenant: row.try_get("tenant")?,
        payload: row.try_get("payload")?,
        signature: row.try_get("signature")?,
        verified: row.try_get("verified")?,
        status: WebhookStatus::parse(&status)?,
        retry_count: row.try_get("retry_count")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        error: row.try_get("error")?,
        received_at: row.try_get("received_at")?,
        processed_at: row.try_get("processed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxEvent> {
    let status: String = row.try_get("status")?;
    Ok(OutboxEvent {
        event_id: row.try_get("event_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        status: OutboxStatus::parse(&status)?,
        retry_count: row.try_get("retry_count")?,
        next_retry_at: row.try_get("next_retry_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
    })
}

fn posting_from_row(row: &PgRow) -> Result<Posting> {
    let entity: String = row.try_get("entity_type")?;
    let op: String = row.try_get("operation_status")?;
    let mut posting = Posting {
        tenant: row.try_get("tenant")?,
        posting_number: row.try_get("posting_number")?,
        entity_type: EntityType::parse(&entity)?,
        remote_status: row.try_get("remote_status")?,
        remote_substatus: row.try_get("remote_substatus")?,
        in_process_at: row.try_get("in_process_at")?,
        shipment_date: row.try_get("shipment_date")?,
        delivering_date: row.try_get("delivering_date")?,
        delivered_at: row.try_get("delivered_at")?,
        cancel_reason: row.try_get("cancel_reason")?,
        remote_tracking_number: row.try_get("remote_tracking_number")?,
        raw_snapshot: row.try_get("raw_snapshot")?,
        operation_status: OperationStatus::parse(&op)?,
        purchase_price_micros: row.try_get("purchase_price_micros")?,
        notes: row.try_get("notes")?,
        printed: row.try_get("printed")?,
        stock_deducted: row.try_get("stock_deducted")?,
        has_tracking: row.try_get("has_tracking")?,
        total_price_micros: row.try_get("total_price_micros")?,
        skus: row.try_get("skus")?,
        tracking_numbers: row.try_get("tracking_numbers")?,
        version: row.try_get("version")?,
        updated_at: row.try_get("updated_at")?,
    };
    posting.normalize_tracking_numbers();
    Ok(posting)
}

async fn grouped_counts(
    pool: &PgPool,
    sql: &str,
    tenant: Option<&str>,
) -> Result<std::collections::BTreeMap<String, i64>> {
    let rows = sqlx::query(sql)
        .bind(tenant)
        .fetch_all(pool)
        .await
        .context("stats query failed")?;
    let mut out = std::collections::BTreeMap::new();
    for row in rows {
        let k: String = row.try_get("k")?;
        let n: i64 = row.try_get("n")?;
        out.insert(k, n);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Store for PgStore {
    async fn checkpoint_load_or_create(
        &self,
        tenant: &str,
        entity_type: EntityType,
    ) -> Result<Checkpoint> {
        sqlx::query(
            r#"
            insert into checkpoints (tenant, entity_type)
            values ($1, $2)
            on conflict (tenant, entity_type) do nothing
            "#,
        )
        .bind(tenant)
        .bind(entity_type.as_str())
        .execute(&self.pool)
        .await
        .context("checkpoint insert failed")?;

        let row = sqlx::query(&format!(
            "select {CHECKPOINT_COLS} from checkpoints where tenant = $1 and entity_type = $2"
        ))
        .bind(tenant)
        .bind(entity_type.as_str())
        .fetch_one(&self.pool)
        .await
        .context("checkpoint load failed")?;

        checkpoint_from_row(&row)
    }

    async fn checkpoint_begin_run(
        &self,
        tenant: &str,
        entity_type: EntityType,
        full_sync: bool,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let row = sqlx::query(&format!(
            r#"
            insert into checkpoints (tenant, entity_type, status, updated_at)
            values ($1, $2, 'running', $3)
            on conflict (tenant, entity_type) do update set
              status = 'running',
              last_error = null,
              retry_count = case when $4 then 0 else checkpoints.retry_count end,
              updated_at = $3
            returning {CHECKPOINT_COLS}
            "#
        ))
        .bind(tenant)
        .bind(entity_type.as_str())
        .bind(now)
        .bind(full_sync)
        .fetch_one(&self.pool)
        .await
        .context("checkpoint_begin_run failed")?;

        checkpoint_from_row(&row)
    }

    async fn checkpoint_commit_page(
        &self,
        tenant: &str,
        entity_type: EntityType,
        page: &PageCommit,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            update checkpoints set
              cursor = $3,
              watermark = greatest(watermark, $4),
              processed = processed + $5,
              success = success + $6,
              failed = failed + $7,
              updated_at = $8
            where tenant = $1 and entity_type = $2
            "#,
        )
        .bind(tenant)
        .bind(entity_type.as_str())
        .bind(&page.cursor)
        .bind(page.watermark)
        .bind(page.processed)
        .bind(page.success)
        .bind(page.failed)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("checkpoint_commit_page failed")?;
        Ok(())
    }

    async fn checkpoint_finish(
        &self,
        tenant: &str,
        entity_type: EntityType,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            update checkpoints set
              status = 'idle', last_sync_at = $3, last_error = null, updated_at = $3
            where tenant = $1 and entity_type = $2
            "#,
        )
        .bind(tenant)
        .bind(entity_type.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .context("checkpoint_finish failed")?;
        Ok(())
    }

    async fn checkpoint_fail(
        &self,
        tenant: &str,
        entity_type: EntityType,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            update checkpoints set
              status = 'failed', retry_count = retry_count + 1, last_error = $3, updated_at = $4
            where tenant = $1 and entity_type = $2
            "#,
        )
        .bind(tenant)
        .bind(entity_type.as_str())
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("checkpoint_fail failed")?;
        Ok(())
    }

    async fn checkpoint_set_paused(
        &self,
        tenant: &str,
        entity_type: EntityType,
        paused: bool,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let row = sqlx::query(&format!(
            r#"
            insert into checkpoints (tenant, entity_type, config, updated_at)
            values ($1, $2, jsonb_build_object('paused', $3::boolean), $4)
            on conflict (tenant, entity_type) do update set
              config = jsonb_set(checkpoints.config, '{{paused}}', to_jsonb($3::boolean), true),
              updated_at = $4
            returning {CHECKPOINT_COLS}
            "#
        ))
        .bind(tenant)
        .bind(entity_type.as_str())
        .bind(paused)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("checkpoint_set_paused failed")?;

        checkpoint_from_row(&row)
    }

    async fn checkpoint_list(&self, tenant: Option<&str>) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(&format!(
            r#"
            select {CHECKPOINT_COLS} from checkpoints
            where ($1::text is null or tenant = $1)
            order by tenant, entity_type
            "#
        ))
        .bind(tenant)
        .fetch_all(&self.pool)
        .await
        .context("checkpoint_list failed")?;

        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn sync_run_insert(&self, run: &SyncRun) -> Result<()> {
        sqlx::query(
            r#"
            insert into sync_runs (
              batch_id, tenant, entity_type, full_sync, status, started_at
            ) values ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.batch_id)
        .bind(&run.tenant)
        .bind(run.entity_type.as_str())
        .bind(run.full_sync)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&self.pool)
        .await
        .context("sync_run_insert failed")?;
        Ok(())
    }

    async fn sync_run_finalize(&self, run: &SyncRun) -> Result<()> {
        sqlx::query(
            r#"
            update sync_runs set
              status = $2, processed = $3, success = $4, failed = $5, skipped = $6,
              finished_at = $7, duration_ms = $8, error = $9
            where batch_id = $1
            "#,
        )
        .bind(run.batch_id)
        .bind(run.status.as_str())
        .bind(run.counts.processed)
        .bind(run.counts.success)
        .bind(run.counts.failed)
        .bind(run.counts.skipped)
        .bind(run.finished_at)
        .bind(run.duration_ms)
        .bind(&run.error)
        .execute(&self.pool)
        .await
        .context("sync_run_finalize failed")?;
        Ok(())
    }

    async fn sync_run_get(&self, batch_id: Uuid) -> Result<Option<SyncRun>> {
        let row = sqlx::query(&format!(
            "select {SYNC_RUN_COLS} from sync_runs where batch_id = $1"
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .context("sync_run_get failed")?;

        row.as_ref().map(sync_run_from_row).transpose()
    }

    async fn sync_run_list(&self, filter: &RunFilter) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(&format!(
            r#"
            select {SYNC_RUN_COLS} from sync_runs
            where ($1::text is null or tenant = $1)
              and ($2::text is null or entity_type = $2)
            order by started_at desc
            limit $3
            "#
        ))
        .bind(filter.tenant.as_deref())
        .bind(filter.entity_type.map(|e| e.as_str()))
        .bind(clamp_limit(filter.limit))
        .fetch_all(&self.pool)
        .await
        .context("sync_run_list failed")?;

        rows.iter().map(sync_run_from_row).collect()
    }

    async fn webhook_insert(&self, ev: &NewWebhookEvent) -> Result<bool> {
        let res = sqlx::query(
            r#"
            insert into webhook_events (
              id, event_id, idempotency_key, event_type, tenant, payload,
              signature, verified, status, received_at, updated_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            on conflict (idempotency_key) do nothing
            "#,
        )
        .bind(ev.id)
        .bind(&ev.event_id)
        .bind(&ev.idempotency_key)
        .bind(&ev.event_type)
        .bind(&ev.tenant)
        .bind(&ev.payload)
        .bind(&ev.signature)
        .bind(ev.verified)
        .bind(ev.status.as_str())
        .bind(ev.received_at)
        .execute(&self.pool)
        .await
        .context("webhook_insert failed")?;

        Ok(res.rows_affected() == 1)
    }

    async fn webhook_by_key(&self, idempotency_key: &str) -> Result<Option<WebhookEvent>> {
        let row = sqlx::query(&format!(
            "select {WEBHOOK_COLS} from webhook_events where idempotency_key = $1"
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .context("webhook_by_key failed")?;

        row.as_ref().map(webhook_from_row).transpose()
    }

    async fn webhook_by_id(&self, id: Uuid) -> Result<Option<WebhookEvent>> {
        let row = sqlx::query(&format!(
            "select {WEBHOOK_COLS} from webhook_events where id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("webhook_by_id failed")?;

        row.as_ref().map(webhook_from_row).transpose()
    }

    async fn webhook_claim(
        &self,
        id: Uuid,
        from: &[WebhookStatus],
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let res = sqlx::query(
            r#"
            update webhook_events set status = 'processing', updated_at = $4
            where id = $1
              and (status = any($2) or (status = 'processing' and updated_at < $3))
            "#,
        )
        .bind(id)
        .bind(&from)
        .bind(stale_before)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("webhook_claim failed")?;

        Ok(res.rows_affected() == 1)
    }

    async fn webhook_finish(&self, id: Uuid, done: &WebhookCompletion) -> Result<()> {
        sqlx::query(
            r#"
            update webhook_events set
              status = $2,
              entity_type = coalesce($3, entity_type),
              entity_id = coalesce($4, entity_id),
              error = $5,
              processed_at = $6,
              updated_at = $6,
              retry_count = retry_count + case when $2 = 'failed' then 1 else 0 end
            where id = $1
            "#,
        )
        .bind(id)
        .bind(done.status.as_str())
        .bind(&done.entity_type)
        .bind(&done.entity_id)
        .bind(&done.error)
        .bind(done.finished_at)
        .execute(&self.pool)
        .await
        .context("webhook_finish failed")?;
        Ok(())
    }

    async fn webhook_list(&self, filter: &WebhookFilter) -> Result<Vec<WebhookEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            select {WEBHOOK_COLS} from webhook_events
            where ($1::text is null or tenant = $1)
              and ($2::text is null or status = $2)
              and ($3::timestamptz is null or (status = 'processing' and updated_at < $3))
            order by received_at desc
            limit $4
            "#
        ))
        .bind(filter.tenant.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.stale_before)
        .bind(clamp_limit(filter.limit))
        .fetch_all(&self.pool)
        .await
        .context("webhook_list failed")?;

        rows.iter().map(webhook_from_row).collect()
    }

    async fn posting_get(&self, posting_number: &str) -> Result<Option<Posting>> {
        let row = sqlx::query(&format!("{POSTING_SELECT} where p.posting_number = $1"))
            .bind(posting_number)
            .fetch_optional(&self.pool)
            .await
            .context("posting_get failed")?;

        row.as_ref().map(posting_from_row).transpose()
    }

    async fn posting_list(&self, tenant: &str, limit: i64) -> Result<Vec<Posting>> {
        let rows = sqlx::query(&format!(
            "{POSTING_SELECT} where p.tenant = $1 order by p.updated_at desc limit $2"
        ))
        .bind(tenant)
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await
        .context("posting_list failed")?;

        rows.iter().map(posting_from_row).collect()
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await.context("begin tx failed")?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn outbox_claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            update outbox_events set next_retry_at = $3
            where event_id in (
              select event_id from outbox_events
              where status = 'pending' and next_retry_at <= $1
              order by created_at
              limit $2
              for update skip locked
            )
            returning {OUTBOX_COLS}
            "#
        ))
        .bind(now)
        .bind(limit.max(1))
        .bind(lease_until)
        .fetch_all(&self.pool)
        .await
        .context("outbox_claim_due failed")?;

        let mut out = rows
            .iter()
            .map(outbox_from_row)
            .collect::<Result<Vec<_>>>()?;
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }

    async fn outbox_mark_sent(&self, event_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            update outbox_events set status = 'sent', sent_at = $2, last_error = null
            where event_id = $1 and status = 'pending'
            "#,
        )
        .bind(event_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("outbox_mark_sent failed")?;
        Ok(())
    }

    async fn outbox_mark_retry(
        &self,
        event_id: Uuid,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            update outbox_events set
              retry_count = retry_count + 1, next_retry_at = $2, last_error = $3
            where event_id = $1 and status = 'pending'
            "#,
        )
        .bind(event_id)
        .bind(next_retry_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("outbox_mark_retry failed")?;
        Ok(())
    }

    async fn outbox_mark_failed(&self, event_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            update outbox_events set
              status = 'failed', retry_count = retry_count + 1, last_error = $2
            where event_id = $1 and status = 'pending'
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("outbox_mark_failed failed")?;
        Ok(())
    }

    async fn outbox_list(&self, filter: &OutboxFilter) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            select {OUTBOX_COLS} from outbox_events
            where ($1::text is null or status = $1)
              and ($2::text is null or aggregate_id = $2)
            order by created_at
            limit $3
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.aggregate_id.as_deref())
        .bind(clamp_limit(filter.limit))
        .fetch_all(&self.pool)
        .await
        .context("outbox_list failed")?;

        rows.iter().map(outbox_from_row).collect()
    }

    async fn stats(&self, tenant: Option<&str>) -> Result<Stats> {
        Ok(Stats {
            postings_by_operation_status: grouped_counts(
                &self.pool,
                "select operation_status as k, count(*)::bigint as n from postings \
                 where ($1::text is null or tenant = $1) group by 1",
                tenant,
            )
            .await?,
            webhooks_by_status: grouped_counts(
                &self.pool,
                "select status as k, count(*)::bigint as n from webhook_events \
                 where ($1::text is null or tenant = $1) group by 1",
                tenant,
            )
            .await?,
            outbox_by_status: grouped_counts(
                &self.pool,
                "select o.status as k, count(*)::bigint as n from outbox_events o \
                 where ($1::text is null or exists ( \
                   select 1 from postings p where p.posting_number = o.aggregate_id and p.tenant = $1)) \
                 group by 1",
                tenant,
            )
            .await?,
            sync_runs_by_status: grouped_counts(
                &self.pool,
                "select status as k, count(*)::bigint as n from sync_runs \
                 where ($1::text is null or tenant = $1) group by 1",
                tenant,
            )
            .await?,
            checkpoints_by_status: grouped_counts(
                &self.pool,
                "select status as k, count(*)::bigint as n from checkpoints \
                 where ($1::text is null or tenant = $1) group by 1",
                tenant,
            )
            .await?,
        })
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn insert_tracking(&mut self, posting: &Posting, now: DateTime<Utc>) -> Result<()> {
        for n in &posting.tracking_numbers {
            sqlx::query(
                r#"
                insert into tracking_numbers (posting_number, tracking_number, created_at)
                values ($1, $2, $3)
                on conflict (posting_number, tracking_number) do nothing
                "#,
            )
            .bind(&posting.posting_number)
            .bind(n)
            .bind(now)
            .execute(&mut *self.tx)
            .await
            .context("tracking number insert failed")?;
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn posting_load(&mut self, posting_number: &str) -> Result<Option<Posting>> {
        let row = sqlx::query(&format!("{POSTING_SELECT} where p.posting_number = $1"))
            .bind(posting_number)
            .fetch_optional(&mut *self.tx)
            .await
            .context("posting_load failed")?;

        row.as_ref().map(posting_from_row).transpose()
    }

    async fn posting_insert(&mut self, p: &Posting, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            insert into postings (
              posting_number, tenant, entity_type,
              remote_status, remote_substatus, in_process_at, shipment_date,
              delivering_date, delivered_at, cancel_reason, remote_tracking_number, raw_snapshot,
              operation_status, purchase_price_micros, notes, printed, stock_deducted,
              has_tracking, total_price_micros, skus,
              version, updated_at
            ) values (
              $1, $2, $3,
              $4, $5, $6, $7,
              $8, $9, $10, $11, $12,
              $13, $14, $15, $16, $17,
              $18, $19, $20,
              1, $21
            )
            on conflict (posting_number) do nothing
            "#,
        )
        .bind(&p.posting_number)
        .bind(&p.tenant)
        .bind(p.entity_type.as_str())
        .bind(&p.remote_status)
        .bind(&p.remote_substatus)
        .bind(p.in_process_at)
        .bind(p.shipment_date)
        .bind(p.delivering_date)
        .bind(p.delivered_at)
        .bind(&p.cancel_reason)
        .bind(&p.remote_tracking_number)
        .bind(&p.raw_snapshot)
        .bind(p.operation_status.as_str())
        .bind(p.purchase_price_micros)
        .bind(&p.notes)
        .bind(p.printed)
        .bind(p.stock_deducted)
        .bind(p.has_tracking)
        .bind(p.total_price_micros)
        .bind(&p.skus)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .context("posting_insert failed")?;

        if res.rows_affected() != 1 {
            return Ok(false);
        }
        self.insert_tracking(p, now).await?;
        Ok(true)
    }

    async fn posting_update(
        &mut self,
        p: &Posting,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            update postings set
              remote_status = $3, remote_substatus = $4, in_process_at = $5, shipment_date = $6,
              delivering_date = $7, delivered_at = $8, cancel_reason = $9,
              remote_tracking_number = $10, raw_snapshot = $11,
              operation_status = $12, purchase_price_micros = $13, notes = $14,
              printed = $15, stock_deducted = $16,
              has_tracking = $17, total_price_micros = $18, skus = $19,
              version = version + 1, updated_at = $20
            where posting_number = $1 and version = $2
            "#,
        )
        .bind(&p.posting_number)
        .bind(expected_version)
        .bind(&p.remote_status)
        .bind(&p.remote_substatus)
        .bind(p.in_process_at)
        .bind(p.shipment_date)
        .bind(p.delivering_date)
        .bind(p.delivered_at)
        .bind(&p.cancel_reason)
        .bind(&p.remote_tracking_number)
        .bind(&p.raw_snapshot)
        .bind(p.operation_status.as_str())
        .bind(p.purchase_price_micros)
        .bind(&p.notes)
        .bind(p.printed)
        .bind(p.stock_deducted)
        .bind(p.has_tracking)
        .bind(p.total_price_micros)
        .bind(&p.skus)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .context("posting_update failed")?;

        if res.rows_affected() != 1 {
            return Ok(false);
        }
        self.insert_tracking(p, now).await?;
        Ok(true)
    }

    async fn outbox_insert(&mut self, ev: &NewOutboxEvent, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            insert into outbox_events (
              event_id, aggregate_type, aggregate_id, event_type, payload,
              status, next_retry_at, created_at
            ) values ($1, $2, $3, $4, $5, 'pending', $6, $6)
            "#,
        )
        .bind(ev.event_id)
        .bind(&ev.aggregate_type)
        .bind(&ev.aggregate_id)
        .bind(&ev.event_type)
        .bind(&ev.payload)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .context("outbox_insert failed")?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("commit failed")?;
        Ok(())
    }
}
