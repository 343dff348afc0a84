//! Incremental / full sync for one (tenant, entity type).
//!
//! Pages are applied strictly in fetch order. The checkpoint cursor is only
//! committed after every record of a page went through the mutation
//! pipeline, so an aborted run restarts from the last fully applied page.
//!
//! Single-flight per key is the caller's job.

use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use mps_reconcile::RemoteRecord;
use mps_schemas::{EntityType, PageCommit, SyncCounts, SyncRun, SyncRunStatus};
use serde::Serialize;
use uuid::Uuid;

use crate::apply::{apply_remote, ApplyOutcome, Cause};
use crate::{EngineContext, GatewayError, Page, PullRequest};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub batch_id: Uuid,
    pub status: SyncRunStatus,
    pub counts: SyncCounts,
    pub pages: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The checkpoint is paused; no run was recorded.
    Paused,
    Finished(SyncReport),
}

#[derive(Clone)]
pub struct SyncEngine {
    ctx: EngineContext,
}

impl SyncEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn sync(
        &self,
        tenant: &str,
        entity_type: EntityType,
        full_sync: bool,
    ) -> Result<SyncOutcome> {
        self.run(Uuid::new_v4(), tenant, entity_type, full_sync, None)
            .await
    }

    /// Run with a caller-chosen batch id (the admin surface hands the id
    /// back before the run finishes). `range` overrides the computed
    /// `since..to` window.
    ///
    /// `Err` only when the store itself is unusable; remote and per-record
    /// failures end up in the report.
    pub async fn run(
        &self,
        batch_id: Uuid,
        tenant: &str,
        entity_type: EntityType,
        full_sync: bool,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<SyncOutcome> {
        let store = &self.ctx.store;
        let settings = &self.ctx.settings;

        let cp = store.checkpoint_load_or_create(tenant, entity_type).await?;
        if cp.is_paused() {
            tracing::info!(tenant, entity_type = %entity_type, "checkpoint paused, sync skipped");
            return Ok(SyncOutcome::Paused);
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let cp = store
            .checkpoint_begin_run(tenant, entity_type, full_sync, started_at)
            .await?;

        let mut run = SyncRun {
            batch_id,
            tenant: tenant.to_string(),
            entity_type,
            full_sync,
            status: SyncRunStatus::Started,
            counts: SyncCounts::default(),
            started_at,
            finished_at: None,
            duration_ms: None,
            error: None,
        };
        store.sync_run_insert(&run).await?;

        let (since, to) = match range {
            Some(r) => r,
            None if full_sync => (started_at - settings.full_window, started_at),
            None => {
                let since = cp
                    .watermark
                    .map(|w| w - settings.lookback)
                    .unwrap_or(started_at - settings.full_window);
                (since, started_at)
            }
        };
        let mut cursor = if full_sync { None } else { cp.cursor.clone() };

        tracing::info!(
            %batch_id,
            tenant,
            entity_type = %entity_type,
            full_sync,
            cursor = cursor.as_deref().unwrap_or(""),
            %since,
            %to,
            "sync started"
        );

        let mut counts = SyncCounts::default();
        let mut pages: u32 = 0;

        let result: Result<(), String> = loop {
            if settings.max_pages > 0 && pages >= settings.max_pages {
                tracing::info!(%batch_id, pages, "page limit reached, remaining pages left for next run");
                break Ok(());
            }

            let req = PullRequest {
                tenant: tenant.to_string(),
                entity_type,
                cursor: cursor.clone(),
                since,
                to,
                page_size: settings.page_size,
            };
            let page = match self.fetch(&req).await {
                Ok(p) => p,
                Err(e) => break Err(format!("fetch failed: {e}")),
            };
            if page.records.is_empty() {
                break Ok(());
            }
            pages += 1;

            let (page_counts, watermark) = self.apply_page(tenant, entity_type, page.records).await;

            let next = page.next_cursor.clone().or_else(|| cursor.clone());
            let commit = PageCommit {
                cursor: next.clone(),
                watermark,
                processed: page_counts.processed,
                success: page_counts.success,
                failed: page_counts.failed,
            };
            if let Err(e) = store
                .checkpoint_commit_page(tenant, entity_type, &commit, Utc::now())
                .await
            {
                break Err(format!("checkpoint commit failed: {e:#}"));
            }
            counts.add(&page_counts);

            tracing::info!(
                %batch_id,
                page = pages,
                processed = page_counts.processed,
                success = page_counts.success,
                failed = page_counts.failed,
                skipped = page_counts.skipped,
                cursor = next.as_deref().unwrap_or(""),
                "page committed"
            );

            if !page.has_more {
                break Ok(());
            }
            if page.next_cursor.is_none() || page.next_cursor == cursor {
                break Err("remote reported more pages without advancing the cursor".to_string());
            }
            cursor = next;

            if !settings.page_delay.is_zero() {
                tokio::time::sleep(settings.page_delay).await;
            }
        };

        let finished_at = Utc::now();
        match &result {
            Ok(()) => store.checkpoint_finish(tenant, entity_type, finished_at).await?,
            Err(msg) => {
                store
                    .checkpoint_fail(tenant, entity_type, &self.ctx.truncate(msg), finished_at)
                    .await?
            }
        }

        run.status = match &result {
            Err(_) => SyncRunStatus::Failed,
            Ok(()) if counts.failed > 0 => SyncRunStatus::Partial,
            Ok(()) => SyncRunStatus::Success,
        };
        run.counts = counts;
        run.finished_at = Some(finished_at);
        run.duration_ms = Some(clock.elapsed().as_millis() as i64);
        run.error = result.as_ref().err().map(|m| self.ctx.truncate(m));
        store.sync_run_finalize(&run).await?;

        match &run.error {
            Some(err) => tracing::warn!(%batch_id, tenant, entity_type = %entity_type, pages, error = %err, "sync failed"),
            None => tracing::info!(
                %batch_id,
                tenant,
                entity_type = %entity_type,
                status = run.status.as_str(),
                pages,
                processed = counts.processed,
                success = counts.success,
                failed = counts.failed,
                skipped = counts.skipped,
                "sync finished"
            ),
        }

        Ok(SyncOutcome::Finished(SyncReport {
            batch_id,
            status: run.status,
            counts,
            pages,
            error: run.error,
        }))
    }

    /// One remote page, bounded by the fetch timeout and retried on
    /// transient errors.
    async fn fetch(&self, req: &PullRequest) -> Result<Page, GatewayError> {
        let timeout = self.ctx.settings.fetch_timeout;
        let gateway = &self.ctx.gateway;
        self.ctx
            .settings
            .fetch_retry
            .run(
                "pull",
                |_| async move {
                    match tokio::time::timeout(timeout, gateway.pull(req)).await {
                        Ok(r) => r,
                        Err(_) => Err(GatewayError::Timeout(timeout)),
                    }
                },
                GatewayError::retry_hint,
            )
            .await
    }

    /// Apply every record of a page. Failures are counted, never propagated.
    /// Returns the page counters and the newest remote change time seen.
    async fn apply_page(
        &self,
        tenant: &str,
        entity_type: EntityType,
        records: Vec<serde_json::Value>,
    ) -> (SyncCounts, Option<DateTime<Utc>>) {
        let mut counts = SyncCounts::default();
        let mut watermark: Option<DateTime<Utc>> = None;

        for raw in records {
            counts.processed += 1;
            let record = match RemoteRecord::decode_snapshot(raw) {
                Ok(r) => r,
                Err(e) => {
                    counts.failed += 1;
                    tracing::warn!(tenant, entity_type = %entity_type, error = %e, "record skipped: undecodable");
                    continue;
                }
            };
            if let Some(ts) = record.last_changed_at() {
                watermark = Some(watermark.map_or(ts, |w| w.max(ts)));
            }

            match apply_remote(&self.ctx, tenant, entity_type, &record, Cause::Sync).await {
                Ok(ApplyOutcome::Unchanged) => counts.skipped += 1,
                Ok(_) => counts.success += 1,
                Err(e) => {
                    counts.failed += 1;
                    tracing::warn!(
                        tenant,
                        entity_type = %entity_type,
                        posting_number = record.posting_number(),
                        business = e.is_business(),
                        error = %e,
                        "record failed"
                    );
                }
            }
        }

        (counts, watermark)
    }
}
