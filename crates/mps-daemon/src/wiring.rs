//! Startup wiring shared by the daemon and `mps-cli`.
//!
//! Turns a loaded [`AppConfig`] plus resolved secrets into a live
//! [`EngineContext`] and the components hanging off it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mps_audit::{AuditSink, JsonlAuditSink, NoopAudit};
use mps_config::{AppConfig, ResolvedSecrets};
use mps_db::PgStore;
use mps_platform::{outbox_sink_from_config, PlatformGateway};
use mps_runtime::{
    fetch_and_apply, EngineContext, EngineSettings, FollowUpJob, OutboxDispatcher, WorkQueue,
};
use mps_webhook::{IngestSettings, TenantDirectory, WebhookIngestor};
use tokio::task::JoinHandle;
use tracing::info;

/// A connected engine.
pub struct Engine {
    pub ctx: EngineContext,
    audit_task: Option<JoinHandle<()>>,
}

impl Engine {
    /// Connect Postgres, build the platform gateway and open the audit log.
    pub async fn connect(cfg: &AppConfig, secrets: &ResolvedSecrets) -> Result<Self> {
        let url = secrets.require_database_url()?;
        let pool = mps_db::connect(url, cfg.database.max_connections).await?;
        let store = Arc::new(PgStore::new(pool));

        let gateway = Arc::new(PlatformGateway::from_config(cfg, secrets)?);

        let mut audit_task = None;
        let audit: Arc<dyn AuditSink> = match cfg.audit.path.as_deref() {
            Some(path) => {
                let (sink, task) = JsonlAuditSink::spawn(path, cfg.audit.capacity)
                    .with_context(|| format!("audit log open failed: {path}"))?;
                info!(path, "audit log enabled");
                audit_task = Some(task);
                Arc::new(sink)
            }
            None => Arc::new(NoopAudit),
        };

        let ctx = EngineContext::new(store, gateway, audit, EngineSettings::from_config(cfg));
        Ok(Self { ctx, audit_task })
    }

    /// Drop the engine handle and wait for queued audit records to land.
    ///
    /// Every other `EngineContext` clone must be gone for the writer to
    /// drain; the wait is bounded by `grace`.
    pub async fn close(self, grace: Duration) {
        let Self {
            ctx, audit_task, ..
        } = self;
        drop(ctx);
        if let Some(task) = audit_task {
            if tokio::time::timeout(grace, task).await.is_err() {
                tracing::warn!("audit writer did not drain before shutdown");
            }
        }
    }
}

/// Bounded worker pool running webhook follow-up fetches.
pub fn follow_up_queue(ctx: &EngineContext, cfg: &AppConfig) -> WorkQueue<FollowUpJob> {
    let ctx = ctx.clone();
    WorkQueue::spawn(
        "follow_up",
        cfg.webhook.follow_up.capacity,
        cfg.webhook.follow_up.workers,
        move |job: FollowUpJob| {
            let ctx = ctx.clone();
            async move { fetch_and_apply(&ctx, &job).await.map(|_| ()) }
        },
    )
}

pub fn webhook_ingestor(
    ctx: &EngineContext,
    cfg: &AppConfig,
    secrets: &ResolvedSecrets,
    follow_up: Option<Arc<WorkQueue<FollowUpJob>>>,
) -> WebhookIngestor {
    let tenants = TenantDirectory::new(&cfg.tenants, secrets);
    let ingestor = WebhookIngestor::new(ctx.clone(), tenants, IngestSettings::from_config(cfg));
    match follow_up {
        Some(queue) => ingestor.with_follow_up(queue),
        None => ingestor,
    }
}

pub fn outbox_dispatcher(ctx: &EngineContext, cfg: &AppConfig) -> Result<OutboxDispatcher> {
    let sink = outbox_sink_from_config(&cfg.outbox.sink)?;
    info!(sink = sink.name(), "outbox sink selected");
    Ok(OutboxDispatcher::from_config(
        cfg,
        Arc::clone(&ctx.store),
        sink,
    ))
}

/// Tenant ids the admin surface accepts.
pub fn tenant_ids(cfg: &AppConfig) -> Vec<String> {
    cfg.tenants.iter().map(|t| t.id.clone()).collect()
}
