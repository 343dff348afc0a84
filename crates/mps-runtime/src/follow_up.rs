use anyhow::{Context, Result};
use mps_reconcile::RemoteRecord;
use mps_schemas::EntityType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::apply::{apply_remote, ApplyOutcome, Cause};
use crate::{EngineContext, GatewayError};

/// Pull the full remote posting after a thin webhook and reconcile it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpJob {
    pub tenant: String,
    pub entity_type: EntityType,
    pub posting_number: String,
    /// Webhook row that triggered the job, for log correlation.
    pub webhook_id: Option<Uuid>,
}

pub async fn fetch_and_apply(ctx: &EngineContext, job: &FollowUpJob) -> Result<ApplyOutcome> {
    let timeout = ctx.settings.fetch_timeout;
    let gateway = &ctx.gateway;
    let raw = ctx
        .settings
        .fetch_retry
        .run(
            "fetch_posting",
            |_| async move {
                match tokio::time::timeout(
                    timeout,
                    gateway.fetch_posting(&job.tenant, job.entity_type, &job.posting_number),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => Err(GatewayError::Timeout(timeout)),
                }
            },
            GatewayError::retry_hint,
        )
        .await
        .with_context(|| format!("follow-up fetch of {} failed", job.posting_number))?;

    let Some(raw) = raw else {
        tracing::warn!(
            tenant = %job.tenant,
            posting_number = %job.posting_number,
            webhook_id = ?job.webhook_id,
            "follow-up: posting unknown to remote"
        );
        return Ok(ApplyOutcome::Unchanged);
    };

    let record = RemoteRecord::decode_snapshot(raw)
        .with_context(|| format!("follow-up record for {} undecodable", job.posting_number))?;
    let outcome = apply_remote(ctx, &job.tenant, job.entity_type, &record, Cause::FollowUp)
        .await
        .with_context(|| format!("follow-up apply of {} failed", job.posting_number))?;

    tracing::info!(
        tenant = %job.tenant,
        posting_number = %job.posting_number,
        webhook_id = ?job.webhook_id,
        written = outcome.is_write(),
        "follow-up applied"
    );
    Ok(outcome)
}
