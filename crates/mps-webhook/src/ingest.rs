//! Webhook ingestion.
//!
//! Order of checks for one delivery:
//!
//! 1. size, JSON shape, event type (400)
//! 2. ping / verification short-circuit (200, nothing stored)
//! 3. tenant resolution (404)
//! 4. HMAC signature, or the unsigned-mode decision (401)
//! 5. event decode for routed types (400)
//! 6. insert the row as `processing` keyed by `tenant:event_id`
//! 7. handle, then write the terminal status
//!
//! A duplicate key short-circuits at step 6: `processed` / `ignored` rows
//! are answered as duplicates, a `failed` row or an abandoned `processing`
//! row is claimed and handled again, a live `processing` row is left to its
//! owner.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use mps_config::{AppConfig, UnsignedMode};
use mps_reconcile::RemoteRecord;
use mps_runtime::{apply_remote, ApplyOutcome, Cause, EngineContext, FollowUpJob, QueueStats, WorkQueue};
use mps_schemas::{EntityType, NewWebhookEvent, WebhookCompletion, WebhookEvent, WebhookStatus};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::dispatch::{is_ping, DispatchTable, Route};
use crate::signature::{derive_event_id, verify_signature};
use crate::{IngestError, TenantDirectory};

pub const HEADER_SIGNATURE: &str = "X-Platform-Signature";
pub const HEADER_EVENT_ID: &str = "X-Event-Id";
pub const HEADER_EVENT_TYPE: &str = "X-Event-Type";

/// One delivery as received, transport-independent.
#[derive(Debug, Clone, Default)]
pub struct IncomingWebhook {
    pub event_type: Option<String>,
    pub event_id: Option<String>,
    pub signature: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Ping,
    Processed,
    Ignored,
    Failed,
    /// Already handled under the same idempotency key.
    Duplicate,
    /// Another delivery of the same key is being handled right now.
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub disposition: Disposition,
    /// Stored row, absent for pings.
    pub id: Option<Uuid>,
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestSettings {
    pub unsigned_mode: UnsignedMode,
    pub stale_processing: chrono::Duration,
    pub max_payload_bytes: usize,
    /// Entity type assumed when a payload does not name its scheme.
    pub default_entity_type: EntityType,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl IngestSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            unsigned_mode: cfg.webhook.unsigned_mode,
            stale_processing: chrono::Duration::seconds(cfg.webhook.stale_processing_secs.max(1)),
            max_payload_bytes: cfg.webhook.max_payload_bytes,
            default_entity_type: EntityType::PostingFbs,
        }
    }
}

pub struct WebhookIngestor {
    ctx: EngineContext,
    tenants: TenantDirectory,
    settings: IngestSettings,
    routes: DispatchTable,
    follow_up: Option<Arc<WorkQueue<FollowUpJob>>>,
}

impl WebhookIngestor {
    pub fn new(ctx: EngineContext, tenants: TenantDirectory, settings: IngestSettings) -> Self {
        Self {
            ctx,
            tenants,
            settings,
            routes: DispatchTable::default(),
            follow_up: None,
        }
    }

    pub fn with_routes(mut self, routes: DispatchTable) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_follow_up(mut self, queue: Arc<WorkQueue<FollowUpJob>>) -> Self {
        self.follow_up = Some(queue);
        self
    }

    pub fn follow_up_stats(&self) -> Option<QueueStats> {
        self.follow_up.as_ref().map(|q| q.stats())
    }

    // -----------------------------------------------------------------------
    // Receive
    // -----------------------------------------------------------------------

    pub async fn receive(&self, req: IncomingWebhook) -> Result<IngestResponse, IngestError> {
        if req.body.len() > self.settings.max_payload_bytes {
            return Err(IngestError::PayloadTooLarge {
                size: req.body.len(),
                max: self.settings.max_payload_bytes,
            });
        }
        let payload: Value = serde_json::from_slice(&req.body)
            .map_err(|e| IngestError::Malformed(format!("invalid JSON: {e}")))?;
        if !payload.is_object() {
            return Err(IngestError::Malformed("payload is not a JSON object".to_string()));
        }

        let event_type = non_blank(req.event_type.as_deref())
            .or_else(|| payload_str(&payload, "event_type"))
            .or_else(|| payload_str(&payload, "message_type"))
            .ok_or(IngestError::MissingHeader(HEADER_EVENT_TYPE))?;

        if is_ping(&event_type) {
            tracing::info!(event_type = %event_type, "webhook ping answered");
            return Ok(IngestResponse {
                success: true,
                disposition: Disposition::Ping,
                id: None,
                event_id: non_blank(req.event_id.as_deref()).unwrap_or_default(),
                error: None,
            });
        }

        let tenant = self
            .tenants
            .resolve(&payload)
            .ok_or(IngestError::UnknownTenant)?
            .to_string();

        let verified = self.check_signature(&tenant, req.signature.as_deref(), &req.body)?;

        let route = self.routes.route(&event_type);
        let entity_id = match route {
            Some(r) => Some(
                RemoteRecord::decode_event(r.kind, &payload)
                    .map_err(|e| IngestError::Malformed(e.to_string()))?
                    .posting_number()
                    .to_string(),
            ),
            None => None,
        };

        let event_id = non_blank(req.event_id.as_deref())
            .or_else(|| payload_str(&payload, "event_id"))
            .unwrap_or_else(|| derive_event_id(&req.body));
        let idempotency_key = format!("{tenant}:{event_id}");
        let now = Utc::now();

        let row = NewWebhookEvent {
            id: Uuid::new_v4(),
            event_id: event_id.clone(),
            idempotency_key: idempotency_key.clone(),
            event_type: event_type.clone(),
            tenant: tenant.clone(),
            payload,
            signature: req.signature.clone(),
            verified,
            status: WebhookStatus::Processing,
            received_at: now,
        };

        let inserted = self
            .ctx
            .store
            .webhook_insert(&row)
            .await
            .context("webhook insert failed")?;

        let event = if inserted {
            tracing::info!(
                id = %row.id,
                event_id = %event_id,
                idempotency_key = %idempotency_key,
                event_type = %event_type,
                tenant = %tenant,
                entity_id = ?entity_id,
                verified,
                "webhook received"
            );
            WebhookEvent {
                id: row.id,
                event_id: row.event_id,
                idempotency_key: row.idempotency_key,
                event_type: row.event_type,
                tenant: row.tenant,
                payload: row.payload,
                signature: row.signature,
                verified: row.verified,
                status: WebhookStatus::Processing,
                retry_count: 0,
                entity_type: None,
                entity_id: None,
                error: None,
                received_at: now,
                processed_at: None,
                updated_at: now,
            }
        } else {
            let existing = self
                .ctx
                .store
                .webhook_by_key(&idempotency_key)
                .await
                .context("webhook lookup failed")?
                .ok_or_else(|| anyhow::anyhow!("webhook {idempotency_key} vanished after conflict"))?;

            match existing.status {
                WebhookStatus::Processed | WebhookStatus::Ignored => {
                    tracing::info!(id = %existing.id, idempotency_key = %idempotency_key, status = existing.status.as_str(), "webhook duplicate");
                    return Ok(respond(&existing, Disposition::Duplicate, None));
                }
                WebhookStatus::Failed | WebhookStatus::Processing | WebhookStatus::Pending => {
                    let stale_before = now - self.settings.stale_processing;
                    let won = self
                        .ctx
                        .store
                        .webhook_claim(existing.id, &[WebhookStatus::Failed, WebhookStatus::Pending], stale_before, now)
                        .await
                        .context("webhook claim failed")?;
                    if !won {
                        tracing::info!(id = %existing.id, idempotency_key = %idempotency_key, "webhook in flight elsewhere");
                        return Ok(respond(&existing, Disposition::InFlight, None));
                    }
                    tracing::info!(id = %existing.id, idempotency_key = %idempotency_key, previous = existing.status.as_str(), "webhook redelivery reclaimed");
                    existing
                }
            }
        };

        self.handle_and_finish(&event, route).await
    }

    /// `Ok(verified)`, or the 401 rejection.
    fn check_signature(&self, tenant: &str, signature: Option<&str>, body: &[u8]) -> Result<bool, IngestError> {
        match self.tenants.secret(tenant) {
            Some(secret) => {
                let sig = non_blank(signature).ok_or(IngestError::SignatureInvalid)?;
                verify_signature(secret, &sig, body).map_err(|_| {
                    tracing::warn!(tenant, "webhook signature rejected");
                    IngestError::SignatureInvalid
                })?;
                Ok(true)
            }
            None => match self.settings.unsigned_mode {
                UnsignedMode::Accept => {
                    tracing::warn!(tenant, "no webhook secret configured, accepting unsigned payload");
                    Ok(false)
                }
                UnsignedMode::Reject => Err(IngestError::SignatureRequired(tenant.to_string())),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Manual retry / stale recovery
    // -----------------------------------------------------------------------

    /// Re-run the handler for a `failed` or `ignored` event, or for one stuck
    /// in `processing` past the stale threshold.
    pub async fn retry(&self, id: Uuid) -> Result<IngestResponse, IngestError> {
        let event = self
            .ctx
            .store
            .webhook_by_id(id)
            .await
            .context("webhook lookup failed")?
            .ok_or(IngestError::NotFound(id))?;

        let now = Utc::now();
        let won = self
            .ctx
            .store
            .webhook_claim(
                id,
                &[WebhookStatus::Failed, WebhookStatus::Ignored, WebhookStatus::Pending],
                now - self.settings.stale_processing,
                now,
            )
            .await
            .context("webhook claim failed")?;
        if !won {
            return Err(IngestError::not_retryable(id, event.status));
        }

        tracing::info!(id = %id, event_id = %event.event_id, previous = event.status.as_str(), "webhook manual retry");
        let route = self.routes.route(&event.event_type);
        self.handle_and_finish(&event, route).await
    }

    /// Retry every `processing` row abandoned longer than the stale threshold.
    pub async fn recover_stale(&self, limit: i64) -> anyhow::Result<Vec<IngestResponse>> {
        let stale_before = Utc::now() - self.settings.stale_processing;
        let stuck = self
            .ctx
            .store
            .webhook_list(&mps_db::WebhookFilter {
                status: Some(WebhookStatus::Processing),
                stale_before: Some(stale_before),
                limit,
                ..Default::default()
            })
            .await?;

        let mut out = Vec::with_capacity(stuck.len());
        for ev in stuck {
            match self.retry(ev.id).await {
                Ok(r) => out.push(r),
                // Someone else reclaimed it between list and claim.
                Err(IngestError::NotRetryable { .. }) => {}
                Err(e) => tracing::warn!(id = %ev.id, error = %e, "stale webhook recovery failed"),
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Handling
    // -----------------------------------------------------------------------

    async fn handle_and_finish(
        &self,
        event: &WebhookEvent,
        route: Option<Route>,
    ) -> Result<IngestResponse, IngestError> {
        let completion = match route {
            None => WebhookCompletion {
                status: WebhookStatus::Ignored,
                entity_type: None,
                entity_id: None,
                error: None,
                finished_at: Utc::now(),
            },
            Some(route) => self.handle(event, route).await,
        };

        self.ctx
            .store
            .webhook_finish(event.id, &completion)
            .await
            .context("webhook finish failed")?;

        let disposition = match completion.status {
            WebhookStatus::Ignored => Disposition::Ignored,
            WebhookStatus::Failed => Disposition::Failed,
            _ => Disposition::Processed,
        };
        tracing::info!(
            id = %event.id,
            event_id = %event.event_id,
            event_type = %event.event_type,
            status = completion.status.as_str(),
            error = completion.error.as_deref().unwrap_or(""),
            "webhook handled"
        );
        Ok(respond(event, disposition, completion.error))
    }

    async fn handle(&self, event: &WebhookEvent, route: Route) -> WebhookCompletion {
        let failed = |entity_id: Option<String>, msg: String| WebhookCompletion {
            status: WebhookStatus::Failed,
            entity_type: None,
            entity_id,
            error: Some(self.ctx.truncate(&msg)),
            finished_at: Utc::now(),
        };

        let record = match RemoteRecord::decode_event(route.kind, &event.payload) {
            Ok(r) => r,
            Err(e) => return failed(None, e.to_string()),
        };
        let posting_number = record.posting_number().to_string();
        let hint = record
            .declared_entity_type()
            .unwrap_or(self.settings.default_entity_type);

        let outcome = apply_remote(&self.ctx, &event.tenant, hint, &record, Cause::Webhook).await;
        let entity_type = match &outcome {
            Ok(ApplyOutcome::Created(p)) | Ok(ApplyOutcome::Updated(p)) => p.entity_type,
            _ => hint,
        };
        if let Err(e) = outcome {
            return failed(Some(posting_number), format!("{e:#}"));
        }

        if route.follow_up {
            self.enqueue_follow_up(event, entity_type, &posting_number);
        }

        WebhookCompletion {
            status: WebhookStatus::Processed,
            entity_type: Some(entity_type.as_str().to_string()),
            entity_id: Some(posting_number),
            error: None,
            finished_at: Utc::now(),
        }
    }

    fn enqueue_follow_up(&self, event: &WebhookEvent, entity_type: EntityType, posting_number: &str) {
        let Some(queue) = &self.follow_up else {
            return;
        };
        let job = FollowUpJob {
            tenant: event.tenant.clone(),
            entity_type,
            posting_number: posting_number.to_string(),
            webhook_id: Some(event.id),
        };
        // A dropped follow-up is recovered by the next incremental sync.
        if queue.try_enqueue(job).is_err() {
            tracing::warn!(id = %event.id, posting_number, "follow-up dropped, queue full");
        }
    }
}

fn respond(event: &WebhookEvent, disposition: Disposition, error: Option<String>) -> IngestResponse {
    IngestResponse {
        success: disposition != Disposition::Failed,
        disposition,
        id: Some(event.id),
        event_id: event.event_id.clone(),
        error,
    }
}

fn non_blank(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn payload_str(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) => non_blank(Some(s)),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
