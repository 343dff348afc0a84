//! Posting mutation pipeline.
//!
//! Every write to a posting, whether it comes from a sync page, a webhook,
//! a follow-up fetch or an operator, goes through this module:
//!
//! 1. open a [`StoreTx`](mps_db::StoreTx) and load the current row
//! 2. merge / apply the command (pure, in `mps-reconcile` / `mps-fulfillment`)
//! 3. skip everything if nothing changed
//! 4. write with an optimistic version check
//! 5. insert exactly one outbox row in the same transaction
//! 6. commit, then emit the audit record
//!
//! A version conflict rolls the attempt back and re-merges from the fresh
//! row, up to `max_merge_attempts` times.

use chrono::{DateTime, Utc};
use mps_audit::AuditRecord;
use mps_fulfillment::{apply_command, CommandError, Effect, FulfillmentCommand, Transition};
use mps_reconcile::{price_to_micros, reconcile, ReconcileError, RemoteRecord};
use mps_schemas::{EntityType, NewOutboxEvent, Posting, AGGREGATE_POSTING};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::EngineContext;

pub const EVENT_POSTING_CREATED: &str = "posting.created";
pub const EVENT_POSTING_STATUS_CHANGED: &str = "posting.status_changed";
pub const EVENT_POSTING_UPDATED: &str = "posting.updated";

/// Which input channel produced a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    Sync,
    Webhook,
    FollowUp,
    Operator,
}

impl Cause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cause::Sync => "sync",
            Cause::Webhook => "webhook",
            Cause::FollowUp => "follow_up",
            Cause::Operator => "operator",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Created(Posting),
    Updated(Posting),
    /// Merge reproduced the stored content; nothing was written.
    Unchanged,
}

impl ApplyOutcome {
    pub fn is_write(&self) -> bool {
        !matches!(self, ApplyOutcome::Unchanged)
    }

    pub fn posting(&self) -> Option<&Posting> {
        match self {
            ApplyOutcome::Created(p) | ApplyOutcome::Updated(p) => Some(p),
            ApplyOutcome::Unchanged => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("posting {0} not found")]
    NotFound(String),

    #[error("posting {posting_number} changed concurrently on each of {attempts} attempts")]
    Conflict {
        posting_number: String,
        attempts: u32,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ApplyError {
    /// Bad data or an illegal command: the caller skips the input rather
    /// than treating it as an infrastructure failure.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            ApplyError::Reconcile(_) | ApplyError::Command(_) | ApplyError::NotFound(_)
        )
    }
}

/// Operator actions on a stored posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OperatorAction {
    PrepareStock,
    SubmitTracking { numbers: Vec<String> },
    MarkPrinted,
    Discard,
    /// Decimal string; `None` clears it.
    SetPurchasePrice { price: Option<String> },
    SetNotes { notes: Option<String> },
}

impl OperatorAction {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorAction::SetPurchasePrice { .. } => "set_purchase_price",
            OperatorAction::SetNotes { .. } => "set_notes",
            other => other
                .as_command()
                .map(|c| c.name())
                .unwrap_or("unknown"),
        }
    }

    fn as_command(&self) -> Option<FulfillmentCommand> {
        match self {
            OperatorAction::PrepareStock => Some(FulfillmentCommand::PrepareStock),
            OperatorAction::SubmitTracking { numbers } => Some(FulfillmentCommand::SubmitTracking {
                numbers: numbers.clone(),
            }),
            OperatorAction::MarkPrinted => Some(FulfillmentCommand::MarkPrinted),
            OperatorAction::Discard => Some(FulfillmentCommand::Discard),
            OperatorAction::SetPurchasePrice { .. } | OperatorAction::SetNotes { .. } => None,
        }
    }

    /// Mutate `posting` in place. Returns the workflow transition (a no-op
    /// transition for local field edits).
    fn apply_to(&self, posting: &mut Posting) -> Result<Transition, CommandError> {
        if let Some(cmd) = self.as_command() {
            return apply_command(posting, &cmd);
        }
        let at = posting.operation_status;
        match self {
            OperatorAction::SetPurchasePrice { price } => {
                posting.purchase_price_micros = match price.as_deref().map(str::trim) {
                    None | Some("") => None,
                    Some(p) => Some(price_to_micros(p).map_err(CommandError::Invalid)?),
                };
            }
            OperatorAction::SetNotes { notes } => {
                posting.notes = notes
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string);
            }
            _ => {}
        }
        Ok(Transition {
            from: at,
            to: at,
            effects: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Remote input
// ---------------------------------------------------------------------------

/// Merge one remote record into the store.
pub async fn apply_remote(
    ctx: &EngineContext,
    tenant: &str,
    entity_hint: EntityType,
    record: &RemoteRecord,
    cause: Cause,
) -> Result<ApplyOutcome, ApplyError> {
    let number = record.posting_number().trim().to_string();
    let attempts = ctx.settings.max_merge_attempts;

    for attempt in 1..=attempts {
        let mut tx = ctx.store.begin().await?;
        let existing = tx.posting_load(&number).await?;

        let m = reconcile(existing.as_ref(), tenant, entity_hint, record, &ctx.settings.policy)?;
        if !m.changed {
            return Ok(ApplyOutcome::Unchanged);
        }

        let now = Utc::now();
        let written = match &m.before {
            None => tx.posting_insert(&m.after, now).await?,
            Some(before) => tx.posting_update(&m.after, before.version, now).await?,
        };
        if !written {
            tracing::debug!(posting_number = %number, attempt, "version conflict, re-merging");
            continue;
        }

        let event = posting_event(&m.after, m.before.as_ref(), &m.transition, cause, now);
        tx.outbox_insert(&event, now).await?;
        tx.commit().await?;

        let mut after = m.after;
        after.version = m.before.as_ref().map(|b| b.version + 1).unwrap_or(1);
        after.updated_at = Some(now);

        emit_audit(ctx, cause.as_str(), &event.event_type, m.before.as_ref(), &after, now);
        tracing::info!(
            posting_number = %after.posting_number,
            tenant = %after.tenant,
            cause = cause.as_str(),
            event_type = %event.event_type,
            from = %m.transition.from,
            to = %m.transition.to,
            "posting written"
        );

        return Ok(if m.before.is_none() {
            ApplyOutcome::Created(after)
        } else {
            ApplyOutcome::Updated(after)
        });
    }

    Err(ApplyError::Conflict {
        posting_number: number,
        attempts,
    })
}

// ---------------------------------------------------------------------------
// Operator input
// ---------------------------------------------------------------------------

/// Apply an operator action to a stored posting.
pub async fn apply_operator(
    ctx: &EngineContext,
    posting_number: &str,
    action: &OperatorAction,
    actor: &str,
) -> Result<ApplyOutcome, ApplyError> {
    let attempts = ctx.settings.max_merge_attempts;

    for attempt in 1..=attempts {
        let mut tx = ctx.store.begin().await?;
        let before = tx
            .posting_load(posting_number)
            .await?
            .ok_or_else(|| ApplyError::NotFound(posting_number.to_string()))?;

        let mut after = before.clone();
        let transition = action.apply_to(&mut after)?;
        if before.same_content(&after) {
            return Ok(ApplyOutcome::Unchanged);
        }

        let now = Utc::now();
        if !tx.posting_update(&after, before.version, now).await? {
            tracing::debug!(posting_number, attempt, "version conflict, re-applying operator action");
            continue;
        }

        let event = posting_event(&after, Some(&before), &transition, Cause::Operator, now);
        tx.outbox_insert(&event, now).await?;
        tx.commit().await?;

        after.version = before.version + 1;
        after.updated_at = Some(now);

        emit_audit(ctx, actor, action.name(), Some(&before), &after, now);
        tracing::info!(
            posting_number,
            action = action.name(),
            actor,
            from = %transition.from,
            to = %transition.to,
            "operator action applied"
        );
        return Ok(ApplyOutcome::Updated(after));
    }

    Err(ApplyError::Conflict {
        posting_number: posting_number.to_string(),
        attempts,
    })
}

// ---------------------------------------------------------------------------
// Outbox / audit
// ---------------------------------------------------------------------------

/// The one outbox row describing a committed posting mutation.
pub fn posting_event(
    after: &Posting,
    before: Option<&Posting>,
    transition: &Transition,
    cause: Cause,
    now: DateTime<Utc>,
) -> NewOutboxEvent {
    let event_type = if before.is_none() {
        EVENT_POSTING_CREATED
    } else if transition.status_changed() {
        EVENT_POSTING_STATUS_CHANGED
    } else {
        EVENT_POSTING_UPDATED
    };

    let effects: Vec<Value> = transition
        .effects
        .iter()
        .map(|e| {
            json!({
                "effect": effect_name(*e),
                "skus": after.skus,
            })
        })
        .collect();

    NewOutboxEvent {
        event_id: Uuid::new_v4(),
        aggregate_type: AGGREGATE_POSTING.to_string(),
        aggregate_id: after.posting_number.clone(),
        event_type: event_type.to_string(),
        payload: json!({
            "posting_number": after.posting_number,
            "tenant": after.tenant,
            "entity_type": after.entity_type.as_str(),
            "cause": cause.as_str(),
            "operation_status": {
                "from": before.map(|b| b.operation_status.as_str()),
                "to": after.operation_status.as_str(),
            },
            "remote_status": after.remote_status,
            "tracking_numbers": after.tracking_numbers,
            "total_price_micros": after.total_price_micros,
            "effects": effects,
            "changed_at": now,
        }),
    }
}

fn effect_name(e: Effect) -> &'static str {
    match e {
        Effect::DeductStock => "deduct_stock",
        Effect::RestoreStock => "restore_stock",
    }
}

fn emit_audit(
    ctx: &EngineContext,
    actor: &str,
    action: &str,
    before: Option<&Posting>,
    after: &Posting,
    now: DateTime<Utc>,
) {
    let to_value = |p: &Posting| serde_json::to_value(p).unwrap_or(Value::Null);
    ctx.audit.emit(AuditRecord {
        ts_utc: now,
        actor: actor.to_string(),
        action: action.to_string(),
        aggregate_type: AGGREGATE_POSTING.to_string(),
        aggregate_id: after.posting_number.clone(),
        before: before.map(to_value),
        after: to_value(after),
    });
}
