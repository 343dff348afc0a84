use mps_fulfillment::{observe_remote, Policy, Transition};
use mps_schemas::{EntityType, Posting};
use serde_json::Value;

use crate::{recompute_derived, PostingSnapshot, ReconcileError, RemoteRecord};

/// Outcome of merging one remote record into the posting aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// Stored state before the merge (`None` for a first sighting).
    pub before: Option<Posting>,
    pub after: Posting,
    pub transition: Transition,
    /// `false` when the merge reproduced the stored content exactly. Callers
    /// skip the write and the outbox event in that case.
    pub changed: bool,
}

impl Mutation {
    pub fn is_create(&self) -> bool {
        self.before.is_none()
    }
}

/// Merge `record` into `existing`.
///
/// Remote-owned fields are overwritten from the record, locally-owned fields
/// are left alone, the raw snapshot is replaced (a pushed event is patched
/// into the previous snapshot), and every derived field is recomputed from
/// the new snapshot before the remote stage is fed to the state machine.
///
/// Pure and idempotent: merging the same record twice yields `changed ==
/// false` the second time.
pub fn reconcile(
    existing: Option<&Posting>,
    tenant: &str,
    entity_hint: EntityType,
    record: &RemoteRecord,
    policy: &Policy,
) -> Result<Mutation, ReconcileError> {
    let number = record.posting_number().trim();
    if number.is_empty() {
        return Err(ReconcileError::MissingPostingNumber);
    }

    let mut after = match existing {
        Some(p) => {
            if p.tenant != tenant {
                return Err(ReconcileError::TenantMismatch {
                    posting_number: p.posting_number.clone(),
                    existing: p.tenant.clone(),
                    incoming: tenant.to_string(),
                });
            }
            p.clone()
        }
        None => {
            let entity = record.declared_entity_type().unwrap_or(entity_hint);
            Posting::skeleton(tenant, number, entity)
        }
    };

    let raw: Value = match record {
        RemoteRecord::Snapshot(s) => s.raw.clone(),
        RemoteRecord::Event(e) => {
            let mut raw = after.raw_snapshot.clone();
            e.patch_snapshot(&mut raw);
            raw
        }
    };
    let snap = PostingSnapshot::from_raw(&raw)?;

    apply_remote_fields(&mut after, &snap);
    recompute_derived(&mut after, &snap)?;
    after.raw_snapshot = raw;

    let stage = after.remote_stage();
    let transition = observe_remote(&mut after, stage, policy);

    let changed = match existing {
        Some(before) => !before.same_content(&after),
        None => true,
    };

    Ok(Mutation {
        before: existing.cloned(),
        after,
        transition,
        changed,
    })
}

fn apply_remote_fields(posting: &mut Posting, snap: &PostingSnapshot) {
    posting.remote_status = snap.status.trim().to_string();
    posting.remote_substatus = snap.substatus.clone();
    posting.in_process_at = snap.in_process_at;
    posting.shipment_date = snap.shipment_date;
    posting.delivering_date = snap.delivering_date;
    posting.delivered_at = snap.delivered_at;
    posting.cancel_reason = snap.cancel_reason().map(str::to_string);
    posting.remote_tracking_number = snap.tracking_number.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use mps_fulfillment::{apply_command, Effect, FulfillmentCommand};
    use mps_schemas::OperationStatus;
    use serde_json::json;

    fn snapshot(v: Value) -> RemoteRecord {
        RemoteRecord::decode_snapshot(v).unwrap()
    }

    fn merge(existing: Option<&Posting>, record: &RemoteRecord) -> Mutation {
        reconcile(existing, "t1", EntityType::PostingFbs, record, &Policy::default()).unwrap()
    }

    #[test]
    fn first_sighting_creates_skeleton_and_derives() {
        let rec = snapshot(json!({
            "posting_number": "123-1",
            "status": "awaiting_packaging",
            "delivery_schema": "FBO",
            "products": [{"sku": "S1", "quantity": 3, "price": "2.00"}]
        }));
        let m = merge(None, &rec);
        assert!(m.is_create());
        assert!(m.changed);
        assert_eq!(m.after.entity_type, EntityType::PostingFbo);
        assert_eq!(m.after.total_price_micros, 6_000_000);
        assert_eq!(m.after.operation_status, OperationStatus::AwaitingStock);
    }

    #[test]
    fn same_record_twice_is_noop() {
        let rec = snapshot(json!({"posting_number": "123-1", "status": "delivered"}));
        let first = merge(None, &rec);
        assert_eq!(first.transition.effects, vec![Effect::DeductStock]);

        let second = merge(Some(&first.after), &rec);
        assert!(!second.changed);
        assert!(second.transition.is_noop());
    }

    #[test]
    fn raw_snapshot_rederives_same_remote_fields() {
        let rec = snapshot(json!({
            "posting_number": "123-1",
            "status": "delivering",
            "substatus": "posting_in_carriage",
            "shipment_date": "2024-01-02T10:00:00Z",
            "cancellation": {"cancel_reason": null},
            "tracking_number": "TRK-1",
            "products": [{"sku": 1, "price": "5"}],
            "warehouse": {"id": 4}
        }));
        let p = merge(None, &rec).after;

        let replay = snapshot(p.raw_snapshot.clone());
        let again = merge(Some(&p), &replay);
        assert!(!again.changed);
        assert_eq!(again.after.remote_status, p.remote_status);
        assert_eq!(again.after.shipment_date, p.shipment_date);
        assert_eq!(again.after.skus, p.skus);
    }

    #[test]
    fn replay_with_collation_ordered_tracking_is_noop() {
        let rec = snapshot(json!({
            "posting_number": "123-1",
            "status": "delivering",
            "tracking_number": "AB1"
        }));
        let mut p = merge(None, &rec).after;
        p.tracking_numbers = vec!["AB1".into(), "AB-2".into(), "AB3".into()];

        let again = merge(Some(&p), &rec);
        assert!(!again.changed);
        assert_eq!(again.after.tracking_numbers.len(), 3);
    }

    #[test]
    fn local_fields_survive_remote_overwrite() {
        let rec = snapshot(json!({"posting_number": "123-1", "status": "awaiting_packaging"}));
        let mut p = merge(None, &rec).after;
        p.notes = Some("gift wrap".into());
        p.purchase_price_micros = Some(1_000_000);
        apply_command(&mut p, &FulfillmentCommand::PrepareStock).unwrap();

        let later = snapshot(json!({"posting_number": "123-1", "status": "awaiting_deliver"}));
        let m = merge(Some(&p), &later);
        assert!(m.changed);
        assert_eq!(m.after.remote_status, "awaiting_deliver");
        assert_eq!(m.after.notes.as_deref(), Some("gift wrap"));
        assert_eq!(m.after.purchase_price_micros, Some(1_000_000));
        assert_eq!(m.after.operation_status, OperationStatus::Allocated);
    }

    #[test]
    fn later_record_in_same_batch_wins_without_regressing_status() {
        let a = snapshot(json!({"posting_number": "123-1", "status": "awaiting_packaging", "shipment_date": "2024-01-01T00:00:00Z"}));
        let b = snapshot(json!({"posting_number": "123-1", "status": "awaiting_packaging", "shipment_date": "2024-01-03T00:00:00Z"}));

        let mut p = merge(None, &a).after;
        p.operation_status = OperationStatus::Printed;

        let m = merge(Some(&p), &b);
        assert_eq!(m.after.shipment_date, b_shipment(&b));
        assert_eq!(m.after.operation_status, OperationStatus::Printed);

        let replay = merge(Some(&m.after), &b);
        assert!(!replay.changed);
    }

    fn b_shipment(r: &RemoteRecord) -> Option<chrono::DateTime<chrono::Utc>> {
        match r {
            RemoteRecord::Snapshot(s) => s.snapshot.shipment_date,
            RemoteRecord::Event(_) => None,
        }
    }

    #[test]
    fn event_patches_previous_snapshot() {
        let base = snapshot(json!({
            "posting_number": "123-1",
            "status": "delivering",
            "products": [{"sku": "S1", "price": "4.00"}]
        }));
        let p = merge(None, &base).after;

        let ev = RemoteRecord::decode_event(
            EventKind::Delivered,
            &json!({"posting_number": "123-1", "delivered_at": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        let m = merge(Some(&p), &ev);
        assert_eq!(m.after.operation_status, OperationStatus::Delivered);
        assert_eq!(m.after.delivered_at.map(|t| t.to_rfc3339()), Some("2024-01-01T00:00:00+00:00".to_string()));
        assert_eq!(m.after.skus, vec!["S1".to_string()]);

        let dup = merge(Some(&m.after), &ev);
        assert!(!dup.changed);
    }

    #[test]
    fn status_event_after_cancellation_drops_stale_reason() {
        let base = snapshot(json!({"posting_number": "123-1", "status": "awaiting_deliver"}));
        let p = merge(None, &base).after;

        let cancel = RemoteRecord::decode_event(
            EventKind::Cancelled,
            &json!({"posting_number": "123-1", "cancel_reason": "buyer changed mind"}),
        )
        .unwrap();
        let cancelled = merge(Some(&p), &cancel).after;
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("buyer changed mind"));

        let revived = RemoteRecord::decode_event(
            EventKind::StatusChanged,
            &json!({"posting_number": "123-1", "status": "delivering"}),
        )
        .unwrap();
        let m = merge(Some(&cancelled), &revived);
        assert_eq!(m.after.remote_status, "delivering");
        assert_eq!(m.after.cancel_reason, None);
        assert!(m.after.raw_snapshot.get("cancellation").is_none());

        let again = merge(Some(&m.after), &snapshot(m.after.raw_snapshot.clone()));
        assert_eq!(again.after.cancel_reason, None);
    }

    #[test]
    fn foreign_tenant_is_rejected() {
        let rec = snapshot(json!({"posting_number": "123-1", "status": "delivered"}));
        let p = merge(None, &rec).after;
        let err = reconcile(Some(&p), "t2", EntityType::PostingFbs, &rec, &Policy::default())
            .unwrap_err();
        assert!(matches!(err, ReconcileError::TenantMismatch { .. }));
    }

    #[test]
    fn existing_posting_keeps_entity_type() {
        let rec = snapshot(json!({"posting_number": "123-1", "status": "awaiting_packaging"}));
        let p = merge(None, &rec).after;
        let fbo = snapshot(json!({"posting_number": "123-1", "status": "awaiting_packaging", "delivery_schema": "fbo"}));
        let m = merge(Some(&p), &fbo);
        assert_eq!(m.after.entity_type, EntityType::PostingFbs);
    }
}
