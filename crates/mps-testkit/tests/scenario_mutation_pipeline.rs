use mps_fulfillment::CommandError;
use mps_reconcile::RemoteRecord;
use mps_runtime::{
    apply_operator, apply_remote, ApplyError, ApplyOutcome, Cause, EngineSettings, OperatorAction,
};
use mps_schemas::{EntityType, OperationStatus, Posting};
use mps_testkit::{fast_settings, snapshot, test_context, test_context_with, TestEnv};
use serde_json::json;

const T: &str = "acme";
const FBS: EntityType = EntityType::PostingFbs;

fn rec(v: serde_json::Value) -> RemoteRecord {
    RemoteRecord::decode_snapshot(v).unwrap()
}

async fn remote(env: &TestEnv, v: serde_json::Value) -> Result<ApplyOutcome, ApplyError> {
    apply_remote(&env.ctx, T, FBS, &rec(v), Cause::Sync).await
}

async fn op(env: &TestEnv, number: &str, action: OperatorAction) -> Result<ApplyOutcome, ApplyError> {
    apply_operator(&env.ctx, number, &action, "operator:alice").await
}

async fn stored(env: &TestEnv, number: &str) -> Posting {
    env.store
        .postings()
        .await
        .into_iter()
        .find(|p| p.posting_number == number)
        .unwrap()
}

#[tokio::test]
async fn committed_mutation_writes_exactly_one_outbox_row() {
    let env = test_context();
    let out = remote(&env, snapshot("1-1", "awaiting_packaging")).await.unwrap();
    assert!(matches!(out, ApplyOutcome::Created(_)));

    let outbox = env.store.outbox().await;
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].event_type, "posting.created");
    assert_eq!(outbox[0].aggregate_id, "1-1");
    assert_eq!(outbox[0].payload["cause"], "sync");
    assert_eq!(outbox[0].payload["total_price_micros"], 10_000_000);

    assert_eq!(stored(&env, "1-1").await.version, 1);
    assert_eq!(env.audit.records().len(), 1);
}

#[tokio::test]
async fn reapplying_the_same_snapshot_writes_nothing() {
    let env = test_context();
    remote(&env, snapshot("1-1", "delivered")).await.unwrap();
    let again = remote(&env, snapshot("1-1", "delivered")).await.unwrap();

    assert_eq!(again, ApplyOutcome::Unchanged);
    assert_eq!(env.store.outbox().await.len(), 1);
    assert_eq!(stored(&env, "1-1").await.version, 1);
}

#[tokio::test]
async fn failed_commit_rolls_back_posting_and_outbox() {
    let env = test_context();
    env.store.faults().fail_commits(1);

    let err = remote(&env, snapshot("1-1", "delivered")).await.unwrap_err();
    assert!(matches!(err, ApplyError::Store(_)));
    assert!(!err.is_business());

    assert!(env.store.postings().await.is_empty());
    assert!(env.store.outbox().await.is_empty());
    assert!(env.audit.records().is_empty());
}

#[tokio::test]
async fn failed_outbox_insert_rolls_back_the_posting_update() {
    let env = test_context();
    remote(&env, snapshot("1-1", "awaiting_packaging")).await.unwrap();
    env.store.faults().fail_outbox_inserts(1);

    remote(&env, snapshot("1-1", "delivered")).await.unwrap_err();

    let p = stored(&env, "1-1").await;
    assert_eq!(p.remote_status, "awaiting_packaging");
    assert_eq!(p.version, 1);
    assert!(!p.stock_deducted);
    assert_eq!(env.store.outbox().await.len(), 1);
}

#[tokio::test]
async fn version_conflict_is_remerged_from_fresh_row() {
    let env = test_context();
    remote(&env, snapshot("1-1", "awaiting_packaging")).await.unwrap();
    env.store.faults().conflict_updates(2);

    let out = remote(&env, snapshot("1-1", "delivered")).await.unwrap();
    let p = out.posting().unwrap();
    assert_eq!(p.operation_status, OperationStatus::Delivered);
    assert_eq!(p.version, 2);
    assert_eq!(env.store.outbox().await.len(), 2);
}

#[tokio::test]
async fn conflicts_beyond_merge_budget_surface_as_conflict() {
    let env = test_context_with(EngineSettings {
        max_merge_attempts: 2,
        ..fast_settings()
    });
    remote(&env, snapshot("1-1", "awaiting_packaging")).await.unwrap();
    env.store.faults().conflict_updates(5);

    let err = remote(&env, snapshot("1-1", "delivered")).await.unwrap_err();
    match err {
        ApplyError::Conflict {
            posting_number,
            attempts,
        } => {
            assert_eq!(posting_number, "1-1");
            assert_eq!(attempts, 2);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(env.store.outbox().await.len(), 1);
}

#[tokio::test]
async fn tenant_mismatch_is_rejected_as_business_error() {
    let env = test_context();
    remote(&env, snapshot("1-1", "awaiting_packaging")).await.unwrap();

    let err = apply_remote(&env.ctx, "other", FBS, &rec(snapshot("1-1", "delivered")), Cause::Webhook)
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::Reconcile(_)));
    assert!(err.is_business());
    assert_eq!(stored(&env, "1-1").await.tenant, T);
}

#[tokio::test]
async fn operator_workflow_then_remote_delivery_deducts_stock_once() {
    let env = test_context();
    remote(&env, snapshot("1-1", "awaiting_packaging")).await.unwrap();

    op(&env, "1-1", OperatorAction::PrepareStock).await.unwrap();
    op(
        &env,
        "1-1",
        OperatorAction::SubmitTracking {
            numbers: vec!["TRK-1".into(), " ".into()],
        },
    )
    .await
    .unwrap();
    op(&env, "1-1", OperatorAction::MarkPrinted).await.unwrap();
    remote(&env, snapshot("1-1", "delivering")).await.unwrap();
    remote(&env, snapshot("1-1", "delivered")).await.unwrap();

    let p = stored(&env, "1-1").await;
    assert_eq!(p.operation_status, OperationStatus::Delivered);
    assert!(p.printed);
    assert!(p.stock_deducted);
    assert_eq!(p.tracking_numbers, vec!["TRK-1".to_string()]);

    let outbox = env.store.outbox().await;
    assert_eq!(outbox.len(), 6);
    let deducts = outbox
        .iter()
        .filter(|e| {
            e.payload["effects"]
                .as_array()
                .map_or(false, |a| a.iter().any(|x| x["effect"] == "deduct_stock"))
        })
        .count();
    assert_eq!(deducts, 1);

    let printed = &outbox[3];
    assert_eq!(printed.event_type, "posting.status_changed");
    assert_eq!(printed.payload["cause"], "operator");
    assert_eq!(printed.payload["operation_status"]["to"], "printed");

    let audit = env.audit.records();
    assert!(audit
        .iter()
        .any(|r| r.actor == "operator:alice" && r.action == "mark_printed"));
}

#[tokio::test]
async fn illegal_operator_command_changes_nothing() {
    let env = test_context();
    remote(&env, snapshot("1-1", "awaiting_packaging")).await.unwrap();

    let err = op(&env, "1-1", OperatorAction::MarkPrinted).await.unwrap_err();
    match err {
        ApplyError::Command(CommandError::Illegal { from, command }) => {
            assert_eq!(from, OperationStatus::AwaitingStock);
            assert_eq!(command, "mark_printed");
        }
        other => panic!("expected illegal command, got {other:?}"),
    }
    assert_eq!(stored(&env, "1-1").await.version, 1);
    assert_eq!(env.store.outbox().await.len(), 1);
}

#[tokio::test]
async fn operator_on_unknown_posting_is_not_found() {
    let env = test_context();
    let err = op(&env, "nope", OperatorAction::Discard).await.unwrap_err();
    assert!(matches!(err, ApplyError::NotFound(n) if n == "nope"));
}

#[tokio::test]
async fn local_field_edits_emit_update_events() {
    let env = test_context();
    remote(&env, snapshot("1-1", "awaiting_packaging")).await.unwrap();

    op(
        &env,
        "1-1",
        OperatorAction::SetPurchasePrice {
            price: Some("7.25".into()),
        },
    )
    .await
    .unwrap();
    op(
        &env,
        "1-1",
        OperatorAction::SetNotes {
            notes: Some("  fragile ".into()),
        },
    )
    .await
    .unwrap();
    let same = op(
        &env,
        "1-1",
        OperatorAction::SetNotes {
            notes: Some("fragile".into()),
        },
    )
    .await
    .unwrap();
    assert_eq!(same, ApplyOutcome::Unchanged);

    let p = stored(&env, "1-1").await;
    assert_eq!(p.purchase_price_micros, Some(7_250_000));
    assert_eq!(p.notes.as_deref(), Some("fragile"));

    let outbox = env.store.outbox().await;
    assert_eq!(outbox.len(), 3);
    assert!(outbox[1..].iter().all(|e| e.event_type == "posting.updated"));

    let err = op(
        &env,
        "1-1",
        OperatorAction::SetPurchasePrice {
            price: Some("-1".into()),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApplyError::Command(CommandError::Invalid(_))));
}

#[tokio::test]
async fn remote_cancel_does_not_undo_printed_posting() {
    let env = test_context();
    remote(&env, snapshot("1-1", "awaiting_packaging")).await.unwrap();
    op(&env, "1-1", OperatorAction::PrepareStock).await.unwrap();
    op(
        &env,
        "1-1",
        OperatorAction::SubmitTracking {
            numbers: vec!["TRK-9".into()],
        },
    )
    .await
    .unwrap();
    op(&env, "1-1", OperatorAction::MarkPrinted).await.unwrap();

    remote(
        &env,
        json!({"posting_number": "1-1", "status": "cancelled",
               "cancellation": {"cancel_reason": "late"},
               "products": [{"sku": "SKU-1", "quantity": 1, "price": "10.00"}]}),
    )
    .await
    .unwrap();

    let p = stored(&env, "1-1").await;
    assert_eq!(p.operation_status, OperationStatus::Printed);
    assert_eq!(p.remote_status, "cancelled");
    assert_eq!(p.cancel_reason.as_deref(), Some("late"));
    assert!(p.stock_deducted);
    assert_eq!(
        env.store.outbox().await.last().unwrap().event_type,
        "posting.updated"
    );
}

#[tokio::test]
async fn remote_cancel_restores_deducted_stock_when_not_protected() {
    let env = test_context();
    remote(&env, snapshot("1-1", "awaiting_packaging")).await.unwrap();
    op(&env, "1-1", OperatorAction::PrepareStock).await.unwrap();

    remote(&env, snapshot("1-1", "cancelled")).await.unwrap();

    let p = stored(&env, "1-1").await;
    assert_eq!(p.operation_status, OperationStatus::Cancelled);
    assert!(!p.stock_deducted);
    let last = env.store.outbox().await.pop().unwrap();
    assert_eq!(last.payload["effects"][0]["effect"], "restore_stock");
    assert_eq!(last.payload["effects"][0]["skus"], json!(["SKU-1"]));
}
