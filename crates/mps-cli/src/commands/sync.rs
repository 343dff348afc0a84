use std::time::Duration;

use anyhow::Result;
use mps_runtime::{SyncEngine, SyncOutcome};
use mps_schemas::EntityType;
use uuid::Uuid;

use super::connect;

pub async fn run(paths: &[String], tenant: &str, entity_type: EntityType, full: bool) -> Result<()> {
    let (loaded, engine) = connect(paths).await?;
    if loaded.cfg.tenant(tenant).is_none() {
        anyhow::bail!("unknown tenant '{tenant}' (not in config tenants)");
    }

    let batch_id = Uuid::new_v4();
    let outcome = SyncEngine::new(engine.ctx.clone())
        .run(batch_id, tenant, entity_type, full, None)
        .await;
    engine.close(Duration::from_secs(5)).await;

    match outcome? {
        SyncOutcome::Paused => {
            println!("paused=true tenant={tenant} entity_type={entity_type}");
        }
        SyncOutcome::Finished(report) => {
            println!("batch_id={}", report.batch_id);
            println!("config_hash={}", loaded.config_hash);
            println!("status={}", report.status.as_str());
            println!("pages={}", report.pages);
            println!(
                "processed={} success={} failed={} skipped={}",
                report.counts.processed,
                report.counts.success,
                report.counts.failed,
                report.counts.skipped
            );
            if let Some(e) = report.error {
                println!("error={e}");
            }
        }
    }
    Ok(())
}

pub async fn checkpoints(paths: &[String], tenant: Option<&str>) -> Result<()> {
    let (_loaded, engine) = connect(paths).await?;
    let list = engine.ctx.store.checkpoint_list(tenant).await?;
    for cp in &list {
        println!(
            "tenant={} entity_type={} status={} paused={} cursor={} watermark={} retry_count={}",
            cp.tenant,
            cp.entity_type,
            cp.status.as_str(),
            cp.is_paused(),
            cp.cursor.as_deref().unwrap_or("NULL"),
            cp.watermark
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "NULL".to_string()),
            cp.retry_count
        );
    }
    engine.close(Duration::from_secs(5)).await;
    Ok(())
}
