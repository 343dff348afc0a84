use std::time::Duration;

use anyhow::Result;
use mps_daemon::wiring;
use mps_webhook::IngestResponse;
use uuid::Uuid;

use super::connect;

/// No follow-up queue in a one-shot process: a retried `posting.created`
/// leaves the full fetch to the next sync.
pub async fn retry(paths: &[String], id: Uuid) -> Result<()> {
    let (loaded, engine) = connect(paths).await?;
    let ingestor = wiring::webhook_ingestor(&engine.ctx, &loaded.cfg, &loaded.secrets, None);
    let result = ingestor.retry(id).await;
    drop(ingestor);
    engine.close(Duration::from_secs(5)).await;

    print_response(&result?);
    Ok(())
}

pub async fn recover_stale(paths: &[String], limit: i64) -> Result<()> {
    let (loaded, engine) = connect(paths).await?;
    let ingestor = wiring::webhook_ingestor(&engine.ctx, &loaded.cfg, &loaded.secrets, None);
    let result = ingestor.recover_stale(limit).await;
    drop(ingestor);
    engine.close(Duration::from_secs(5)).await;

    let recovered = result?;
    println!("recovered={}", recovered.len());
    for r in &recovered {
        print_response(r);
    }
    Ok(())
}

fn print_response(r: &IngestResponse) {
    println!(
        "id={} event_id={} disposition={} success={}{}",
        r.id.map(|i| i.to_string()).unwrap_or_else(|| "NULL".to_string()),
        r.event_id,
        serde_json::to_value(r.disposition)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default(),
        r.success,
        r.error
            .as_deref()
            .map(|e| format!(" error={e}"))
            .unwrap_or_default()
    );
}
