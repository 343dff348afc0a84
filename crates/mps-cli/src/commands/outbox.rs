use std::time::Duration;

use anyhow::Result;
use mps_daemon::wiring;

use super::connect;

pub async fn dispatch_once(paths: &[String]) -> Result<()> {
    let (loaded, engine) = connect(paths).await?;
    let result = match wiring::outbox_dispatcher(&engine.ctx, &loaded.cfg) {
        Ok(dispatcher) => dispatcher.dispatch_once().await,
        Err(e) => Err(e),
    };
    engine.close(Duration::from_secs(5)).await;

    let report = result?;
    println!(
        "claimed={} sent={} retried={} failed={}",
        report.claimed, report.sent, report.retried, report.failed
    );
    Ok(())
}
