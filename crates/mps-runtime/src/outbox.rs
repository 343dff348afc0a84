//! Outbox dispatcher.
//!
//! Rows are leased (their `next_retry_at` pushed forward) before delivery, so
//! two dispatchers never hand the same row to the sink at the same time and a
//! crashed dispatcher's rows become due again once the lease expires.
//! Delivery is at-least-once; consumers dedup on `event_id`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use mps_db::Store;
use mps_schemas::{truncate_error, OutboxEvent};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery failed: {0}")]
    Retryable(String),
    #[error("delivery rejected: {0}")]
    Permanent(String),
}

/// Downstream consumer of outbox events.
#[async_trait]
pub trait OutboxSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, event: &OutboxEvent) -> Result<(), DeliveryError>;
}

/// Writes every event to the tracing log. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl OutboxSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, event: &OutboxEvent) -> Result<(), DeliveryError> {
        tracing::info!(
            event_id = %event.event_id,
            aggregate_id = %event.aggregate_id,
            event_type = %event.event_type,
            payload = %event.payload,
            "outbox event"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct OutboxDispatcher {
    store: Arc<dyn Store>,
    sink: Arc<dyn OutboxSink>,
    retry: RetryPolicy,
    batch_size: i64,
    lease: chrono::Duration,
    error_max_len: usize,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        sink: Arc<dyn OutboxSink>,
        retry: RetryPolicy,
        batch_size: i64,
        lease: Duration,
        error_max_len: usize,
    ) -> Self {
        Self {
            store,
            sink,
            retry,
            batch_size: batch_size.max(1),
            lease: chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60)),
            error_max_len,
        }
    }

    pub fn from_config(
        cfg: &mps_config::AppConfig,
        store: Arc<dyn Store>,
        sink: Arc<dyn OutboxSink>,
    ) -> Self {
        Self::new(
            store,
            sink,
            RetryPolicy::from_config(&cfg.outbox.retry),
            cfg.outbox.batch_size,
            Duration::from_secs(cfg.outbox.lease_secs.max(1) as u64),
            cfg.error_max_len,
        )
    }

    /// Claim one batch of due rows and deliver them in order.
    pub async fn dispatch_once(&self) -> Result<DispatchReport> {
        let now = Utc::now();
        let batch = self
            .store
            .outbox_claim_due(now, self.batch_size, now + self.lease)
            .await?;

        let mut report = DispatchReport {
            claimed: batch.len(),
            ..Default::default()
        };

        for event in &batch {
            match self.sink.deliver(event).await {
                Ok(()) => {
                    self.store.outbox_mark_sent(event.event_id, Utc::now()).await?;
                    report.sent += 1;
                }
                Err(DeliveryError::Permanent(msg)) => {
                    let msg = truncate_error(&msg, self.error_max_len);
                    self.store.outbox_mark_failed(event.event_id, &msg).await?;
                    tracing::warn!(event_id = %event.event_id, sink = self.sink.name(), error = %msg, "outbox event rejected");
                    report.failed += 1;
                }
                Err(DeliveryError::Retryable(msg)) => {
                    let msg = truncate_error(&msg, self.error_max_len);
                    let attempts = (event.retry_count.max(0) as u32) + 1;
                    if self.retry.allows_another(attempts) {
                        let delay = chrono::Duration::from_std(self.retry.delay_for(attempts))
                            .unwrap_or(chrono::Duration::seconds(1));
                        self.store
                            .outbox_mark_retry(event.event_id, Utc::now() + delay, &msg)
                            .await?;
                        tracing::info!(event_id = %event.event_id, attempts, delay_ms = delay.num_milliseconds(), error = %msg, "outbox delivery deferred");
                        report.retried += 1;
                    } else {
                        self.store.outbox_mark_failed(event.event_id, &msg).await?;
                        tracing::warn!(event_id = %event.event_id, attempts, error = %msg, "outbox delivery gave up");
                        report.failed += 1;
                    }
                }
            }
        }

        if report.claimed > 0 {
            tracing::debug!(
                claimed = report.claimed,
                sent = report.sent,
                retried = report.retried,
                failed = report.failed,
                "outbox batch dispatched"
            );
        }
        Ok(report)
    }

    /// Poll every `interval` until `shutdown` flips to `true`.
    pub fn spawn(self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = self.dispatch_once().await {
                            tracing::warn!(error = %format!("{e:#}"), "outbox dispatch failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!(sink = self.sink.name(), "outbox dispatcher stopped");
        })
    }
}
