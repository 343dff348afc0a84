use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mps_runtime::{DeliveryError, OutboxSink};
use mps_schemas::OutboxEvent;
use serde_json::json;

use crate::clip_body;

/// POSTs each outbox event as JSON. `X-Event-Id` lets the consumer dedup
/// redeliveries.
#[derive(Debug, Clone)]
pub struct HttpSink {
    http: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("outbox http client build failed")?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl OutboxSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn deliver(&self, event: &OutboxEvent) -> Result<(), DeliveryError> {
        let body = json!({
            "event_id": event.event_id,
            "aggregate_type": event.aggregate_type,
            "aggregate_id": event.aggregate_id,
            "event_type": event.event_type,
            "payload": event.payload,
            "created_at": event.created_at,
        });
        let resp = self
            .http
            .post(&self.url)
            .header("X-Event-Id", event.event_id.to_string())
            .header("X-Event-Type", &event.event_type)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Retryable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = clip_body(&resp.text().await.unwrap_or_default());
        let msg = format!("status={} body={}", status.as_u16(), text);
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(DeliveryError::Retryable(msg))
        } else {
            Err(DeliveryError::Permanent(msg))
        }
    }
}
