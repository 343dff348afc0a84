use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Ignored,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Pending => "pending",
            WebhookStatus::Processing => "processing",
            WebhookStatus::Processed => "processed",
            WebhookStatus::Failed => "failed",
            WebhookStatus::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(WebhookStatus::Pending),
            "processing" => Ok(WebhookStatus::Processing),
            "processed" => Ok(WebhookStatus::Processed),
            "failed" => Ok(WebhookStatus::Failed),
            "ignored" => Ok(WebhookStatus::Ignored),
            other => Err(anyhow!("invalid webhook status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WebhookStatus::Processed | WebhookStatus::Failed | WebhookStatus::Ignored
        )
    }

    /// Statuses the manual-retry operation accepts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WebhookStatus::Failed | WebhookStatus::Ignored)
    }
}

/// Durable record of one pushed event. Created before handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Row identifier handed back to callers.
    pub id: Uuid,
    /// Sender-provided event id (or the derived one when absent).
    pub event_id: String,
    pub idempotency_key: String,
    pub event_type: String,
    pub tenant: String,
    pub payload: Value,
    pub signature: Option<String>,
    pub verified: bool,
    pub status: WebhookStatus,
    pub retry_count: i32,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Insert shape for [`WebhookEvent`]; the row starts in `processing`.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub id: Uuid,
    pub event_id: String,
    pub idempotency_key: String,
    pub event_type: String,
    pub tenant: String,
    pub payload: Value,
    pub signature: Option<String>,
    pub verified: bool,
    pub status: WebhookStatus,
    pub received_at: DateTime<Utc>,
}

/// Terminal outcome written once handling finishes.
#[derive(Debug, Clone)]
pub struct WebhookCompletion {
    pub status: WebhookStatus,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    /// Already truncated.
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}
