use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mps_schemas::EntityType;
use serde_json::Value;

/// One page request. `cursor` is opaque and comes back from the previous
/// page; `since..to` bounds the remote last-modified time.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub tenant: String,
    pub entity_type: EntityType,
    pub cursor: Option<String>,
    pub since: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    /// Raw platform records, decoded by the caller one by one.
    pub records: Vec<Value>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote rate limit hit")]
    RateLimited { retry_after: Option<Duration> },

    #[error("remote server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("remote rejected request {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("undecodable remote response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Timeouts, rate limits, 5xx and transport failures are worth another
    /// attempt; a 4xx or a malformed body is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_)
                | GatewayError::RateLimited { .. }
                | GatewayError::Server { .. }
                | GatewayError::Transport(_)
        )
    }

    /// Retry classification for [`RetryPolicy::run`](crate::RetryPolicy::run):
    /// `None` when permanent, otherwise the platform's `Retry-After` (zero
    /// when absent).
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after } => Some(retry_after.unwrap_or(Duration::ZERO)),
            e if e.is_retryable() => Some(Duration::ZERO),
            _ => None,
        }
    }
}

/// The remote marketplace, pull side.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn pull(&self, req: &PullRequest) -> Result<Page, GatewayError>;

    /// Single posting by number. `Ok(None)` when the platform does not know it.
    async fn fetch_posting(
        &self,
        tenant: &str,
        entity_type: EntityType,
        posting_number: &str,
    ) -> Result<Option<Value>, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_hint_carries_retry_after() {
        let limited = GatewayError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(limited.retry_hint(), Some(Duration::from_secs(3)));
        assert_eq!(
            GatewayError::RateLimited { retry_after: None }.retry_hint(),
            Some(Duration::ZERO)
        );
        assert_eq!(GatewayError::Transport("reset".into()).retry_hint(), Some(Duration::ZERO));
        let rejected = GatewayError::Rejected {
            status: 400,
            body: String::new(),
        };
        assert_eq!(rejected.retry_hint(), None);
    }
}
