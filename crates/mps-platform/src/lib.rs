//! mps-platform
//!
//! HTTP clients for the outside world:
//! - [`PlatformGateway`]: marketplace posting API (pull side of sync and
//!   webhook follow-ups)
//! - [`HttpSink`]: downstream consumer of outbox events
//!
//! Credentials are passed in already resolved; never log them.

mod gateway;
mod sink;

pub use gateway::PlatformGateway;
pub use sink::HttpSink;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mps_config::{SinkConfig, SinkKind};
use mps_runtime::{GatewayError, LogSink, OutboxSink};

/// Outbox sink selected by `outbox.sink`.
pub fn outbox_sink_from_config(cfg: &SinkConfig) -> Result<Arc<dyn OutboxSink>> {
    match cfg.kind {
        SinkKind::Log => Ok(Arc::new(LogSink)),
        SinkKind::Http => {
            let url = cfg
                .url
                .clone()
                .context("CONFIG_INVALID: outbox.sink.url is required for the http sink")?;
            let sink = HttpSink::new(url, Duration::from_secs(cfg.timeout_secs.max(1)))?;
            Ok(Arc::new(sink))
        }
    }
}

/// Map an HTTP status + body into the gateway error taxonomy.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: String, retry_after: Option<Duration>) -> GatewayError {
    let code = status.as_u16();
    if code == 429 {
        GatewayError::RateLimited { retry_after }
    } else if status.is_server_error() {
        GatewayError::Server { status: code, body }
    } else {
        GatewayError::Rejected { status: code, body }
    }
}

pub(crate) fn transport_error(e: reqwest::Error, timeout: Duration) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(timeout)
    } else if e.is_decode() {
        GatewayError::Decode(e.to_string())
    } else {
        GatewayError::Transport(e.to_string())
    }
}

pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Error bodies are echoed into logs and rows; keep them short.
pub(crate) fn clip_body(body: &str) -> String {
    mps_schemas::truncate_error(body, 512)
}
