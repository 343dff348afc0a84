use std::sync::Arc;
use std::time::Duration;

use mps_audit::AuditSink;
use mps_config::AppConfig;
use mps_db::Store;
use mps_fulfillment::Policy;

use crate::{RemoteGateway, RetryPolicy};

/// Knobs the engine reads on every run.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub lookback: chrono::Duration,
    pub full_window: chrono::Duration,
    pub page_size: u32,
    pub page_delay: Duration,
    pub fetch_timeout: Duration,
    /// `0` = unbounded.
    pub max_pages: u32,
    pub fetch_retry: RetryPolicy,
    pub policy: Policy,
    pub max_merge_attempts: u32,
    pub error_max_len: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            lookback: chrono::Duration::minutes(cfg.sync.lookback_minutes.max(0)),
            full_window: chrono::Duration::days(cfg.sync.full_sync_days.max(1)),
            page_size: cfg.platform.page_size,
            page_delay: Duration::from_millis(cfg.sync.page_delay_ms),
            fetch_timeout: Duration::from_secs(cfg.sync.fetch_timeout_secs.max(1)),
            max_pages: cfg.sync.max_pages,
            fetch_retry: RetryPolicy::from_config(&cfg.sync.retry),
            policy: Policy {
                preserve_manual: cfg.fulfillment.preserve_manual,
            },
            max_merge_attempts: cfg.fulfillment.max_merge_attempts.max(1),
            error_max_len: cfg.error_max_len,
        }
    }
}

/// Everything the engine, the ingestor and the admin surface share.
///
/// Constructed once at startup. Cheap to clone.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn RemoteGateway>,
    pub audit: Arc<dyn AuditSink>,
    pub settings: Arc<EngineSettings>,
}

impl EngineContext {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn RemoteGateway>,
        audit: Arc<dyn AuditSink>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            audit,
            settings: Arc::new(settings),
        }
    }

    pub fn truncate(&self, msg: &str) -> String {
        mps_schemas::truncate_error(msg, self.settings.error_max_len)
    }
}
