//! Typed configuration sections. Every field has a default so a partial
//! YAML document is always valid.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub platform: PlatformConfig,
    pub sync: SyncConfig,
    pub webhook: WebhookConfig,
    pub outbox: OutboxConfig,
    pub fulfillment: FulfillmentConfig,
    pub audit: AuditConfig,
    pub server: ServerConfig,
    pub tenants: Vec<TenantConfig>,
    /// Stored error messages are cut to this many characters.
    pub error_max_len: usize,
}

impl AppConfig {
    pub fn from_json(v: &Value) -> Result<Self> {
        let cfg: AppConfig =
            serde_json::from_value(v.clone()).context("config does not match AppConfig")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.error_max_len == 0 {
            bail!("CONFIG_INVALID: error_max_len must be > 0");
        }
        if self.platform.page_size == 0 {
            bail!("CONFIG_INVALID: platform.page_size must be > 0");
        }
        if self.webhook.follow_up.workers == 0 || self.webhook.follow_up.capacity == 0 {
            bail!("CONFIG_INVALID: webhook.follow_up workers and capacity must be > 0");
        }
        if self.outbox.batch_size <= 0 {
            bail!("CONFIG_INVALID: outbox.batch_size must be > 0");
        }
        for retry in [&self.sync.retry, &self.outbox.retry, &self.platform.retry] {
            if retry.max_attempts == 0 {
                bail!("CONFIG_INVALID: retry.max_attempts must be >= 1");
            }
        }
        if self.outbox.sink.kind == SinkKind::Http && self.outbox.sink.url.is_none() {
            bail!("CONFIG_INVALID: outbox.sink.url is required when outbox.sink.kind = http");
        }
        let mut seen = std::collections::BTreeSet::new();
        for t in &self.tenants {
            if t.id.trim().is_empty() {
                bail!("CONFIG_INVALID: tenant id must not be blank");
            }
            if !seen.insert(t.id.as_str()) {
                bail!("CONFIG_INVALID: duplicate tenant id '{}'", t.id);
            }
        }
        Ok(())
    }

    pub fn tenant(&self, id: &str) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| t.id == id)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            platform: PlatformConfig::default(),
            sync: SyncConfig::default(),
            webhook: WebhookConfig::default(),
            outbox: OutboxConfig::default(),
            fulfillment: FulfillmentConfig::default(),
            audit: AuditConfig::default(),
            server: ServerConfig::default(),
            tenants: Vec::new(),
            error_max_len: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Env var NAME holding the connection URL.
    pub url_env: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url_env: "MPS_DATABASE_URL".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub base_url: String,
    pub client_id_env: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub page_size: u32,
    pub retry: RetryConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9400".to_string(),
            client_id_env: "MPS_PLATFORM_CLIENT_ID".to_string(),
            api_key_env: "MPS_PLATFORM_API_KEY".to_string(),
            timeout_secs: 30,
            page_size: 100,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Incremental runs re-read this far behind the watermark.
    pub lookback_minutes: i64,
    /// Window a full sync covers.
    pub full_sync_days: i64,
    pub page_delay_ms: u64,
    /// Upper bound on one remote fetch, retries excluded.
    pub fetch_timeout_secs: u64,
    /// Pages fetched per run before the engine stops and leaves the rest for
    /// the next trigger. `0` means unbounded.
    pub max_pages: u32,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lookback_minutes: 30,
            full_sync_days: 30,
            page_delay_ms: 200,
            fetch_timeout_secs: 30,
            max_pages: 0,
            retry: RetryConfig::default(),
        }
    }
}

/// Behaviour for tenants with no webhook secret configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsignedMode {
    /// Accept unsigned payloads with `verified = false` and a warning.
    Accept,
    /// Reject with 401 like a failed signature.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowUpConfig {
    pub capacity: usize,
    pub workers: usize,
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            workers: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub unsigned_mode: UnsignedMode,
    /// A `processing` row untouched for this long is considered abandoned.
    pub stale_processing_secs: i64,
    pub max_payload_bytes: usize,
    pub follow_up: FollowUpConfig,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            unsigned_mode: UnsignedMode::Accept,
            stale_processing_secs: 300,
            max_payload_bytes: 1024 * 1024,
            follow_up: FollowUpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Log,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Log,
            url: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub batch_size: i64,
    pub interval_ms: u64,
    pub lease_secs: i64,
    pub retry: RetryConfig,
    pub sink: SinkConfig,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            interval_ms: 1000,
            lease_secs: 60,
            retry: RetryConfig {
                max_attempts: 10,
                base_delay_ms: 1000,
                max_delay_ms: 300_000,
            },
            sink: SinkConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FulfillmentConfig {
    /// Protect operator-finalized states from remote cancellation.
    pub preserve_manual: bool,
    /// Re-merge attempts after an optimistic version conflict.
    pub max_merge_attempts: u32,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            preserve_manual: true,
            max_merge_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSONL file. `None` disables auditing.
    pub path: Option<String>,
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8899".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id: String,
    /// Env var NAME holding the HMAC secret. Absent = no secret configured.
    #[serde(default)]
    pub webhook_secret_env: Option<String>,
    /// Remote seller identifiers that resolve to this tenant.
    #[serde(default)]
    pub seller_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = AppConfig::from_json(&json!({})).unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.error_max_len, 1000);
        assert!(cfg.fulfillment.preserve_manual);
        assert_eq!(cfg.webhook.unsigned_mode, UnsignedMode::Accept);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = AppConfig::from_json(&json!({
            "sync": {"lookback_minutes": 5},
            "webhook": {"unsigned_mode": "reject"},
            "tenants": [{"id": "acme", "webhook_secret_env": "ACME_WEBHOOK_SECRET"}]
        }))
        .unwrap();
        assert_eq!(cfg.sync.lookback_minutes, 5);
        assert_eq!(cfg.sync.page_delay_ms, 200);
        assert_eq!(cfg.webhook.unsigned_mode, UnsignedMode::Reject);
        assert_eq!(
            cfg.tenant("acme").and_then(|t| t.webhook_secret_env.as_deref()),
            Some("ACME_WEBHOOK_SECRET")
        );
    }

    #[test]
    fn duplicate_tenants_are_rejected() {
        let err = AppConfig::from_json(&json!({"tenants": [{"id": "a"}, {"id": "a"}]})).unwrap_err();
        assert!(err.to_string().contains("duplicate tenant"));
    }
}
