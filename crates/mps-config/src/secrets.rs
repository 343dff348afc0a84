//! Runtime secret resolution.
//!
//! Config YAML stores only env var NAMES. [`resolve_secrets`] is called once
//! at startup and the result is passed into constructors. `Debug` output
//! redacts every value, and errors mention the env var NAME only.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::AppConfig;

#[derive(Clone, Default)]
pub struct ResolvedSecrets {
    pub database_url: Option<String>,
    pub platform_client_id: Option<String>,
    pub platform_api_key: Option<String>,
    /// Tenant id → webhook HMAC secret. Tenants without a configured or
    /// non-empty secret are absent.
    pub webhook_secrets: BTreeMap<String, String>,
    database_url_env: String,
    platform_api_key_env: String,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tenants: Vec<&str> = self.webhook_secrets.keys().map(String::as_str).collect();
        f.debug_struct("ResolvedSecrets")
            .field("database_url", &self.database_url.as_ref().map(|_| "<REDACTED>"))
            .field(
                "platform_client_id",
                &self.platform_client_id.as_ref().map(|_| "<REDACTED>"),
            )
            .field(
                "platform_api_key",
                &self.platform_api_key.as_ref().map(|_| "<REDACTED>"),
            )
            .field("webhook_secrets_for", &tenants)
            .finish()
    }
}

impl ResolvedSecrets {
    pub fn require_database_url(&self) -> Result<&str> {
        match self.database_url.as_deref() {
            Some(v) => Ok(v),
            None => bail!(
                "SECRETS_MISSING: required env var '{}' (database url) is not set or empty",
                self.database_url_env
            ),
        }
    }

    pub fn require_platform_api_key(&self) -> Result<&str> {
        match self.platform_api_key.as_deref() {
            Some(v) => Ok(v),
            None => bail!(
                "SECRETS_MISSING: required env var '{}' (platform api key) is not set or empty",
                self.platform_api_key_env
            ),
        }
    }

    pub fn webhook_secret(&self, tenant: &str) -> Option<&str> {
        self.webhook_secrets.get(tenant).map(String::as_str)
    }
}

/// Returns `None` if the variable is unset or blank.
fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve every secret the config names from the process environment.
///
/// Nothing is required here; callers use the `require_*` accessors for the
/// secrets their entry point needs.
pub fn resolve_secrets(cfg: &AppConfig) -> ResolvedSecrets {
    let mut webhook_secrets = BTreeMap::new();
    for t in &cfg.tenants {
        if let Some(secret) = t.webhook_secret_env.as_deref().and_then(resolve_env) {
            webhook_secrets.insert(t.id.clone(), secret);
        }
    }

    ResolvedSecrets {
        database_url: resolve_env(&cfg.database.url_env),
        platform_client_id: resolve_env(&cfg.platform.client_id_env),
        platform_api_key: resolve_env(&cfg.platform.api_key_env),
        webhook_secrets,
        database_url_env: cfg.database.url_env.clone(),
        platform_api_key_env: cfg.platform.api_key_env.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TenantConfig;

    #[test]
    fn debug_redacts_values() {
        let mut s = ResolvedSecrets {
            database_url: Some("postgres://user:hunter2@db/mps".into()),
            platform_api_key: Some("key-123456".into()),
            ..Default::default()
        };
        s.webhook_secrets.insert("acme".into(), "topsecret".into());
        let dbg = format!("{s:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(!dbg.contains("key-123456"));
        assert!(!dbg.contains("topsecret"));
        assert!(dbg.contains("acme"));
    }

    #[test]
    fn missing_secret_error_names_the_variable() {
        let mut cfg = AppConfig::default();
        cfg.database.url_env = "MPS_TEST_DB_URL_THAT_IS_NEVER_SET".into();
        cfg.tenants.push(TenantConfig {
            id: "acme".into(),
            webhook_secret_env: Some("MPS_TEST_SECRET_THAT_IS_NEVER_SET".into()),
            seller_ids: vec![],
        });
        let s = resolve_secrets(&cfg);
        let err = s.require_database_url().unwrap_err().to_string();
        assert!(err.contains("MPS_TEST_DB_URL_THAT_IS_NEVER_SET"));
        assert_eq!(s.webhook_secret("acme"), None);
    }
}
