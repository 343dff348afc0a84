use mps_config::{ResolvedSecrets, TenantConfig};
use serde_json::Value;

/// Payload fields that may name the sender's account, in lookup order.
const TENANT_FIELDS: [&str; 4] = ["tenant", "tenant_id", "seller_id", "company_id"];

#[derive(Clone)]
struct TenantEntry {
    id: String,
    seller_ids: Vec<String>,
    secret: Option<String>,
}

/// Configured tenants with their resolved webhook secrets.
#[derive(Clone, Default)]
pub struct TenantDirectory {
    entries: Vec<TenantEntry>,
}

impl std::fmt::Debug for TenantDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<(&str, bool)> = self
            .entries
            .iter()
            .map(|e| (e.id.as_str(), e.secret.is_some()))
            .collect();
        f.debug_struct("TenantDirectory").field("tenants_signed", &ids).finish()
    }
}

impl TenantDirectory {
    pub fn new(tenants: &[TenantConfig], secrets: &ResolvedSecrets) -> Self {
        Self {
            entries: tenants
                .iter()
                .map(|t| TenantEntry {
                    id: t.id.clone(),
                    seller_ids: t.seller_ids.clone(),
                    secret: secrets.webhook_secret(&t.id).map(str::to_string),
                })
                .collect(),
        }
    }

    /// Add or replace one tenant. Empty secrets count as unconfigured.
    pub fn with_tenant(mut self, id: &str, seller_ids: &[&str], secret: Option<&str>) -> Self {
        self.entries.retain(|e| e.id != id);
        self.entries.push(TenantEntry {
            id: id.to_string(),
            seller_ids: seller_ids.iter().map(|s| s.to_string()).collect(),
            secret: secret.filter(|s| !s.is_empty()).map(str::to_string),
        });
        self
    }

    /// Resolve the tenant a payload belongs to, by tenant id or seller id.
    pub fn resolve(&self, payload: &Value) -> Option<&str> {
        TENANT_FIELDS
            .iter()
            .filter_map(|k| field_as_string(payload, k))
            .find_map(|candidate| {
                self.entries
                    .iter()
                    .find(|e| e.id == candidate || e.seller_ids.iter().any(|s| *s == candidate))
                    .map(|e| e.id.as_str())
            })
    }

    pub fn secret(&self, tenant: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.id == tenant)
            .and_then(|e| e.secret.as_deref())
    }
}

fn field_as_string(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dir() -> TenantDirectory {
        TenantDirectory::default()
            .with_tenant("acme", &["100500"], Some("s3"))
            .with_tenant("globex", &[], None)
    }

    #[test]
    fn resolves_by_id_or_seller_id() {
        let d = dir();
        assert_eq!(d.resolve(&json!({"tenant": "globex"})), Some("globex"));
        assert_eq!(d.resolve(&json!({"seller_id": 100500})), Some("acme"));
        assert_eq!(d.resolve(&json!({"seller_id": "100500"})), Some("acme"));
        assert_eq!(d.resolve(&json!({"seller_id": 7})), None);
        assert_eq!(d.resolve(&json!({"posting_number": "1-1"})), None);
    }

    #[test]
    fn secrets_are_per_tenant() {
        let d = dir();
        assert_eq!(d.secret("acme"), Some("s3"));
        assert_eq!(d.secret("globex"), None);
        assert!(!format!("{d:?}").contains("s3"));
    }
}
