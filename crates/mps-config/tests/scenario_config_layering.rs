//! Layered config: hash stability, secret-literal guard, typed view.

use mps_config::{load_layered_yaml_from_strings, UnsignedMode};

const BASE_YAML: &str = r#"
database:
  url_env: "MPS_DATABASE_URL"
sync:
  lookback_minutes: 30
  page_delay_ms: 200
tenants:
  - id: "acme"
    webhook_secret_env: "ACME_WEBHOOK_SECRET"
    seller_ids: ["100200"]
"#;

const BASE_YAML_REORDERED: &str = r#"
tenants:
  - webhook_secret_env: "ACME_WEBHOOK_SECRET"
    id: "acme"
    seller_ids: ["100200"]
sync:
  page_delay_ms: 200
  lookback_minutes: 30
database:
  url_env: "MPS_DATABASE_URL"
"#;

const OVERLAY_YAML: &str = r#"
sync:
  lookback_minutes: 5
webhook:
  unsigned_mode: reject
"#;

#[test]
fn same_input_produces_identical_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
    assert_eq!(a.config_hash.len(), 64);
}

#[test]
fn key_order_does_not_change_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML_REORDERED]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
}

#[test]
fn overlay_changes_hash_and_typed_values() {
    let base = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let merged = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    assert_ne!(base.config_hash, merged.config_hash);

    let cfg = merged.app_config().unwrap();
    assert_eq!(cfg.sync.lookback_minutes, 5);
    assert_eq!(cfg.sync.page_delay_ms, 200);
    assert_eq!(cfg.webhook.unsigned_mode, UnsignedMode::Reject);
    assert_eq!(cfg.tenants[0].seller_ids, vec!["100200".to_string()]);
}

#[test]
fn literal_secret_is_rejected() {
    let yaml = r#"
tenants:
  - id: "acme"
    webhook_secret_env: "whsec_live_abcdef123456"
"#;
    let err = load_layered_yaml_from_strings(&[yaml]).unwrap_err().to_string();
    assert!(err.contains("CONFIG_SECRET_DETECTED"), "got: {err}");
    assert!(!err.contains("abcdef123456"), "value must not leak: {err}");
}
