//! Command handler modules for mps-cli.
//!
//! Shared utilities used by multiple command paths live here.
//! Command-specific logic lives in the submodules.

pub mod outbox;
pub mod sync;
pub mod webhook;

use anyhow::{Context, Result};
use mps_config::{
    load_layered_yaml, report_unused_keys, resolve_secrets, AppConfig, ResolvedSecrets,
    UnusedKeyPolicy,
};
use mps_daemon::wiring::Engine;
use mps_schemas::EntityType;

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse a CLI `--entity` string into an [`EntityType`].
pub fn parse_entity(s: &str) -> Result<EntityType> {
    EntityType::parse(s.trim()).with_context(|| {
        format!("invalid --entity '{s}'. expected one of: posting_fbs | posting_fbo")
    })
}

pub struct Loaded {
    pub cfg: AppConfig,
    pub secrets: ResolvedSecrets,
    pub config_hash: String,
}

/// Load, check and resolve the layered config.
pub fn load(paths: &[String]) -> Result<Loaded> {
    let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = load_layered_yaml(&path_refs)?;
    report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)?;
    let cfg = loaded.app_config()?;
    let secrets = resolve_secrets(&cfg);
    Ok(Loaded {
        cfg,
        secrets,
        config_hash: loaded.config_hash,
    })
}

/// Load config and connect the engine.
pub async fn connect(paths: &[String]) -> Result<(Loaded, Engine)> {
    let loaded = load(paths)?;
    let engine = Engine::connect(&loaded.cfg, &loaded.secrets).await?;
    Ok((loaded, engine))
}

pub fn config_hash(paths: &[String], strict: bool) -> Result<()> {
    let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = load_layered_yaml(&path_refs)?;
    let policy = if strict {
        UnusedKeyPolicy::Fail
    } else {
        UnusedKeyPolicy::Warn
    };
    let report = report_unused_keys(&loaded.config_json, policy)?;
    loaded.app_config()?;

    println!("config_hash={}", loaded.config_hash);
    for p in &report.unused_leaf_pointers {
        println!("unused_key={p}");
    }
    println!("{}", loaded.canonical_json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_names_parse() {
        assert_eq!(parse_entity("posting_fbs").unwrap(), EntityType::PostingFbs);
        assert_eq!(parse_entity(" posting_fbo ").unwrap(), EntityType::PostingFbo);
        let err = parse_entity("orders").unwrap_err();
        assert!(format!("{err:#}").contains("posting_fbs | posting_fbo"));
    }
}
