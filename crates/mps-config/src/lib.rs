//! mps-config
//!
//! Layered YAML configuration:
//! - later documents override earlier ones (deep merge)
//! - the merged document is canonicalized and hashed (sha256) so every run
//!   and log line can name the exact configuration it used
//! - literal secrets are rejected; YAML only carries env var NAMES
//! - leaves no component reads are reported (warn or fail)
//!
//! Typed access goes through [`AppConfig`]; secret values through
//! [`resolve_secrets`].

mod secrets;
mod settings;

pub use secrets::{resolve_secrets, ResolvedSecrets};
pub use settings::*;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;

/// If any leaf string value in the effective config starts with one of these,
/// loading aborts with CONFIG_SECRET_DETECTED.
const SECRET_PREFIXES: &[&str] = &[
    "sk-",
    "sk_live",
    "sk_test",
    "AKIA",
    "-----BEGIN",
    "ghp_",
    "gho_",
    "glpat-",
    "xoxb-",
    "xoxp-",
    "whsec_",
];

/// JSON-pointer prefixes some component actually reads. A leaf under any of
/// these is consumed; anything else is reported as unused.
pub const CONSUMED_POINTERS: &[&str] = &[
    "/database",
    "/platform",
    "/sync",
    "/webhook",
    "/outbox",
    "/fulfillment",
    "/audit",
    "/server",
    "/tenants",
    "/error_max_len",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusedKeyReport {
    /// Minimal set of unused leaf pointers (sorted).
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

/// Produce an unused-key report. With `policy == Fail`, unused keys are an
/// error; with `Warn` this always returns `Ok(report)`.
pub fn report_unused_keys(config_json: &Value, policy: UnusedKeyPolicy) -> Result<UnusedKeyReport> {
    let consumed: Vec<Vec<&str>> = CONSUMED_POINTERS.iter().map(|p| segments(p)).collect();

    let mut unused = BTreeSet::new();
    walk_leaves(config_json, &mut Vec::new(), &mut |path, _| {
        let read = consumed
            .iter()
            .any(|c| c.len() <= path.len() && c.iter().zip(path).all(|(a, b)| *a == b.as_str()));
        if !read {
            unused.insert(to_pointer(path));
        }
    });

    let report = UnusedKeyReport {
        unused_leaf_pointers: unused.into_iter().collect(),
    };

    if policy == UnusedKeyPolicy::Fail && !report.is_clean() {
        let first: Vec<&String> = report.unused_leaf_pointers.iter().take(12).collect();
        bail!(
            "CONFIG_UNUSED_KEYS: {} unused config leaf key(s) detected. First few: {:?}",
            report.unused_leaf_pointers.len(),
            first
        );
    }
    Ok(report)
}

/// "/a/b/" -> ["a", "b"]. Tokens are compared unescaped.
fn segments(pointer: &str) -> Vec<&str> {
    pointer.split('/').filter(|s| !s.is_empty()).collect()
}

fn to_pointer(path: &[String]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter()
        .map(|t| format!("/{}", t.replace('~', "~0").replace('/', "~1")))
        .collect()
}

/// Visit every scalar leaf with its key path. Array indices become path
/// segments too.
fn walk_leaves<'v>(v: &'v Value, path: &mut Vec<String>, f: &mut impl FnMut(&[String], &'v Value)) {
    match v {
        Value::Object(map) => {
            for (k, child) in map {
                path.push(k.clone());
                walk_leaves(child, path, f);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                path.push(i.to_string());
                walk_leaves(child, path, f);
                path.pop();
            }
        }
        leaf => f(path, leaf),
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

impl LoadedConfig {
    /// Typed view of the merged document. Missing keys take their defaults.
    pub fn app_config(&self) -> Result<AppConfig> {
        AppConfig::from_json(&self.config_json)
    }
}

/// Read each path in order and merge; later files win.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let docs = paths
        .iter()
        .map(|p| fs::read_to_string(p).with_context(|| format!("config layer unreadable: {p}")))
        .collect::<Result<Vec<String>>>()?;
    load_layered_yaml_from_strings(&docs.iter().map(String::as_str).collect::<Vec<_>>())
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());
    for (i, raw) in yaml_docs.iter().enumerate() {
        let layer: serde_yaml::Value =
            serde_yaml::from_str(raw).with_context(|| format!("config layer {i} is not yaml"))?;
        // empty document
        if layer.is_null() {
            continue;
        }
        let layer = serde_json::to_value(layer)
            .with_context(|| format!("config layer {i} has no json form"))?;
        overlay(&mut merged, layer);
    }

    enforce_no_secret_literals(&merged)?;

    let canonical_json = serde_json::to_string(&merged).context("config serialize failed")?;
    Ok(LoadedConfig {
        config_hash: hex::encode(Sha256::digest(canonical_json.as_bytes())),
        canonical_json,
        config_json: merged,
    })
}

/// Objects merge key by key; any other value replaces what was there.
fn overlay(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(into), Value::Object(from)) => {
            for (k, v) in from {
                match into.get_mut(&k) {
                    Some(slot) => overlay(slot, v),
                    None => {
                        into.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn enforce_no_secret_literals(v: &Value) -> Result<()> {
    let mut hit: Option<String> = None;
    walk_leaves(v, &mut Vec::new(), &mut |path, leaf| {
        if hit.is_none() && leaf.as_str().is_some_and(looks_like_secret) {
            hit = Some(to_pointer(path));
        }
    });
    match hit {
        Some(ptr) => bail!("CONFIG_SECRET_DETECTED leaf={ptr} value=REDACTED"),
        None => Ok(()),
    }
}

fn looks_like_secret(s: &str) -> bool {
    let t = s.trim();
    t.len() >= 8 && SECRET_PREFIXES.iter().any(|p| t.starts_with(p))
}
