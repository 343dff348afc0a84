use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::AuditRecord;

/// Namespace for deterministic entry ids.
const ENTRY_NS: Uuid = Uuid::from_u128(0x6d70_735f_6175_6469_745f_656e_7472_7900);

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub seq: u64,
    pub ts_utc: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub before: Option<Value>,
    pub after: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// Append-only hash-chained JSONL writer. Holds the file open for the
/// lifetime of the writer.
pub struct AuditWriter {
    file: File,
    last_hash: Option<String>,
    seq: u64,
}

impl AuditWriter {
    /// Open `path`, resuming the chain from its last line if the file exists.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("audit dir {}", dir.display()))?;
        }

        let tail = match fs::read_to_string(&path) {
            Ok(content) => last_entry(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("audit log read {}", path.display()))
            }
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("audit log open {}", path.display()))?;

        let (last_hash, seq) = match tail {
            Some(e) => (e.hash_self, e.seq + 1),
            None => (None, 0),
        };
        Ok(Self {
            file,
            last_hash,
            seq,
        })
    }

    /// Sequence number the next entry will carry.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    pub fn append(&mut self, r: AuditRecord) -> Result<AuditEntry> {
        let prev = self.last_hash.as_deref().unwrap_or("GENESIS");
        let entry_id = Uuid::new_v5(
            &ENTRY_NS,
            format!("{prev}:{}:{}", self.seq, r.aggregate_id).as_bytes(),
        );

        let mut entry = AuditEntry {
            entry_id,
            seq: self.seq,
            ts_utc: r.ts_utc,
            actor: r.actor,
            action: r.action,
            aggregate_type: r.aggregate_type,
            aggregate_id: r.aggregate_id,
            before: r.before,
            after: r.after,
            hash_prev: self.last_hash.clone(),
            hash_self: None,
        };
        let digest = compute_entry_hash(&entry)?;
        entry.hash_self = Some(digest.clone());

        let mut line = canonical(&entry)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .context("audit line write failed")?;

        self.last_hash = Some(digest);
        self.seq += 1;
        Ok(entry)
    }
}

fn last_entry(content: &str) -> Result<Option<AuditEntry>> {
    let Some(line) = content.lines().map(str::trim).rfind(|l| !l.is_empty()) else {
        return Ok(None);
    };
    let entry = serde_json::from_str(line).context("last audit entry is not valid json")?;
    Ok(Some(entry))
}

/// Compact JSON, object keys in sorted order at every depth.
fn canonical<T: Serialize>(v: &T) -> Result<String> {
    let mut value = serde_json::to_value(v).context("audit entry serialize failed")?;
    sort_objects(&mut value);
    serde_json::to_string(&value).context("audit entry stringify failed")
}

fn sort_objects(v: &mut Value) {
    match v {
        Value::Object(map) => {
            let mut pairs: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, child) in pairs.iter_mut() {
                sort_objects(child);
            }
            *map = pairs.into_iter().collect::<Map<String, Value>>();
        }
        Value::Array(items) => items.iter_mut().for_each(sort_objects),
        _ => {}
    }
}

/// SHA-256 of the canonical line with `hash_self` blanked.
pub fn compute_entry_hash(entry: &AuditEntry) -> Result<String> {
    let unsealed = AuditEntry {
        hash_self: None,
        ..entry.clone()
    };
    Ok(hex::encode(Sha256::digest(canonical(&unsealed)?.as_bytes())))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}

pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("audit log read {}", path.display()))?;
    verify_hash_chain_str(&content)
}

/// Walk the log top to bottom. `line` in a `Broken` result is 1-based and
/// counts blank lines.
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut expected_prev: Option<String> = None;
    let mut lines = 0usize;

    let numbered = content
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty());

    for (line_no, raw) in numbered {
        let entry: AuditEntry = serde_json::from_str(raw)
            .with_context(|| format!("audit entry at line {line_no} is not valid json"))?;
        lines += 1;

        if let Some(reason) = chain_break(&entry, expected_prev.as_deref())? {
            return Ok(VerifyResult::Broken {
                line: line_no,
                reason,
            });
        }
        expected_prev = entry.hash_self;
    }

    Ok(VerifyResult::Valid { lines })
}

fn chain_break(entry: &AuditEntry, expected_prev: Option<&str>) -> Result<Option<String>> {
    if entry.hash_prev.as_deref() != expected_prev {
        return Ok(Some(format!(
            "hash_prev {:?} does not link to {:?}",
            entry.hash_prev, expected_prev
        )));
    }
    let recomputed = compute_entry_hash(entry)?;
    if entry.hash_self.as_deref() != Some(recomputed.as_str()) {
        return Ok(Some(format!(
            "hash_self {:?} != recomputed {recomputed}",
            entry.hash_self
        )));
    }
    Ok(None)
}
