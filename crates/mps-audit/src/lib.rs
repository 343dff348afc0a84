//! mps-audit
//!
//! Fire-and-forget before/after records for posting mutations.
//!
//! [`AuditSink::emit`] never blocks and never fails: the primary mutation has
//! already committed by the time it is called, and a full queue or a broken
//! file only costs the audit line (logged at `warn`).
//!
//! The file sink writes hash-chained JSON Lines so tampering is detectable
//! with [`verify_hash_chain`].

mod writer;

pub use writer::{compute_entry_hash, verify_hash_chain, verify_hash_chain_str, AuditEntry, AuditWriter, VerifyResult};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One mutation as seen by the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts_utc: DateTime<Utc>,
    /// `sync`, `webhook` or `operator`.
    pub actor: String,
    pub action: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub before: Option<Value>,
    pub after: Value,
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, record: AuditRecord);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn emit(&self, _record: AuditRecord) {}
}

/// Bounded queue in front of a hash-chained [`AuditWriter`] running on a
/// blocking thread.
#[derive(Clone)]
pub struct JsonlAuditSink {
    tx: mpsc::Sender<AuditRecord>,
    dropped: Arc<AtomicU64>,
}

impl JsonlAuditSink {
    /// Open (or resume) the log at `path` and start the writer thread.
    ///
    /// The thread exits once every sender clone is dropped; await the handle
    /// to flush the queue on shutdown.
    pub fn spawn(path: impl Into<PathBuf>, capacity: usize) -> Result<(Self, JoinHandle<()>)> {
        let mut writer = AuditWriter::open(path.into())?;
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(capacity.max(1));

        let handle = tokio::task::spawn_blocking(move || {
            while let Some(record) = rx.blocking_recv() {
                if let Err(e) = writer.append(record) {
                    tracing::warn!(error = %e, "audit append failed");
                }
            }
        });

        Ok((
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        ))
    }

    /// Records lost to a full or closed queue since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for JsonlAuditSink {
    fn emit(&self, record: AuditRecord) {
        if let Err(e) = self.tx.try_send(record) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "audit record dropped");
        }
    }
}
