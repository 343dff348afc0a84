use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::EntityType;

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Idle,
    Running,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Idle => "idle",
            CheckpointStatus::Running => "running",
            CheckpointStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(CheckpointStatus::Idle),
            "running" => Ok(CheckpointStatus::Running),
            "failed" => Ok(CheckpointStatus::Failed),
            other => Err(anyhow!("invalid checkpoint status: {}", other)),
        }
    }
}

/// Durable per-(tenant, entity type) progress record. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub tenant: String,
    pub entity_type: EntityType,
    /// Opaque remote continuation token committed after the last applied page.
    pub cursor: Option<String>,
    /// Highest remote last-modified time incorporated so far.
    pub watermark: Option<DateTime<Utc>>,
    pub status: CheckpointStatus,
    pub processed: i64,
    pub success: i64,
    pub failed: i64,
    pub retry_count: i32,
    /// Free-form settings (`{"paused": true}` etc).
    pub config: Value,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(tenant: &str, entity_type: EntityType) -> Self {
        Self {
            tenant: tenant.to_string(),
            entity_type,
            cursor: None,
            watermark: None,
            status: CheckpointStatus::Idle,
            processed: 0,
            success: 0,
            failed: 0,
            retry_count: 0,
            config: Value::Object(Default::default()),
            last_sync_at: None,
            last_error: None,
            updated_at: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.config
            .get("paused")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Progress committed atomically after each fully applied page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageCommit {
    pub cursor: Option<String>,
    pub watermark: Option<DateTime<Utc>>,
    pub processed: i64,
    pub success: i64,
    pub failed: i64,
}

// ---------------------------------------------------------------------------
// SyncRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Started,
    Success,
    Failed,
    /// Completed, but some records failed to apply.
    Partial,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Started => "started",
            SyncRunStatus::Success => "success",
            SyncRunStatus::Failed => "failed",
            SyncRunStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(SyncRunStatus::Started),
            "success" => Ok(SyncRunStatus::Success),
            "failed" => Ok(SyncRunStatus::Failed),
            "partial" => Ok(SyncRunStatus::Partial),
            other => Err(anyhow!("invalid sync run status: {}", other)),
        }
    }
}

/// Per-run record counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub processed: i64,
    pub success: i64,
    pub failed: i64,
    /// Records whose merge changed nothing.
    pub skipped: i64,
}

impl SyncCounts {
    pub fn add(&mut self, other: &SyncCounts) {
        self.processed += other.processed;
        self.success += other.success;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// Append-only run history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub batch_id: Uuid,
    pub tenant: String,
    pub entity_type: EntityType,
    pub full_sync: bool,
    pub status: SyncRunStatus,
    pub counts: SyncCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}
