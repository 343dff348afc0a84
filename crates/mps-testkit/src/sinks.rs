use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use mps_audit::{AuditRecord, AuditSink};
use mps_runtime::{DeliveryError, OutboxSink};
use mps_schemas::OutboxEvent;

/// Outbox sink that records deliveries. Queued failures are returned first.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<OutboxEvent>>,
    failures: Mutex<VecDeque<DeliveryError>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, err: DeliveryError) {
        lock(&self.failures).push_back(err);
    }

    pub fn delivered(&self) -> Vec<OutboxEvent> {
        lock(&self.delivered).clone()
    }
}

#[async_trait]
impl OutboxSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, event: &OutboxEvent) -> Result<(), DeliveryError> {
        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }
        lock(&self.delivered).push(event.clone());
        Ok(())
    }
}

/// Audit sink that keeps every record in memory.
#[derive(Default)]
pub struct RecordingAudit {
    records: Mutex<Vec<AuditRecord>>,
}

impl RecordingAudit {
    pub fn records(&self) -> Vec<AuditRecord> {
        lock(&self.records).clone()
    }
}

impl AuditSink for RecordingAudit {
    fn emit(&self, record: AuditRecord) {
        lock(&self.records).push(record);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
