//! mps-testkit
//!
//! In-process doubles for the engine's collaborators:
//! - [`MemStore`]: `Store` with real transaction semantics (staged writes,
//!   rollback on drop, optimistic version checks) and fault injection
//! - [`ScriptedGateway`]: replays a queue of pages / errors
//! - [`RecordingSink`], [`RecordingAudit`]: capture what was emitted
//!
//! Plus [`test_context`] wiring them into an `EngineContext` with zero delays.

mod gateway;
mod mem_store;
mod sinks;

pub use gateway::ScriptedGateway;
pub use mem_store::{Faults, MemStore};
pub use sinks::{RecordingAudit, RecordingSink};

use std::sync::Arc;
use std::time::Duration;

use mps_runtime::{EngineContext, EngineSettings, RetryPolicy};
use serde_json::{json, Value};

/// Engine settings with no sleeping: zero page delay, millisecond backoff.
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        page_delay: Duration::ZERO,
        fetch_timeout: Duration::from_secs(2),
        fetch_retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..EngineSettings::default()
    }
}

pub struct TestEnv {
    pub ctx: EngineContext,
    pub store: Arc<MemStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub audit: Arc<RecordingAudit>,
}

pub fn test_context() -> TestEnv {
    test_context_with(fast_settings())
}

pub fn test_context_with(settings: EngineSettings) -> TestEnv {
    let store = Arc::new(MemStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let audit = Arc::new(RecordingAudit::default());
    let ctx = EngineContext::new(store.clone(), gateway.clone(), audit.clone(), settings);
    TestEnv {
        ctx,
        store,
        gateway,
        audit,
    }
}

/// Minimal platform snapshot.
pub fn snapshot(posting_number: &str, status: &str) -> Value {
    json!({
        "posting_number": posting_number,
        "status": status,
        "products": [{"sku": "SKU-1", "quantity": 1, "price": "10.00"}],
    })
}

/// Snapshot with a `last_changed_at` stamp (drives the checkpoint watermark).
pub fn snapshot_at(posting_number: &str, status: &str, changed_at: &str) -> Value {
    let mut v = snapshot(posting_number, status);
    v["last_changed_at"] = Value::String(changed_at.to_string());
    v
}
