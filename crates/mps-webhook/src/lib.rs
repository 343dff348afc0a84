//! mps-webhook
//!
//! WebhookIngestor: signature verification, tenant resolution, idempotent
//! persistence, dispatch to the shared mutation pipeline, manual retry.
//!
//! Transport-independent: the daemon maps HTTP headers into
//! [`IncomingWebhook`] and [`IngestError::http_status`] back to a status code.

mod dispatch;
mod error;
mod ingest;
mod signature;
mod tenants;

pub use dispatch::{is_ping, DispatchTable, Route, PING_EVENT_TYPES};
pub use error::IngestError;
pub use ingest::{
    Disposition, IncomingWebhook, IngestResponse, IngestSettings, WebhookIngestor, HEADER_EVENT_ID,
    HEADER_EVENT_TYPE, HEADER_SIGNATURE,
};
pub use signature::{derive_event_id, sign_body, verify_signature, SignatureMismatch};
pub use tenants::TenantDirectory;
