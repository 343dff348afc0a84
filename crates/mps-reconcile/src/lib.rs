//! mps-reconcile
//!
//! Shared merge logic for both input channels (pull pages and pushed events).
//!
//! - `record`: boundary decoder turning raw platform JSON into a typed
//!   [`RemoteRecord`], keeping unknown fields in an extras bag.
//! - `derive`: denormalized fields recomputed from the raw snapshot.
//! - `merge`: the [`reconcile`] function itself.
//!
//! Deterministic, pure logic. No IO.

mod derive;
mod merge;
mod record;

pub use derive::{price_to_micros, recompute_derived};
pub use merge::{reconcile, Mutation};
pub use record::*;

/// Business-rule violations raised while reconciling one record.
///
/// The sync engine counts these as failed records and keeps going; the
/// webhook path marks the event failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("record has no posting_number")]
    MissingPostingNumber,

    #[error("event {kind} requires field '{field}'")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("undecodable record: {0}")]
    Decode(String),

    #[error("invalid price '{value}' for sku {sku}: {reason}")]
    InvalidPrice {
        sku: String,
        value: String,
        reason: String,
    },

    #[error("posting {posting_number} belongs to tenant {existing}, record came from {incoming}")]
    TenantMismatch {
        posting_number: String,
        existing: String,
        incoming: String,
    },
}
