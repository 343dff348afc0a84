//! mps-schemas
//!
//! Shared domain types for the posting reconciliation engine. Pure data:
//! no IO, no business rules beyond status parsing and small helpers.

mod outbox;
mod posting;
mod sync;
mod webhook;

pub use outbox::*;
pub use posting::*;
pub use sync::*;
pub use webhook::*;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EntityType
// ---------------------------------------------------------------------------

/// Remote entity families that are pulled incrementally.
///
/// Both families reconcile into the same [`Posting`] aggregate; each has its
/// own checkpoint row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Seller-fulfilled postings.
    PostingFbs,
    /// Marketplace-fulfilled postings.
    PostingFbo,
}

impl EntityType {
    pub const ALL: [EntityType; 2] = [EntityType::PostingFbs, EntityType::PostingFbo];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::PostingFbs => "posting_fbs",
            EntityType::PostingFbo => "posting_fbo",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "posting_fbs" | "fbs" => Ok(EntityType::PostingFbs),
            "posting_fbo" | "fbo" => Ok(EntityType::PostingFbo),
            other => Err(anyhow!(
                "invalid entity type '{}'. expected one of: posting_fbs | posting_fbo",
                other
            )),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate type name used on outbox rows and webhook links.
pub const AGGREGATE_POSTING: &str = "posting";

/// Truncate an error message to at most `max_chars` characters.
///
/// Cuts on a char boundary and appends `…` when anything was removed, so the
/// stored message is still visibly incomplete.
pub fn truncate_error(msg: &str, max_chars: usize) -> String {
    if msg.chars().count() <= max_chars {
        return msg.to_string();
    }
    let mut out: String = msg.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_round_trips_through_str() {
        for e in EntityType::ALL {
            assert_eq!(EntityType::parse(e.as_str()).unwrap(), e);
        }
        assert_eq!(EntityType::parse(" FBS ").unwrap(), EntityType::PostingFbs);
        assert!(EntityType::parse("returns").is_err());
    }

    #[test]
    fn truncate_error_respects_char_boundaries() {
        assert_eq!(truncate_error("short", 10), "short");
        let long = "ошибка ".repeat(20);
        let t = truncate_error(&long, 12);
        assert_eq!(t.chars().count(), 12);
        assert!(t.ends_with('…'));
    }
}
