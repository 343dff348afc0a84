use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::EntityType;

// ---------------------------------------------------------------------------
// OperationStatus
// ---------------------------------------------------------------------------

/// Internally-owned fulfillment workflow state of a posting.
///
/// Declared in normal forward order; [`OperationStatus::rank`] exposes that
/// order so callers can reason about "forward" without matching every pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    AwaitingStock,
    Allocating,
    Allocated,
    TrackingConfirmed,
    Printed,
    Shipping,
    /// **Terminal.**
    Delivered,
    /// **Terminal.** Reachable from any non-terminal state.
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::AwaitingStock => "awaiting_stock",
            OperationStatus::Allocating => "allocating",
            OperationStatus::Allocated => "allocated",
            OperationStatus::TrackingConfirmed => "tracking_confirmed",
            OperationStatus::Printed => "printed",
            OperationStatus::Shipping => "shipping",
            OperationStatus::Delivered => "delivered",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "awaiting_stock" => Ok(OperationStatus::AwaitingStock),
            "allocating" => Ok(OperationStatus::Allocating),
            "allocated" => Ok(OperationStatus::Allocated),
            "tracking_confirmed" => Ok(OperationStatus::TrackingConfirmed),
            "printed" => Ok(OperationStatus::Printed),
            "shipping" => Ok(OperationStatus::Shipping),
            "delivered" => Ok(OperationStatus::Delivered),
            "cancelled" => Ok(OperationStatus::Cancelled),
            other => Err(anyhow!("invalid operation status: {}", other)),
        }
    }

    /// Position in the forward order. `Cancelled` sits outside the order and
    /// reports the highest rank so it is never "advanced" past.
    pub fn rank(&self) -> u8 {
        match self {
            OperationStatus::AwaitingStock => 0,
            OperationStatus::Allocating => 1,
            OperationStatus::Allocated => 2,
            OperationStatus::TrackingConfirmed => 3,
            OperationStatus::Printed => 4,
            OperationStatus::Shipping => 5,
            OperationStatus::Delivered => 6,
            OperationStatus::Cancelled => 7,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Delivered | OperationStatus::Cancelled)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RemoteStage
// ---------------------------------------------------------------------------

/// Coarse classification of the platform-owned lifecycle status string.
///
/// The verbatim status is always kept on the posting; this enum is what the
/// state machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStage {
    /// Accepted by the platform, not yet handed to a carrier.
    AwaitingPackaging,
    /// Packed, waiting for carrier pickup.
    AwaitingDeliver,
    /// With the carrier.
    InTransit,
    Delivered,
    Cancelled,
    /// Anything the engine does not recognise. Never drives a transition.
    Unknown,
}

impl RemoteStage {
    pub fn classify(remote_status: &str) -> Self {
        match remote_status.trim().to_ascii_lowercase().as_str() {
            "awaiting_registration" | "acceptance_in_progress" | "awaiting_approve"
            | "awaiting_packaging" => RemoteStage::AwaitingPackaging,
            "awaiting_deliver" => RemoteStage::AwaitingDeliver,
            "delivering" | "driver_pickup" | "sent_by_seller" | "in_transit" => {
                RemoteStage::InTransit
            }
            "delivered" => RemoteStage::Delivered,
            "cancelled" | "canceled" | "not_accepted" => RemoteStage::Cancelled,
            _ => RemoteStage::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Posting aggregate
// ---------------------------------------------------------------------------

/// Aggregate root: one shippable fulfillment unit.
///
/// Field ownership:
/// - remote-owned: overwritten from every remote observation
/// - locally-owned: only changed by operator commands
/// - derived: recomputed from `raw_snapshot` + tracking numbers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub tenant: String,
    /// Natural key. Immutable after creation.
    pub posting_number: String,
    pub entity_type: EntityType,

    // remote-owned
    pub remote_status: String,
    pub remote_substatus: Option<String>,
    pub in_process_at: Option<DateTime<Utc>>,
    pub shipment_date: Option<DateTime<Utc>>,
    pub delivering_date: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub remote_tracking_number: Option<String>,
    /// Latest verbatim record as seen from the platform.
    pub raw_snapshot: Value,

    // locally-owned
    pub operation_status: OperationStatus,
    pub purchase_price_micros: Option<i64>,
    pub notes: Option<String>,
    pub printed: bool,
    /// Set once the stock deduction side effect has been emitted.
    pub stock_deducted: bool,

    // derived
    pub has_tracking: bool,
    pub total_price_micros: i64,
    pub skus: Vec<String>,
    /// Deduplicated, sorted. Mirrors the `tracking_numbers` rows.
    pub tracking_numbers: Vec<String>,

    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Posting {
    /// Empty aggregate for a posting seen for the first time.
    pub fn skeleton(tenant: &str, posting_number: &str, entity_type: EntityType) -> Self {
        Self {
            tenant: tenant.to_string(),
            posting_number: posting_number.to_string(),
            entity_type,
            remote_status: String::new(),
            remote_substatus: None,
            in_process_at: None,
            shipment_date: None,
            delivering_date: None,
            delivered_at: None,
            cancel_reason: None,
            remote_tracking_number: None,
            raw_snapshot: Value::Object(Default::default()),
            operation_status: OperationStatus::AwaitingStock,
            purchase_price_micros: None,
            notes: None,
            printed: false,
            stock_deducted: false,
            has_tracking: false,
            total_price_micros: 0,
            skus: Vec::new(),
            tracking_numbers: Vec::new(),
            version: 0,
            updated_at: None,
        }
    }

    /// `true` once the row exists in the store.
    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    /// Compare business content, ignoring store bookkeeping (version, timestamps).
    pub fn same_content(&self, other: &Posting) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.version = 0;
        b.version = 0;
        a.updated_at = None;
        b.updated_at = None;
        a == b
    }

    pub fn remote_stage(&self) -> RemoteStage {
        RemoteStage::classify(&self.remote_status)
    }

    /// Add a tracking number keeping the set byte-sorted and unique. Returns
    /// `true` if it was new. The membership check does not rely on the
    /// current order.
    pub fn add_tracking_number(&mut self, number: &str) -> bool {
        let n = number.trim();
        if n.is_empty() || self.tracking_numbers.iter().any(|x| x == n) {
            return false;
        }
        self.tracking_numbers.push(n.to_string());
        self.normalize_tracking_numbers();
        true
    }

    /// Byte order, duplicates removed. Applied to lists loaded from storage,
    /// whose order depends on the database collation.
    pub fn normalize_tracking_numbers(&mut self) {
        self.tracking_numbers.sort_unstable();
        self.tracking_numbers.dedup();
    }
}

/// One row of the posting's tracking numbers (deduplicated per posting).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingNumber {
    pub posting_number: String,
    pub tracking_number: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_status_round_trips() {
        for s in [
            OperationStatus::AwaitingStock,
            OperationStatus::Allocating,
            OperationStatus::Allocated,
            OperationStatus::TrackingConfirmed,
            OperationStatus::Printed,
            OperationStatus::Shipping,
            OperationStatus::Delivered,
            OperationStatus::Cancelled,
        ] {
            assert_eq!(OperationStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(OperationStatus::parse("lost").is_err());
    }

    #[test]
    fn remote_stage_classification() {
        assert_eq!(RemoteStage::classify("awaiting_packaging"), RemoteStage::AwaitingPackaging);
        assert_eq!(RemoteStage::classify("delivering"), RemoteStage::InTransit);
        assert_eq!(RemoteStage::classify("DELIVERED"), RemoteStage::Delivered);
        assert_eq!(RemoteStage::classify("cancelled"), RemoteStage::Cancelled);
        assert_eq!(RemoteStage::classify("arbitration"), RemoteStage::Unknown);
    }

    #[test]
    fn tracking_numbers_stay_sorted_and_unique() {
        let mut p = Posting::skeleton("t1", "123-1", EntityType::PostingFbs);
        assert!(p.add_tracking_number("ZZ1"));
        assert!(p.add_tracking_number("AA9"));
        assert!(!p.add_tracking_number(" ZZ1 "));
        assert!(!p.add_tracking_number(""));
        assert_eq!(p.tracking_numbers, vec!["AA9".to_string(), "ZZ1".to_string()]);
    }

    #[test]
    fn tracking_membership_ignores_collation_order() {
        let mut p = Posting::skeleton("t1", "123-1", EntityType::PostingFbs);
        // en_US collation skips punctuation: AB1 < AB-2 < AB3
        p.tracking_numbers = vec!["AB1".into(), "AB-2".into(), "AB3".into()];
        assert!(!p.add_tracking_number("AB1"));
        assert!(!p.add_tracking_number("AB-2"));
        assert_eq!(p.tracking_numbers.len(), 3);

        p.normalize_tracking_numbers();
        assert_eq!(
            p.tracking_numbers,
            vec!["AB-2".to_string(), "AB1".to_string(), "AB3".to_string()]
        );
    }

    #[test]
    fn same_content_ignores_bookkeeping() {
        let a = Posting::skeleton("t1", "123-1", EntityType::PostingFbs);
        let mut b = a.clone();
        b.version = 7;
        b.updated_at = Some(Utc::now());
        assert!(a.same_content(&b));
        b.notes = Some("fragile".into());
        assert!(!a.same_content(&b));
    }
}
