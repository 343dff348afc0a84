//! Boundary decoder for platform payloads.
//!
//! Known shapes are normalized here, once. Everything the decoder does not
//! recognise is retained in an `extras` map so a later release can pick it up
//! from the stored raw snapshot without another fetch.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use mps_schemas::{EntityType, RemoteStage};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::ReconcileError;

// ---------------------------------------------------------------------------
// RemoteRecord
// ---------------------------------------------------------------------------

/// One normalized observation of a remote posting.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteRecord {
    /// Full record from a pull page or a single-posting fetch.
    Snapshot(SnapshotRecord),
    /// Partial observation pushed by the platform.
    Event(PostingEvent),
}

impl RemoteRecord {
    /// Decode a full record. `raw` is kept verbatim.
    pub fn decode_snapshot(raw: Value) -> Result<Self, ReconcileError> {
        let snapshot = PostingSnapshot::from_raw(&raw)?;
        Ok(RemoteRecord::Snapshot(SnapshotRecord { snapshot, raw }))
    }

    /// Decode a pushed event payload of a known kind.
    pub fn decode_event(kind: EventKind, payload: &Value) -> Result<Self, ReconcileError> {
        PostingEvent::decode(kind, payload).map(RemoteRecord::Event)
    }

    pub fn posting_number(&self) -> &str {
        match self {
            RemoteRecord::Snapshot(s) => &s.snapshot.posting_number,
            RemoteRecord::Event(e) => &e.posting_number,
        }
    }

    /// Remote last-modified time, used to advance the sync watermark.
    pub fn last_changed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            RemoteRecord::Snapshot(s) => s.snapshot.last_changed_at.or(s.snapshot.in_process_at),
            RemoteRecord::Event(e) => e.occurred_at,
        }
    }

    /// Entity family the record declares, if any.
    pub fn declared_entity_type(&self) -> Option<EntityType> {
        let schema = match self {
            RemoteRecord::Snapshot(s) => s.snapshot.delivery_schema.as_deref(),
            RemoteRecord::Event(e) => e.delivery_schema.as_deref(),
        }?;
        match schema.trim().to_ascii_lowercase().as_str() {
            "fbs" | "rfbs" => Some(EntityType::PostingFbs),
            "fbo" => Some(EntityType::PostingFbo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub snapshot: PostingSnapshot,
    pub raw: Value,
}

// ---------------------------------------------------------------------------
// Full posting snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PostingSnapshot {
    pub posting_number: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "opt_string")]
    pub substatus: Option<String>,
    #[serde(default, deserialize_with = "opt_ts")]
    pub in_process_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "opt_ts")]
    pub shipment_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "opt_ts")]
    pub delivering_date: Option<DateTime<Utc>>,
    #[serde(default, alias = "fact_delivery_date", deserialize_with = "opt_ts")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancellation: Option<Cancellation>,
    #[serde(default, deserialize_with = "opt_string")]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default, alias = "last_changed_status_date", deserialize_with = "opt_ts")]
    pub last_changed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "opt_string")]
    pub delivery_schema: Option<String>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, Value>,
}

impl PostingSnapshot {
    pub fn from_raw(raw: &Value) -> Result<Self, ReconcileError> {
        if !raw.is_object() {
            return Err(ReconcileError::Decode("record is not a JSON object".to_string()));
        }
        let snap: PostingSnapshot =
            serde_json::from_value(raw.clone()).map_err(|e| ReconcileError::Decode(e.to_string()))?;
        if snap.posting_number.trim().is_empty() {
            return Err(ReconcileError::MissingPostingNumber);
        }
        Ok(snap)
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancellation
            .as_ref()
            .and_then(|c| c.cancel_reason.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Cancellation {
    #[serde(default, deserialize_with = "opt_string")]
    pub cancel_reason: Option<String>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Product {
    #[serde(deserialize_with = "lossy_string")]
    pub sku: String,
    #[serde(default = "one")]
    pub quantity: i64,
    /// Decimal string as sent by the platform.
    #[serde(default, deserialize_with = "lossy_string")]
    pub price: String,
    #[serde(flatten)]
    pub extras: BTreeMap<String, Value>,
}

fn one() -> i64 {
    1
}

// ---------------------------------------------------------------------------
// Pushed events
// ---------------------------------------------------------------------------

/// Kinds of pushed posting events the engine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    StatusChanged,
    Delivered,
    Cancelled,
    ShipmentDateChanged,
    DeliveryDateChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::StatusChanged => "status_changed",
            EventKind::Delivered => "delivered",
            EventKind::Cancelled => "cancelled",
            EventKind::ShipmentDateChanged => "shipment_date_changed",
            EventKind::DeliveryDateChanged => "delivery_date_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostingEvent {
    pub kind: EventKind,
    pub posting_number: String,
    pub status: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub shipment_date: Option<DateTime<Utc>>,
    pub delivering_date: Option<DateTime<Utc>>,
    pub tracking_number: Option<String>,
    pub delivery_schema: Option<String>,
    pub extras: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct EventWire {
    #[serde(default, deserialize_with = "opt_string")]
    posting_number: Option<String>,
    #[serde(default, alias = "new_state", deserialize_with = "opt_string")]
    status: Option<String>,
    #[serde(default, alias = "changed_state_date", deserialize_with = "opt_ts")]
    changed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "opt_ts")]
    delivered_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "opt_string")]
    cancel_reason: Option<String>,
    #[serde(default)]
    cancellation: Option<Cancellation>,
    #[serde(default, alias = "new_cutoff_date", deserialize_with = "opt_ts")]
    shipment_date: Option<DateTime<Utc>>,
    #[serde(default, alias = "new_delivery_date", deserialize_with = "opt_ts")]
    delivering_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "opt_string")]
    tracking_number: Option<String>,
    #[serde(default, deserialize_with = "opt_string")]
    delivery_schema: Option<String>,
    #[serde(flatten)]
    extras: BTreeMap<String, Value>,
}

impl PostingEvent {
    pub fn decode(kind: EventKind, payload: &Value) -> Result<Self, ReconcileError> {
        if !payload.is_object() {
            return Err(ReconcileError::Decode("payload is not a JSON object".to_string()));
        }
        let w: EventWire = serde_json::from_value(payload.clone())
            .map_err(|e| ReconcileError::Decode(e.to_string()))?;

        let posting_number = w
            .posting_number
            .filter(|s| !s.trim().is_empty())
            .ok_or(ReconcileError::MissingPostingNumber)?;

        let missing = |field: &'static str| ReconcileError::MissingField {
            kind: kind.as_str(),
            field,
        };

        let cancel_reason = w
            .cancel_reason
            .or_else(|| w.cancellation.and_then(|c| c.cancel_reason));

        let ev = PostingEvent {
            kind,
            posting_number,
            status: w.status,
            occurred_at: w.changed_at,
            delivered_at: w.delivered_at.or(w.changed_at),
            cancel_reason,
            shipment_date: w.shipment_date,
            delivering_date: w.delivering_date,
            tracking_number: w.tracking_number,
            delivery_schema: w.delivery_schema,
            extras: w.extras,
        };

        match kind {
            EventKind::StatusChanged if ev.status.is_none() => Err(missing("status")),
            EventKind::ShipmentDateChanged if ev.shipment_date.is_none() => {
                Err(missing("shipment_date"))
            }
            EventKind::DeliveryDateChanged if ev.delivering_date.is_none() => {
                Err(missing("delivering_date"))
            }
            _ => Ok(ev),
        }
    }

    /// Write this event's fields into `raw` using the platform's field names,
    /// so the snapshot stays the single source for re-derivation.
    pub fn patch_snapshot(&self, raw: &mut Value) {
        if !raw.is_object() {
            *raw = Value::Object(Map::new());
        }
        let Some(obj) = raw.as_object_mut() else {
            return;
        };

        obj.insert(
            "posting_number".to_string(),
            Value::String(self.posting_number.clone()),
        );

        let status = match self.kind {
            EventKind::Delivered => Some("delivered".to_string()),
            EventKind::Cancelled => Some("cancelled".to_string()),
            _ => self.status.clone(),
        };
        if let Some(s) = status {
            if RemoteStage::classify(&s) != RemoteStage::Cancelled {
                obj.remove("cancellation");
            }
            obj.insert("status".to_string(), Value::String(s));
        }

        if self.kind == EventKind::Delivered {
            if let Some(t) = self.delivered_at {
                obj.remove("fact_delivery_date");
                obj.insert("delivered_at".to_string(), ts_value(t));
            }
        }
        if self.kind == EventKind::Cancelled {
            let mut c = Map::new();
            if let Some(Value::Object(prev)) = obj.get("cancellation") {
                c = prev.clone();
            }
            if let Some(r) = &self.cancel_reason {
                c.insert("cancel_reason".to_string(), Value::String(r.clone()));
            }
            obj.insert("cancellation".to_string(), Value::Object(c));
        }
        if let Some(t) = self.shipment_date {
            obj.insert("shipment_date".to_string(), ts_value(t));
        }
        if let Some(t) = self.delivering_date {
            obj.insert("delivering_date".to_string(), ts_value(t));
        }
        if let Some(n) = &self.tracking_number {
            obj.insert("tracking_number".to_string(), Value::String(n.clone()));
        }
        if let Some(s) = &self.delivery_schema {
            obj.entry("delivery_schema")
                .or_insert_with(|| Value::String(s.clone()));
        }
        if let Some(t) = self.occurred_at {
            obj.remove("last_changed_status_date");
            obj.insert("last_changed_at".to_string(), ts_value(t));
        }
    }
}

fn ts_value(t: DateTime<Utc>) -> Value {
    Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

// ---------------------------------------------------------------------------
// Lenient field decoders
// ---------------------------------------------------------------------------

/// String or number → `Some(String)`; null or blank → `None`.
fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(match v {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lossy_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(opt_string(d)?.unwrap_or_default())
}

/// RFC 3339 string → timestamp; null or blank → `None`.
fn opt_ts<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let v = Option::<String>::deserialize(d)?;
    match v.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| serde::de::Error::custom(format!("bad timestamp '{s}': {e}"))),
    }
}
