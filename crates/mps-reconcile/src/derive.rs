use mps_schemas::Posting;

use crate::{PostingSnapshot, ReconcileError};

/// Recompute every denormalized field of `posting` from `snap`.
///
/// Tracking numbers only grow: the remote number is unioned with numbers an
/// operator already submitted.
pub fn recompute_derived(posting: &mut Posting, snap: &PostingSnapshot) -> Result<(), ReconcileError> {
    let mut skus: Vec<String> = snap
        .products
        .iter()
        .map(|p| p.sku.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    skus.sort();
    skus.dedup();

    let mut total: i64 = 0;
    for p in &snap.products {
        if p.price.trim().is_empty() {
            continue;
        }
        let unit = price_to_micros(&p.price).map_err(|reason| ReconcileError::InvalidPrice {
            sku: p.sku.clone(),
            value: p.price.clone(),
            reason,
        })?;
        let line = unit
            .checked_mul(p.quantity.max(0))
            .ok_or_else(|| ReconcileError::InvalidPrice {
                sku: p.sku.clone(),
                value: p.price.clone(),
                reason: "line total overflow".to_string(),
            })?;
        total = total.saturating_add(line);
    }

    if let Some(n) = &snap.tracking_number {
        posting.add_tracking_number(n);
    }

    posting.skus = skus;
    posting.total_price_micros = total;
    posting.has_tracking = !posting.tracking_numbers.is_empty();
    Ok(())
}

/// Parse a non-negative decimal string into integer micros.
///
/// At most 6 fractional digits; anything finer would need rounding.
pub fn price_to_micros(s: &str) -> Result<i64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty price".to_string());
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s.starts_with('-') {
        return Err("negative price not allowed".to_string());
    }

    let mut parts = s.split('.');
    let int_part = parts.next().unwrap_or("0");
    let frac_part = parts.next();
    if parts.next().is_some() {
        return Err("invalid decimal format".to_string());
    }

    if int_part.is_empty() || !int_part.chars().all(|c| c.is_ascii_digit()) {
        return Err("invalid integer part".to_string());
    }
    let int_val: i64 = int_part
        .parse()
        .map_err(|e| format!("parse int part failed: {e}"))?;

    let frac_micros: i64 = match frac_part {
        None | Some("") => 0,
        Some(frac) => {
            if !frac.chars().all(|c| c.is_ascii_digit()) {
                return Err("invalid fractional part".to_string());
            }
            if frac.len() > 6 {
                return Err("more than 6 fractional digits".to_string());
            }
            let padded = format!("{frac:0<6}");
            padded
                .parse()
                .map_err(|e| format!("parse fractional part failed: {e}"))?
        }
    };

    int_val
        .checked_mul(1_000_000)
        .and_then(|v| v.checked_add(frac_micros))
        .ok_or_else(|| "price overflow".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mps_schemas::EntityType;
    use serde_json::json;

    #[test]
    fn price_to_micros_basic() {
        assert_eq!(price_to_micros("0").unwrap(), 0);
        assert_eq!(price_to_micros("1.23").unwrap(), 1_230_000);
        assert_eq!(price_to_micros("001.2300").unwrap(), 1_230_000);
        assert_eq!(price_to_micros("+5.000001").unwrap(), 5_000_001);
        assert_eq!(price_to_micros("7.").unwrap(), 7_000_000);
    }

    #[test]
    fn price_to_micros_rejects_bad_input() {
        assert!(price_to_micros("-1").is_err());
        assert!(price_to_micros("1.1234567").is_err());
        assert!(price_to_micros("1,50").is_err());
        assert!(price_to_micros(".5").is_err());
    }

    #[test]
    fn derived_fields_follow_snapshot() {
        let snap = PostingSnapshot::from_raw(&json!({
            "posting_number": "1-1",
            "tracking_number": "TRK-9",
            "products": [
                {"sku": "B", "quantity": 2, "price": "10.50"},
                {"sku": "A", "quantity": 1, "price": "1"},
                {"sku": "B", "quantity": 1, "price": "0.25"}
            ]
        }))
        .unwrap();
        let mut p = Posting::skeleton("t", "1-1", EntityType::PostingFbs);
        p.add_tracking_number("OP-1");
        recompute_derived(&mut p, &snap).unwrap();

        assert_eq!(p.skus, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(p.total_price_micros, 22_250_000);
        assert_eq!(p.tracking_numbers, vec!["OP-1".to_string(), "TRK-9".to_string()]);
        assert!(p.has_tracking);
    }

    #[test]
    fn bad_price_is_a_business_error() {
        let snap = PostingSnapshot::from_raw(&json!({
            "posting_number": "1-1",
            "products": [{"sku": "A", "price": "abc"}]
        }))
        .unwrap();
        let mut p = Posting::skeleton("t", "1-1", EntityType::PostingFbs);
        let err = recompute_derived(&mut p, &snap).unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidPrice { .. }));
    }
}
