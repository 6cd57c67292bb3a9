//! Decoding raw payloads into enriched transactions
//!
//! The wire format is one JSON object per record:
//!
//! ```json
//! {"invoice_no": 154132541653705, "country": "United Kingdom",
//!  "timestamp": "2020-09-18 06:49:43", "type": "ORDER",
//!  "items": [{"SKU": "21485", "title": "RETROSPOT HEART HOT WATER BOTTLE",
//!             "unit_price": 4.95, "quantity": 6}]}
//! ```
//!
//! Decoding is pure: the same payload always yields the same result.

use crate::error::{DecodeError, DecodeResult};
use crate::source::RawEvent;
use chrono::{DateTime, NaiveDateTime, Utc};
use retail_kpi_types::{EnrichedTransaction, LineItem, Transaction, TransactionType};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Records per decode task
const DECODE_CHUNK_SIZE: usize = 512;

/// Naive timestamp layouts accepted besides RFC 3339, read as UTC
const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

#[derive(Debug, Deserialize)]
struct WireTransaction {
    invoice_no: Option<i64>,
    country: Option<String>,
    timestamp: Option<String>,
    #[serde(rename = "type")]
    txn_type: Option<String>,
    items: Option<Vec<WireItem>>,
}

#[derive(Debug, Deserialize)]
struct WireItem {
    #[serde(rename = "SKU")]
    sku: Option<String>,
    title: Option<String>,
    unit_price: Option<f32>,
    quantity: Option<i32>,
}

fn malformed(position: &str, reason: impl Into<String>) -> DecodeError {
    DecodeError::Malformed {
        position: position.to_string(),
        reason: reason.into(),
    }
}

fn required<T>(value: Option<T>, field: &str, position: &str) -> DecodeResult<T> {
    value.ok_or_else(|| malformed(position, format!("missing field `{}`", field)))
}

/// Parse an event timestamp as UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

fn decode_item(item: WireItem, index: usize, position: &str) -> DecodeResult<LineItem> {
    let unit_price = required(item.unit_price, "unit_price", position)?;
    let quantity = required(item.quantity, "quantity", position)?;
    if !unit_price.is_finite() || unit_price < 0.0 {
        return Err(malformed(
            position,
            format!("items[{}].unit_price must be a non-negative number", index),
        ));
    }
    if quantity < 0 {
        return Err(malformed(
            position,
            format!("items[{}].quantity must not be negative", index),
        ));
    }
    Ok(LineItem {
        sku: item.sku,
        title: item.title,
        unit_price,
        quantity,
    })
}

/// Decode one payload, labelling errors with `position`
pub fn decode_payload(payload: &[u8], position: &str) -> DecodeResult<EnrichedTransaction> {
    let wire: WireTransaction =
        serde_json::from_slice(payload).map_err(|e| malformed(position, e.to_string()))?;

    let invoice_no = required(wire.invoice_no, "invoice_no", position)?;
    let country = required(wire.country, "country", position)?;
    let timestamp = required(wire.timestamp, "timestamp", position)?;
    let type_value = required(wire.txn_type, "type", position)?;

    let event_time = parse_timestamp(&timestamp)
        .ok_or_else(|| malformed(position, format!("invalid timestamp '{}'", timestamp)))?;

    let txn_type = TransactionType::parse(&type_value).ok_or_else(|| DecodeError::UnknownType {
        position: position.to_string(),
        value: type_value.clone(),
    })?;

    let items = wire
        .items
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(index, item)| decode_item(item, index, position))
        .collect::<DecodeResult<Vec<_>>>()?;

    Ok(EnrichedTransaction::enrich(Transaction {
        invoice_no,
        country,
        event_time,
        txn_type,
        items,
    }))
}

/// Decode and enrich one raw event
pub fn decode(raw: &RawEvent) -> DecodeResult<EnrichedTransaction> {
    decode_payload(&raw.payload, &raw.position_label())
}

/// Decode a batch on a bounded worker pool, keeping source order
///
/// Small batches are decoded inline. Larger ones are split into chunks and
/// at most `parallelism` chunks are decoded at once.
pub async fn decode_batch(
    events: Arc<Vec<RawEvent>>,
    parallelism: usize,
) -> crate::error::Result<Vec<DecodeResult<EnrichedTransaction>>> {
    if events.len() <= DECODE_CHUNK_SIZE || parallelism <= 1 {
        return Ok(events.iter().map(decode).collect());
    }

    let semaphore = Arc::new(Semaphore::new(parallelism));
    let mut workers = JoinSet::new();
    let chunks = events.len().div_ceil(DECODE_CHUNK_SIZE);

    for chunk in 0..chunks {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|e| crate::error::ProcessorError::Unexpected(e.to_string()))?;
        let events = Arc::clone(&events);
        workers.spawn_blocking(move || {
            let _permit = permit;
            let start = chunk * DECODE_CHUNK_SIZE;
            let end = (start + DECODE_CHUNK_SIZE).min(events.len());
            let decoded: Vec<_> = events[start..end].iter().map(decode).collect();
            (chunk, decoded)
        });
    }

    let mut parts: Vec<Option<Vec<DecodeResult<EnrichedTransaction>>>> = vec![None; chunks];
    while let Some(joined) = workers.join_next().await {
        let (chunk, decoded) = joined?;
        parts[chunk] = Some(decoded);
    }

    Ok(parts.into_iter().flatten().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(payload: &str) -> RawEvent {
        RawEvent::new(0, 7, payload)
    }

    #[test]
    fn test_decode_order() {
        let txn = decode(&raw(
            r#"{"invoice_no": 154132541653705, "country": "United Kingdom",
                "timestamp": "2020-09-18 06:49:43", "type": "ORDER",
                "items": [{"SKU": "21485", "title": "HOT WATER BOTTLE", "unit_price": 5.0, "quantity": 2},
                          {"SKU": "22111", "title": "SCOTTIE DOG", "unit_price": 1.25, "quantity": 4}]}"#,
        ))
        .unwrap();

        assert_eq!(txn.transaction.invoice_no, 154132541653705);
        assert_eq!(
            txn.event_time(),
            Utc.with_ymd_and_hms(2020, 9, 18, 6, 49, 43).unwrap()
        );
        assert_eq!(txn.transaction.items[0].sku.as_deref(), Some("21485"));
        assert_eq!(txn.total_cost, 15.0);
        assert_eq!(txn.total_items, 6);
        assert_eq!((txn.is_order, txn.is_return), (1, 0));
    }

    #[test]
    fn test_decode_return_negates() {
        let txn = decode(&raw(
            r#"{"invoice_no": 1, "country": "France", "timestamp": "2020-09-18T06:49:43Z",
                "type": "RETURN", "items": [{"unit_price": 3.0, "quantity": 1}]}"#,
        ))
        .unwrap();
        assert_eq!(txn.total_cost, -3.0);
        assert_eq!((txn.is_order, txn.is_return), (0, 1));
    }

    #[test]
    fn test_absent_or_null_items() {
        for payload in [
            r#"{"invoice_no": 1, "country": "France", "timestamp": "2020-09-18 06:49:43", "type": "ORDER"}"#,
            r#"{"invoice_no": 1, "country": "France", "timestamp": "2020-09-18 06:49:43", "type": "ORDER", "items": null}"#,
            r#"{"invoice_no": 1, "country": "France", "timestamp": "2020-09-18 06:49:43", "type": "ORDER", "items": []}"#,
        ] {
            let txn = decode(&raw(payload)).unwrap();
            assert_eq!(txn.total_cost, 0.0);
            assert_eq!(txn.total_items, 0);
        }
    }

    #[test]
    fn test_missing_timestamp_is_malformed() {
        let err = decode(&raw(
            r#"{"invoice_no": 1, "country": "France", "type": "ORDER", "items": []}"#,
        ))
        .unwrap_err();
        assert_eq!(
            err,
            DecodeError::Malformed {
                position: "0@7".to_string(),
                reason: "missing field `timestamp`".to_string(),
            }
        );
    }

    #[test]
    fn test_schema_violations() {
        let cases = [
            "not json",
            r#"{"invoice_no": "abc", "country": "France", "timestamp": "2020-09-18 06:49:43", "type": "ORDER"}"#,
            r#"{"invoice_no": 1, "country": "France", "timestamp": "yesterday", "type": "ORDER"}"#,
            r#"{"invoice_no": 1, "country": "France", "timestamp": "2020-09-18 06:49:43", "type": "ORDER",
                "items": [{"unit_price": -1.0, "quantity": 1}]}"#,
            r#"{"invoice_no": 1, "country": "France", "timestamp": "2020-09-18 06:49:43", "type": "ORDER",
                "items": [{"unit_price": 1.0, "quantity": -2}]}"#,
            r#"{"invoice_no": 1, "country": "France", "timestamp": "2020-09-18 06:49:43"}"#,
        ];
        for payload in cases {
            let err = decode(&raw(payload)).unwrap_err();
            assert_eq!(err.kind(), "malformed", "payload: {}", payload);
        }

        let invalid_utf8 = RawEvent::new(0, 0, vec![0xff, 0xfe]);
        assert!(decode(&invalid_utf8).is_err());
    }

    #[test]
    fn test_unknown_type() {
        let err = decode(&raw(
            r#"{"invoice_no": 1, "country": "France", "timestamp": "2020-09-18 06:49:43", "type": "REFUND"}"#,
        ))
        .unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownType {
                position: "0@7".to_string(),
                value: "REFUND".to_string(),
            }
        );
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2020, 9, 18, 6, 49, 43).unwrap();
        assert_eq!(parse_timestamp("2020-09-18T06:49:43Z"), Some(expected));
        assert_eq!(parse_timestamp("2020-09-18T08:49:43+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2020-09-18 06:49:43"), Some(expected));
        assert_eq!(parse_timestamp("2020-09-18T06:49:43"), Some(expected));
        assert_eq!(
            parse_timestamp("2020-09-18 06:49:43.250").map(|t| t.timestamp_subsec_millis()),
            Some(250)
        );
        assert_eq!(parse_timestamp("18/09/2020"), None);
    }

    #[tokio::test]
    async fn test_decode_batch_keeps_order() {
        let events: Vec<RawEvent> = (0..2_000)
            .map(|i| {
                let payload = if i % 100 == 0 {
                    "{}".to_string()
                } else {
                    format!(
                        r#"{{"invoice_no": {}, "country": "UK", "timestamp": "2020-09-18 06:49:43", "type": "ORDER"}}"#,
                        i
                    )
                };
                RawEvent::new(0, i, payload)
            })
            .collect();

        let decoded = decode_batch(Arc::new(events), 4).await.unwrap();
        assert_eq!(decoded.len(), 2_000);
        for (i, result) in decoded.iter().enumerate() {
            match result {
                Ok(txn) => assert_eq!(txn.transaction.invoice_no, i as i64),
                Err(_) => assert_eq!(i % 100, 0),
            }
        }
    }
}
