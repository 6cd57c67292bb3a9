//! Output records for the enriched and KPI streams

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transactions::EnrichedTransaction;

/// Time span of a finalized window, `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpan {
    /// Window start (inclusive)
    pub start: DateTime<Utc>,
    /// Window end (exclusive)
    pub end: DateTime<Utc>,
}

/// Row of the raw enriched stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub invoice_no: i64,
    pub country: String,
    pub timestamp: DateTime<Utc>,
    pub total_cost: f64,
    pub total_items: i64,
    pub is_order: u8,
    pub is_return: u8,
}

impl From<&EnrichedTransaction> for EnrichedRecord {
    fn from(txn: &EnrichedTransaction) -> Self {
        Self {
            invoice_no: txn.transaction.invoice_no,
            country: txn.transaction.country.clone(),
            timestamp: txn.transaction.event_time,
            total_cost: txn.total_cost,
            total_items: txn.total_items,
            is_order: txn.is_order,
            is_return: txn.is_return,
        }
    }
}

/// KPIs of one window across all countries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalKpiRecord {
    pub window: WindowSpan,
    /// Orders per minute: number of invoices in the window
    #[serde(rename = "OPM")]
    pub opm: u64,
    pub total_sale_volume: f64,
    pub average_transaction_size: f64,
    pub rate_of_return: f64,
}

/// KPIs of one window for a single country
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryKpiRecord {
    pub window: WindowSpan,
    pub country: String,
    #[serde(rename = "OPM")]
    pub opm: u64,
    pub total_sale_volume: f64,
    pub rate_of_return: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_global_record_field_names() {
        let record = GlobalKpiRecord {
            window: WindowSpan {
                start: Utc.with_ymd_and_hms(2020, 9, 18, 6, 49, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2020, 9, 18, 6, 50, 0).unwrap(),
            },
            opm: 2,
            total_sale_volume: 7.0,
            average_transaction_size: 3.5,
            rate_of_return: 0.5,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["OPM"], 2);
        assert_eq!(json["window"]["start"], "2020-09-18T06:49:00Z");
        assert!(json.get("opm").is_none());
    }

    #[test]
    fn test_country_record_has_no_average() {
        let record = CountryKpiRecord {
            window: WindowSpan {
                start: Utc.timestamp_millis_opt(0).unwrap(),
                end: Utc.timestamp_millis_opt(60_000).unwrap(),
            },
            country: "France".to_string(),
            opm: 1,
            total_sale_volume: 10.0,
            rate_of_return: 0.0,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["country"], "France");
        assert!(json.get("average_transaction_size").is_none());
    }
}
