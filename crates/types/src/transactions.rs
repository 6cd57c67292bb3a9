//! Transaction types for the retail event stream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of retail transaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// A customer order (positive revenue)
    Order,
    /// A customer return (negative revenue)
    Return,
}

impl TransactionType {
    /// Parse the wire representation (`"ORDER"` / `"RETURN"`)
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ORDER" => Some(Self::Order),
            "RETURN" => Some(Self::Return),
            _ => None,
        }
    }

    /// Wire representation of this type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "ORDER",
            Self::Return => "RETURN",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single line of an invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// Stock keeping unit
    pub sku: Option<String>,
    /// Product title
    pub title: Option<String>,
    /// Price per unit, never negative
    pub unit_price: f32,
    /// Number of units, never negative
    pub quantity: i32,
}

impl LineItem {
    /// Create a line item without SKU or title
    pub fn new(unit_price: f32, quantity: i32) -> Self {
        Self {
            sku: None,
            title: None,
            unit_price,
            quantity,
        }
    }

    /// Line value (`quantity * unit_price`)
    pub fn value(&self) -> f64 {
        f64::from(self.quantity) * f64::from(self.unit_price)
    }
}

/// A decoded retail transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Invoice number, unique per order but not across retries
    pub invoice_no: i64,
    /// Country of the customer
    pub country: String,
    /// When the transaction happened (event time)
    pub event_time: DateTime<Utc>,
    /// Order or return
    pub txn_type: TransactionType,
    /// Invoice lines, possibly empty
    pub items: Vec<LineItem>,
}

/// A transaction with its derived per-invoice metrics
///
/// Created once per [`Transaction`] by [`EnrichedTransaction::enrich`] and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTransaction {
    /// The source transaction
    pub transaction: Transaction,
    /// Sum of line values, negative iff the transaction is a return
    pub total_cost: f64,
    /// Sum of line quantities
    pub total_items: i64,
    /// 1 for orders, 0 otherwise
    pub is_order: u8,
    /// 1 for returns, 0 otherwise
    pub is_return: u8,
}

impl EnrichedTransaction {
    /// Derive the per-invoice metrics for a transaction
    pub fn enrich(transaction: Transaction) -> Self {
        let gross: f64 = transaction.items.iter().map(LineItem::value).sum();
        let total_items: i64 = transaction
            .items
            .iter()
            .map(|item| i64::from(item.quantity))
            .sum();

        let (total_cost, is_order, is_return) = match transaction.txn_type {
            TransactionType::Order => (gross, 1, 0),
            TransactionType::Return => (-gross, 0, 1),
        };

        Self {
            transaction,
            total_cost,
            total_items,
            is_order,
            is_return,
        }
    }

    /// Event time of the underlying transaction
    pub fn event_time(&self) -> DateTime<Utc> {
        self.transaction.event_time
    }

    /// Country of the underlying transaction
    pub fn country(&self) -> &str {
        &self.transaction.country
    }
}
