//! Core record types for the retail KPI stream engine
//!
//! This crate holds the data shapes shared by the engine and its runners:
//! the decoded transaction, its enriched form, and the KPI records written
//! to the output streams.

pub mod kpis;
pub mod transactions;

pub use kpis::{CountryKpiRecord, EnrichedRecord, GlobalKpiRecord, WindowSpan};
pub use transactions::{EnrichedTransaction, LineItem, Transaction, TransactionType};
