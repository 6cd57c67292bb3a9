use super::trait_::{mean, Accumulator};
use crate::error::AggregationResult;
use retail_kpi_types::EnrichedTransaction;
use serde::{Deserialize, Serialize};

/// Running sums for the retail KPIs of one window
///
/// The stored fields are additive, so two accumulators for the same key can
/// be merged exactly and the derived ratios are computed only at
/// finalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KpiAccumulator {
    /// Σ total_cost, also the numerator of the average transaction size
    pub sum_total_cost: f64,
    /// Number of invoices folded
    pub count: u64,
    /// Σ is_return
    pub sum_is_return: u64,
}

/// KPIs derived from a [`KpiAccumulator`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KpiValues {
    /// Σ total_cost
    pub total_sale_volume: f64,
    /// Orders per minute, the invoice count
    pub opm: u64,
    /// mean(is_return)
    pub rate_of_return: f64,
    /// mean(total_cost)
    pub average_transaction_size: f64,
}

impl Accumulator for KpiAccumulator {
    type Input = EnrichedTransaction;
    type Output = KpiValues;

    fn update(&mut self, txn: &EnrichedTransaction) {
        self.sum_total_cost += txn.total_cost;
        self.count += 1;
        self.sum_is_return += u64::from(txn.is_return);
    }

    fn merge(&mut self, other: &Self) {
        self.sum_total_cost += other.sum_total_cost;
        self.count += other.count;
        self.sum_is_return += other.sum_is_return;
    }

    fn finalize(&self) -> AggregationResult<KpiValues> {
        Ok(KpiValues {
            total_sale_volume: self.sum_total_cost,
            opm: self.count,
            rate_of_return: mean(self.sum_is_return as f64, self.count, "rate_of_return")?,
            average_transaction_size: mean(
                self.sum_total_cost,
                self.count,
                "average_transaction_size",
            )?,
        })
    }

    fn count(&self) -> u64 {
        self.count
    }
}
