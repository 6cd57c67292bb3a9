use crate::error::AggregationResult;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Core trait for incremental window accumulators
///
/// An accumulator is folded one input at a time, can absorb another
/// accumulator of the same kind, and is serializable so open windows survive
/// a checkpoint/restore cycle.
pub trait Accumulator: Clone + Debug + Default + Send + Sync + Serialize + for<'de> Deserialize<'de> {
    /// The type of values this accumulator folds
    type Input: ?Sized;

    /// The type of the final aggregation result
    type Output: Clone;

    /// Fold one value into the accumulator
    fn update(&mut self, value: &Self::Input);

    /// Merge another accumulator into this one
    fn merge(&mut self, other: &Self);

    /// Compute the final aggregation result
    fn finalize(&self) -> AggregationResult<Self::Output>;

    /// Get the number of values folded so far
    fn count(&self) -> u64;

    /// Check if the accumulator has folded any values
    fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// Mean of `sum` over `count` samples
pub(crate) fn mean(sum: f64, count: u64, operation: &str) -> AggregationResult<f64> {
    if count == 0 {
        return Err(crate::error::AggregationError::DivisionByZero {
            operation: operation.to_string(),
        });
    }
    Ok(sum / count as f64)
}
