use tracing::warn;

use crate::evaluator::{EvaluateOptions, Evaluator};
use crate::model::Allocation;
use crate::model::payload::PayloadNode;

/// Evaluate one system and normalize the final day of its series to a
/// `{ticker → percent}` map.
///
/// Returns `None` on evaluator error, missing payload, or an empty final
/// allocation — callers route the system's weight to the fallback ticker.
pub async fn allocations_for(
    evaluator: &dyn Evaluator,
    system_id: &str,
    payload: Option<&PayloadNode>,
    opts: &EvaluateOptions,
) -> Option<Allocation> {
    let payload = payload?;

    let series = match evaluator.evaluate(payload, opts).await {
        Ok(series) => series,
        Err(e) => {
            warn!(system_id, error = %format!("{e:#}"), "evaluator failed");
            return None;
        }
    };

    let last = series.last()?;

    let mut allocation = Allocation::new();
    for entry in &last.entries {
        if entry.weight <= 0.0 {
            continue;
        }
        // weight ∈ [0, 1] → percent; duplicate tickers accumulate.
        *allocation.entry(entry.ticker.to_uppercase()).or_insert(0.0) += entry.weight * 100.0;
    }

    if allocation.is_empty() {
        None
    } else {
        Some(allocation)
    }
}
