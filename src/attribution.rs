use std::collections::HashMap;

use crate::model::execution::AttributedPosition;
use crate::model::{Allocation, SHARE_EPS, SystemId, Ticker};
use crate::target::SystemWeight;

/// Split each held position back among systems in proportion to their
/// weighted demand for that ticker. Tickers no system demands are left
/// untouched here — the next reconciliation sweeps them into the
/// unallocated bucket.
pub fn attribute(
    held: &HashMap<Ticker, f64>,
    weights: &[SystemWeight],
    allocations: &HashMap<SystemId, Allocation>,
) -> Vec<AttributedPosition> {
    let mut out = Vec::new();

    for (ticker, &total_shares) in held {
        if total_shares < SHARE_EPS {
            continue;
        }

        let demands: Vec<(&SystemId, f64)> = weights
            .iter()
            .filter_map(|sw| {
                let percent = allocations.get(&sw.system_id)?.get(ticker)?;
                let demand = percent * sw.weight;
                (demand > 0.0).then_some((&sw.system_id, demand))
            })
            .collect();

        let total_demand: f64 = demands.iter().map(|(_, d)| d).sum();
        if total_demand <= 0.0 {
            continue;
        }

        for (system_id, demand) in demands {
            let shares = total_shares * demand / total_demand;
            if shares >= SHARE_EPS {
                out.push(AttributedPosition {
                    system_id: system_id.clone(),
                    symbol: ticker.clone(),
                    shares,
                });
            }
        }
    }

    out.sort_by(|a, b| (&a.system_id, &a.symbol).cmp(&(&b.system_id, &b.symbol)));
    out
}
