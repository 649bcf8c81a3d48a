use std::collections::{BTreeMap, HashMap};

use crate::model::settings::ReserveMode;
use crate::model::{Allocation, Investment, SHARE_EPS, SystemId, Ticker};
use crate::reconcile::PositionView;

/// One system's share of the user's capital, as a fraction summing to 1
/// across the user's systems.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemWeight {
    pub system_id: SystemId,
    pub weight: f64,
}

/// Resolve investments to normalized weights. Dollar amounts count as-is;
/// percent amounts resolve against total equity first. An all-zero set
/// yields no weights (and therefore an empty plan).
pub fn system_weights(investments: &[Investment], total_equity: f64) -> Vec<SystemWeight> {
    let dollars: Vec<(SystemId, f64)> = investments
        .iter()
        .map(|inv| (inv.system_id.clone(), inv.dollars(total_equity).max(0.0)))
        .collect();

    let total: f64 = dollars.iter().map(|(_, d)| d).sum();
    if total <= 0.0 {
        return Vec::new();
    }

    dollars
        .into_iter()
        .map(|(system_id, d)| SystemWeight {
            system_id,
            weight: d / total,
        })
        .collect()
}

/// Merge per-system allocations into one percent map, weighting each
/// system's percents by its capital share. Systems without an allocation
/// entry contribute nothing but keep their weight in the denominator.
pub fn merge_allocations(
    weights: &[SystemWeight],
    allocations: &HashMap<SystemId, Allocation>,
) -> Allocation {
    let mut merged = Allocation::new();
    for sw in weights {
        let Some(allocation) = allocations.get(&sw.system_id) else {
            continue;
        };
        for (ticker, percent) in allocation {
            *merged.entry(ticker.clone()).or_insert(0.0) += percent * sw.weight;
        }
    }
    merged.retain(|_, pct| *pct > 0.0);
    merged
}

/// Net opposing pairs against each other: the smaller side is absorbed into
/// the larger, and the absorbed mass is redistributed proportionally across
/// the survivors.
pub fn apply_paired_netting(mut merged: Allocation, pairs: &[(Ticker, Ticker)]) -> Allocation {
    let mut removed = 0.0;

    for (a, b) in pairs {
        let va = merged.get(a).copied().unwrap_or(0.0);
        let vb = merged.get(b).copied().unwrap_or(0.0);
        if va <= 0.0 || vb <= 0.0 {
            continue;
        }

        if va > vb {
            merged.insert(a.clone(), va - vb);
            merged.remove(b);
            removed += vb;
        } else if vb > va {
            merged.insert(b.clone(), vb - va);
            merged.remove(a);
            removed += va;
        } else {
            merged.remove(a);
            merged.remove(b);
            removed += va;
        }
    }

    if removed > 0.0 {
        let surviving: f64 = merged.values().sum();
        if surviving > 0.0 {
            let scale = (surviving + removed) / surviving;
            for pct in merged.values_mut() {
                *pct *= scale;
            }
        }
    }

    merged
}

/// Scale the whole map down uniformly when it exceeds the cap. Never scales
/// up.
pub fn apply_safety_cap(mut merged: Allocation, cap_percent: f64) -> Allocation {
    let total: f64 = merged.values().sum();
    if total > cap_percent && total > 0.0 {
        let scale = cap_percent / total;
        for pct in merged.values_mut() {
            *pct *= scale;
        }
    }
    merged
}

/// Dollars held back from sizing.
pub fn cash_reserve(total_equity: f64, mode: ReserveMode, amount: f64) -> f64 {
    match mode {
        ReserveMode::Dollars => amount.max(0.0),
        ReserveMode::Percent => (total_equity * amount / 100.0).max(0.0),
    }
}

/// Convert the merged percent map into target share counts at current
/// prices. Tickers without a price are skipped — the pipeline records the
/// skip reason separately.
pub fn target_shares(
    merged: &Allocation,
    adjusted_equity: f64,
    prices: &HashMap<Ticker, f64>,
) -> BTreeMap<Ticker, f64> {
    let mut targets = BTreeMap::new();
    if adjusted_equity <= 0.0 {
        return targets;
    }

    for (ticker, percent) in merged {
        let Some(&price) = prices.get(ticker) else {
            continue;
        };
        if price <= 0.0 {
            continue;
        }
        let shares = adjusted_equity * percent / 100.0 / price;
        if shares > 0.0 {
            targets.insert(ticker.clone(), shares);
        }
    }

    targets
}

/// Share deltas needed to move the account from its current holdings to the
/// target: positive buys, negative sells. Covers the union of both sides, so
/// holdings absent from the target come back as liquidations.
pub fn net_trades(
    current: &HashMap<Ticker, PositionView>,
    targets: &BTreeMap<Ticker, f64>,
) -> BTreeMap<Ticker, f64> {
    let mut deltas = BTreeMap::new();

    for (ticker, &target) in targets {
        let held = current.get(ticker).map(|v| v.total).unwrap_or(0.0);
        let delta = target - held;
        if delta.abs() > SHARE_EPS {
            deltas.insert(ticker.clone(), delta);
        }
    }

    for (ticker, view) in current {
        if !targets.contains_key(ticker) && view.total > SHARE_EPS {
            deltas.insert(ticker.clone(), -view.total);
        }
    }

    deltas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AccountKey;
    use crate::model::settings::{CredentialType, WeightMode};

    fn inv(system_id: &str, amount: f64, mode: WeightMode) -> Investment {
        Investment {
            account: AccountKey::new("u1", CredentialType::Paper),
            system_id: system_id.to_string(),
            amount,
            weight_mode: mode,
        }
    }

    #[test]
    fn weights_normalize_across_modes() {
        let weights = system_weights(
            &[
                inv("s1", 6000.0, WeightMode::Dollars),
                inv("s2", 20.0, WeightMode::Percent), // 20% of 20k = 4000
            ],
            20_000.0,
        );
        assert_eq!(weights.len(), 2);
        assert!((weights[0].weight - 0.6).abs() < 1e-12);
        assert!((weights[1].weight - 0.4).abs() < 1e-12);
        let sum: f64 = weights.iter().map(|w| w.weight).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn paired_netting_redistributes_absorbed_mass() {
        let merged = Allocation::from([
            ("SPY".to_string(), 40.0),
            ("SH".to_string(), 25.0),
            ("QQQ".to_string(), 35.0),
        ]);
        let out = apply_paired_netting(merged, &[("SPY".to_string(), "SH".to_string())]);

        assert_eq!(out.len(), 2);
        assert!((out["SPY"] - 22.5).abs() < 1e-9);
        assert!((out["QQQ"] - 52.5).abs() < 1e-9);
    }

    #[test]
    fn paired_netting_equal_sides_cancel() {
        let merged = Allocation::from([
            ("SPY".to_string(), 30.0),
            ("SH".to_string(), 30.0),
            ("QQQ".to_string(), 40.0),
        ]);
        let out = apply_paired_netting(merged, &[("SPY".to_string(), "SH".to_string())]);
        assert_eq!(out.len(), 1);
        assert!((out["QQQ"] - 70.0).abs() < 1e-9);
    }

    #[test]
    fn cap_scales_down_only() {
        let over = Allocation::from([("A".to_string(), 80.0), ("B".to_string(), 40.0)]);
        let capped = apply_safety_cap(over, 99.0);
        let total: f64 = capped.values().sum();
        assert!((total - 99.0).abs() < 1e-9);

        let under = Allocation::from([("A".to_string(), 50.0)]);
        let unchanged = apply_safety_cap(under, 99.0);
        assert!((unchanged["A"] - 50.0).abs() < 1e-12);
    }

    #[test]
    fn net_trades_liquidates_unclaimed_holdings() {
        let current = HashMap::from([(
            "AAPL".to_string(),
            PositionView {
                total: 5.0,
                allocated: 5.0,
                unallocated: 0.0,
                current_price: 200.0,
            },
        )]);
        let targets = BTreeMap::from([("SPY".to_string(), 10.0)]);
        let deltas = net_trades(&current, &targets);

        assert!((deltas["SPY"] - 10.0).abs() < 1e-12);
        assert!((deltas["AAPL"] + 5.0).abs() < 1e-12);
    }

    #[test]
    fn net_trades_ignores_sub_epsilon_drift() {
        let current = HashMap::from([(
            "SPY".to_string(),
            PositionView {
                total: 10.00001,
                allocated: 10.00001,
                unallocated: 0.0,
                current_price: 400.0,
            },
        )]);
        let targets = BTreeMap::from([("SPY".to_string(), 10.0)]);
        assert!(net_trades(&current, &targets).is_empty());
    }
}
