use std::collections::HashMap;

use anyhow::Result;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::broker::BrokerPosition;
use crate::model::bucket::Bucket;
use crate::model::{AccountKey, SHARE_EPS, Ticker};
use crate::store::ledger::{self, LedgerRow};

/// Reconciled view of one held ticker: what the broker reports, how much of
/// it the ledger attributes to systems, and the remainder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionView {
    pub total: f64,
    pub allocated: f64,
    pub unallocated: f64,
    pub current_price: f64,
}

/// Compare broker positions against the ledger and self-heal: phantom rows
/// are purged, the unallocated bucket is rewritten from scratch, negative
/// remainders clamp to zero. After this runs, per-ticker ledger sums match
/// the broker within epsilon.
pub fn current_portfolio(
    conn: &mut Connection,
    account: &AccountKey,
    broker_positions: &[BrokerPosition],
) -> Result<HashMap<Ticker, PositionView>> {
    let broker: HashMap<&str, &BrokerPosition> = broker_positions
        .iter()
        .map(|p| (p.symbol.as_str(), p))
        .collect();

    let ledger_rows = ledger::positions_for_account(conn, account)?;

    let mut deletes: Vec<(Bucket, Ticker)> = Vec::new();
    let mut upserts: Vec<LedgerRow> = Vec::new();

    // Phantom detection: a system row for a ticker the broker no longer
    // holds. Unallocated rows are rewritten wholesale below instead.
    for row in &ledger_rows {
        if row.bucket.is_unallocated() {
            continue;
        }
        if !broker.contains_key(row.symbol.as_str()) {
            warn!(
                account = %account,
                bucket = %row.bucket,
                symbol = %row.symbol,
                shares = row.shares,
                "phantom ledger row: broker holds none, purging"
            );
            deletes.push((row.bucket.clone(), row.symbol.clone()));
        }
    }

    let mut view = HashMap::new();
    for position in broker_positions {
        let allocated: f64 = ledger_rows
            .iter()
            .filter(|r| !r.bucket.is_unallocated() && r.symbol == position.symbol)
            .map(|r| r.shares)
            .sum();

        let remainder = position.qty - allocated;
        if remainder < -SHARE_EPS {
            warn!(
                account = %account,
                symbol = %position.symbol,
                total = position.qty,
                allocated,
                "ledger attributes more shares than the broker holds, clamping"
            );
        }
        let unallocated = remainder.max(0.0);

        // The unallocated bucket is derived state: recomputed every run,
        // never trusted as input.
        if unallocated > SHARE_EPS {
            upserts.push(LedgerRow {
                account: account.clone(),
                bucket: Bucket::Unallocated,
                symbol: position.symbol.clone(),
                shares: unallocated,
                avg_price: position.current_price,
            });
        } else {
            deletes.push((Bucket::Unallocated, position.symbol.clone()));
        }

        view.insert(
            position.symbol.clone(),
            PositionView {
                total: position.qty,
                allocated,
                unallocated,
                current_price: position.current_price,
            },
        );
    }

    // Unallocated rows for tickers gone from the broker.
    for row in &ledger_rows {
        if row.bucket.is_unallocated() && !broker.contains_key(row.symbol.as_str()) {
            deletes.push((Bucket::Unallocated, row.symbol.clone()));
        }
    }

    if deletes.is_empty() && upserts.is_empty() {
        debug!(account = %account, "ledger already consistent");
    } else {
        ledger::write_snapshot(conn, account, &deletes, &upserts)?;
    }

    Ok(view)
}
