use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::allocation;
use crate::attribution;
use crate::broker::{BrokerClient, BrokerConnector};
use crate::evaluator::{EvaluateOptions, Evaluator};
use crate::model::bucket::Bucket;
use crate::model::execution::{
    OrderOutcome, OrderSide, OrderStatus, QueueStatus, SystemPnl, UserRunReport,
};
use crate::model::settings::{CredentialType, OrderKind, TradingSettings};
use crate::model::{AccountKey, Allocation, SHARE_EPS, SystemId, Ticker};
use crate::prices::{PriceAuthority, PriceBook};
use crate::reconcile::{self, PositionView};
use crate::store::ledger::LedgerRow;
use crate::store::{self, Db};
use crate::target::{self, SystemWeight};
use crate::vault::{Vault, VaultError};
use crate::warmup::WarmupOutput;

/// Delay between the last order and the post-fill re-snapshot.
pub const SETTLE_WAIT: Duration = Duration::from_secs(2);

/// Broker minimum for notional market buys.
const MIN_NOTIONAL: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Compute and record plans; place nothing.
    Simulate,
    /// Place orders for paper accounts, simulate live ones.
    ExecutePaper,
    /// Place orders for paper and live accounts.
    ExecuteLive,
}

impl ExecutionMode {
    pub fn parse(s: &str) -> Option<ExecutionMode> {
        match s {
            "simulate" => Some(ExecutionMode::Simulate),
            "execute-paper" | "paper" => Some(ExecutionMode::ExecutePaper),
            "execute-live" | "live" => Some(ExecutionMode::ExecuteLive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Simulate => "simulate",
            ExecutionMode::ExecutePaper => "execute-paper",
            ExecutionMode::ExecuteLive => "execute-live",
        }
    }

    fn places_orders(&self, credential_type: CredentialType) -> bool {
        match self {
            ExecutionMode::Simulate => false,
            ExecutionMode::ExecutePaper => credential_type == CredentialType::Paper,
            ExecutionMode::ExecuteLive => true,
        }
    }
}

/// Failures that end one account's run. Everything else degrades to a
/// recorded order outcome or error string and the run continues.
#[derive(Debug, Error)]
pub enum UserRunError {
    #[error("no broker credentials for this account")]
    NoCredentials,

    #[error(transparent)]
    Decrypt(#[from] VaultError),

    #[error("invalid trading settings: {0}")]
    ConfigInvalid(String),

    #[error("broker error: {0}")]
    BrokerTransient(String),
}

#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub users_completed: u32,
    pub users_failed: u32,
    pub trades: u32,
    pub errors: Vec<String>,
}

pub struct Pipeline {
    pub db: Db,
    pub vault: Arc<Vault>,
    pub evaluator: Arc<dyn Evaluator>,
    pub price_authority: PriceAuthority,
    pub connector: Arc<dyn BrokerConnector>,
    /// Overridable so tests don't sleep.
    pub settle_wait: Duration,
}

impl Pipeline {
    /// Phase 2: price the ticker union once, evaluate each unique system
    /// once, then walk the queue strictly in order — one account at a time.
    pub async fn run(
        &self,
        execution_id: &str,
        warmup: &WarmupOutput,
        mode: ExecutionMode,
    ) -> Result<PipelineOutcome> {
        let fallback_broker = self.account_agnostic_broker().await;

        let book = self
            .price_authority
            .fetch(&warmup.tickers, fallback_broker.as_deref())
            .await;

        // One evaluation per unique system, shared by every invested user.
        // A failed evaluation records an empty allocation; the weight routes
        // to each user's fallback ticker downstream.
        let mut system_allocations: HashMap<SystemId, Option<Allocation>> = HashMap::new();
        let opts = {
            let conn = self.db.lock().await;
            evaluate_options(&conn)?
        };
        for system in &warmup.systems {
            let Some(system_id) = system.bucket.system_id() else {
                continue;
            };
            let result = allocation::allocations_for(
                self.evaluator.as_ref(),
                system_id,
                system.payload.as_ref(),
                &opts,
            )
            .await;

            {
                let conn = self.db.lock().await;
                let persisted = result.clone().unwrap_or_default();
                store::systems::upsert_dedup(
                    &conn,
                    system_id,
                    system.accounts.len(),
                    Some(&persisted),
                )?;
            }
            system_allocations.insert(system_id.to_string(), result);
        }

        let mut outcome = PipelineOutcome::default();

        for row in &warmup.queue {
            let account = AccountKey::new(row.user_id.clone(), row.credential_type);
            let started_at = Utc::now();

            {
                let conn = self.db.lock().await;
                store::executions::mark_queue_executing(&conn, execution_id, &account)?;
            }

            let report = match self
                .run_user(&account, &system_allocations, &book, mode)
                .await
            {
                Ok(report) => report,
                Err(e) => {
                    error!(account = %account, error = %format!("{e:#}"), "user run failed");
                    outcome.errors.push(format!("{account}: {e:#}"));
                    UserRunReport::failed(vec![format!("{e:#}")])
                }
            };

            outcome.trades += report
                .orders
                .iter()
                .filter(|o| o.status == OrderStatus::Submitted)
                .count() as u32;
            match report.status {
                QueueStatus::Completed => outcome.users_completed += 1,
                _ => outcome.users_failed += 1,
            }

            let conn = self.db.lock().await;
            store::executions::insert_user_result(
                &conn,
                execution_id,
                &account,
                row.position,
                &report,
                started_at,
            )?;
            store::executions::mark_queue_done(&conn, execution_id, &account, report.status)?;
        }

        info!(
            execution_id,
            completed = outcome.users_completed,
            failed = outcome.users_failed,
            trades = outcome.trades,
            "phase 2 complete"
        );

        Ok(outcome)
    }

    /// Paper credentials from any account, for broker calls that are not
    /// user-specific (price fallback).
    async fn account_agnostic_broker(&self) -> Option<Arc<dyn BrokerClient>> {
        let row = {
            let conn = self.db.lock().await;
            store::credentials::any_paper(&conn).ok()??
        };
        let auth = row.decrypt(&self.vault).ok()?;
        self.connector.connect(&auth).ok()
    }

    async fn run_user(
        &self,
        account: &AccountKey,
        system_allocations: &HashMap<SystemId, Option<Allocation>>,
        book: &PriceBook,
        mode: ExecutionMode,
    ) -> Result<UserRunReport, UserRunError> {
        let mut errors: Vec<String> = Vec::new();
        let mut orders: Vec<OrderOutcome> = Vec::new();

        // Settings and credentials. Both are fatal for this account only.
        let (settings, credential_row, investments) = {
            let conn = self.db.lock().await;
            let settings = store::settings::load(&conn, &account.user_id)
                .map_err(|e| UserRunError::ConfigInvalid(format!("{e:#}")))?
                .ok_or_else(|| UserRunError::ConfigInvalid("no trading settings".into()))?;
            let credentials = store::credentials::get(&conn, account)
                .map_err(|e| UserRunError::BrokerTransient(format!("{e:#}")))?
                .ok_or(UserRunError::NoCredentials)?;
            let investments = store::investments::for_account(&conn, account)
                .map_err(|e| UserRunError::BrokerTransient(format!("{e:#}")))?;
            (settings, credentials, investments)
        };
        settings
            .validate()
            .map_err(|e| UserRunError::ConfigInvalid(e.to_string()))?;

        let auth = credential_row.decrypt(&self.vault)?;
        let broker = self
            .connector
            .connect(&auth)
            .map_err(|e| UserRunError::BrokerTransient(format!("{e:#}")))?;

        let broker_account = broker
            .account()
            .await
            .map_err(|e| UserRunError::BrokerTransient(format!("{e:#}")))?;

        let positions = broker
            .positions()
            .await
            .map_err(|e| UserRunError::BrokerTransient(format!("{e:#}")))?;

        let current = {
            let mut conn = self.db.lock().await;
            reconcile::current_portfolio(&mut conn, account, &positions)
                .map_err(|e| UserRunError::BrokerTransient(format!("{e:#}")))?
        };

        // Plan: weights → per-system allocations (failed systems route to
        // the fallback ticker) → merge → paired netting → cap → sizing.
        let weights = target::system_weights(&investments, broker_account.equity);
        let user_allocations =
            resolve_user_allocations(&weights, system_allocations, &settings.fallback_ticker);

        let merged = target::merge_allocations(&weights, &user_allocations);
        let merged = target::apply_paired_netting(merged, &settings.paired_tickers);
        let merged = target::apply_safety_cap(merged, settings.max_allocation_percent);

        let reserve = target::cash_reserve(
            broker_account.equity,
            settings.cash_reserve_mode,
            settings.cash_reserve_amount,
        );
        let adjusted_equity = (broker_account.equity - reserve).max(0.0);

        let targets = target::target_shares(&merged, adjusted_equity, &book.prices);
        let mut deltas = target::net_trades(&current, &targets);

        // A merged ticker without a price can be neither sized nor safely
        // liquidated toward an unknown target: drop its delta and record why.
        for ticker in merged.keys() {
            if book.get(ticker).is_none() {
                deltas.remove(ticker);
                orders.push(skip(ticker, OrderSide::Buy, "NoPrice"));
            }
        }

        // Accounts with no investment dollars (or no usable equity) are
        // reconciled and reported, never traded.
        if weights.is_empty() || broker_account.equity <= 0.0 {
            deltas.clear();
        }

        if mode.places_orders(account.credential_type) && !deltas.is_empty() {
            self.drain_manual_sells(account, broker.as_ref(), &mut orders, &mut errors)
                .await;

            if let Err(e) = broker.cancel_open_orders().await {
                warn!(account = %account, error = %format!("{e:#}"), "cancel open orders failed");
                errors.push(format!("cancel open orders: {e:#}"));
            }

            // Hard ordering requirement: every sell is issued before any
            // buy, so the sells free buying power first.
            place_sells(broker.as_ref(), &deltas, &targets, &current, &mut orders).await;
            place_buys(broker.as_ref(), &deltas, book, &settings, &mut orders).await;
        } else if mode.places_orders(account.credential_type) {
            self.drain_manual_sells(account, broker.as_ref(), &mut orders, &mut errors)
                .await;
        }

        // A simulated account records its plan and P&L but leaves the
        // ledger untouched. Executed accounts settle, re-snapshot, and write
        // attribution only from post-fill broker state.
        let attributed = if mode.places_orders(account.credential_type) {
            let any_submitted = orders.iter().any(|o| o.status == OrderStatus::Submitted);
            let held: HashMap<Ticker, f64> = if any_submitted {
                tokio::time::sleep(self.settle_wait).await;
                let refreshed = broker
                    .positions()
                    .await
                    .map_err(|e| UserRunError::BrokerTransient(format!("{e:#}")))?;
                refreshed.into_iter().map(|p| (p.symbol, p.qty)).collect()
            } else {
                current.iter().map(|(t, v)| (t.clone(), v.total)).collect()
            };

            let attributed = attribution::attribute(&held, &weights, &user_allocations);
            let mut conn = self.db.lock().await;
            write_attribution(&mut conn, account, &attributed, book, &current)
                .map_err(|e| UserRunError::BrokerTransient(format!("{e:#}")))?;
            attributed
        } else {
            Vec::new()
        };

        let pnl = {
            let conn = self.db.lock().await;
            compute_pnl(&conn, account, book, &current)
                .map_err(|e| UserRunError::BrokerTransient(format!("{e:#}")))?
        };

        Ok(UserRunReport {
            status: QueueStatus::Completed,
            net_trades: deltas,
            orders,
            attribution: attributed,
            pnl,
            errors,
        })
    }

    /// User-requested sells queued between runs, drained before the
    /// rebalance so freed cash is available to the buy phase.
    async fn drain_manual_sells(
        &self,
        account: &AccountKey,
        broker: &dyn BrokerClient,
        orders: &mut Vec<OrderOutcome>,
        errors: &mut Vec<String>,
    ) {
        let pending = {
            let conn = self.db.lock().await;
            match store::executions::pending_manual_sells(&conn, account) {
                Ok(pending) => pending,
                Err(e) => {
                    errors.push(format!("loading manual sells: {e:#}"));
                    return;
                }
            }
        };

        for sell in pending {
            let result = broker.submit_market_sell(&sell.symbol, sell.qty).await;
            let (executed, err_msg) = match &result {
                Ok(_) => (true, None),
                Err(e) => (false, Some(format!("{e:#}"))),
            };

            orders.push(OrderOutcome {
                symbol: sell.symbol.clone(),
                side: OrderSide::Sell,
                qty: Some(sell.qty),
                notional: None,
                limit_price: None,
                status: if executed {
                    OrderStatus::Submitted
                } else {
                    OrderStatus::Rejected
                },
                reason: Some(match &err_msg {
                    Some(e) => format!("manual sell: {e}"),
                    None => "manual sell".to_string(),
                }),
            });

            let conn = self.db.lock().await;
            if let Err(e) = store::executions::mark_manual_sell(
                &conn,
                sell.id,
                executed,
                err_msg.as_deref(),
            ) {
                errors.push(format!("updating manual sell {}: {e:#}", sell.id));
            }
        }
    }
}

/// Evaluator options for this run. Systems are shared across users and
/// evaluated once, so the benchmark follows the first enabled user's
/// fallback ticker (stable user-id order); absent that, the default stands.
fn evaluate_options(conn: &rusqlite::Connection) -> Result<EvaluateOptions> {
    let mut opts = EvaluateOptions::default();
    if let Some(user_id) = store::settings::enabled_users(conn)?.first()
        && let Some(settings) = store::settings::load(conn, user_id)?
    {
        let fallback = settings.fallback_ticker.trim().to_uppercase();
        if !fallback.is_empty() {
            opts.benchmark_ticker = fallback;
        }
    }
    Ok(opts)
}

/// Map each invested system to its allocation, substituting
/// `{fallback_ticker: 100%}` where evaluation failed — the fallback then
/// participates in netting and capping like any other allocation.
fn resolve_user_allocations(
    weights: &[SystemWeight],
    system_allocations: &HashMap<SystemId, Option<Allocation>>,
    fallback_ticker: &str,
) -> HashMap<SystemId, Allocation> {
    let fallback = fallback_ticker.trim().to_uppercase();
    weights
        .iter()
        .map(|sw| {
            let allocation = match system_allocations.get(&sw.system_id) {
                Some(Some(allocation)) => allocation.clone(),
                _ => Allocation::from([(fallback.clone(), 100.0)]),
            };
            (sw.system_id.clone(), allocation)
        })
        .collect()
}

async fn place_sells(
    broker: &dyn BrokerClient,
    deltas: &BTreeMap<Ticker, f64>,
    targets: &BTreeMap<Ticker, f64>,
    current: &HashMap<Ticker, PositionView>,
    orders: &mut Vec<OrderOutcome>,
) {
    for (ticker, &delta) in deltas {
        if delta >= 0.0 {
            continue;
        }

        // Full liquidation sells the entire held quantity, not the delta.
        let qty = if targets.contains_key(ticker) {
            floor4(-delta)
        } else {
            floor4(current.get(ticker).map(|v| v.total).unwrap_or(-delta))
        };

        if qty < SHARE_EPS {
            orders.push(skip(ticker, OrderSide::Sell, "quantity rounds to zero"));
            continue;
        }

        match broker.submit_market_sell(ticker, qty).await {
            Ok(_) => orders.push(OrderOutcome {
                symbol: ticker.clone(),
                side: OrderSide::Sell,
                qty: Some(qty),
                notional: None,
                limit_price: None,
                status: OrderStatus::Submitted,
                reason: None,
            }),
            Err(e) => {
                warn!(symbol = %ticker, error = %format!("{e:#}"), "sell rejected");
                orders.push(OrderOutcome {
                    symbol: ticker.clone(),
                    side: OrderSide::Sell,
                    qty: Some(qty),
                    notional: None,
                    limit_price: None,
                    status: OrderStatus::Rejected,
                    reason: Some(format!("{e:#}")),
                });
            }
        }
    }
}

async fn place_buys(
    broker: &dyn BrokerClient,
    deltas: &BTreeMap<Ticker, f64>,
    book: &PriceBook,
    settings: &TradingSettings,
    orders: &mut Vec<OrderOutcome>,
) {
    for (ticker, &delta) in deltas {
        if delta <= 0.0 {
            continue;
        }

        let Some(price) = book.get(ticker) else {
            orders.push(skip(ticker, OrderSide::Buy, "NoPrice"));
            continue;
        };

        let notional = delta * price;
        if notional < MIN_NOTIONAL {
            orders.push(skip(ticker, OrderSide::Buy, "notional below broker minimum"));
            continue;
        }

        let result = match settings.order_kind {
            OrderKind::Market => {
                broker.submit_notional_market_buy(ticker, notional).await.map(|r| (r, None))
            }
            OrderKind::Limit => {
                let limit_price = price * (1.0 + settings.limit_percent / 100.0);
                broker
                    .submit_limit_buy(ticker, floor4(delta), limit_price)
                    .await
                    .map(|r| (r, Some(limit_price)))
            }
        };

        match result {
            Ok((_, limit_price)) => orders.push(OrderOutcome {
                symbol: ticker.clone(),
                side: OrderSide::Buy,
                qty: matches!(settings.order_kind, OrderKind::Limit).then(|| floor4(delta)),
                notional: matches!(settings.order_kind, OrderKind::Market).then_some(notional),
                limit_price,
                status: OrderStatus::Submitted,
                reason: None,
            }),
            Err(e) => {
                warn!(symbol = %ticker, error = %format!("{e:#}"), "buy rejected");
                orders.push(OrderOutcome {
                    symbol: ticker.clone(),
                    side: OrderSide::Buy,
                    qty: None,
                    notional: Some(notional),
                    limit_price: None,
                    status: OrderStatus::Rejected,
                    reason: Some(format!("{e:#}")),
                });
            }
        }
    }
}

/// Rewrite the account's system-bucket attribution for every ticker that was
/// re-attributed, blending cost basis where a row grew. Tickers no system
/// demanded keep their rows; the next reconciliation sweeps them.
fn write_attribution(
    conn: &mut rusqlite::Connection,
    account: &AccountKey,
    attributed: &[crate::model::execution::AttributedPosition],
    book: &PriceBook,
    current: &HashMap<Ticker, PositionView>,
) -> Result<()> {
    let existing = store::ledger::positions_for_account(conn, account)?;
    let existing_by_key: HashMap<(String, String), &LedgerRow> = existing
        .iter()
        .filter(|r| !r.bucket.is_unallocated())
        .map(|r| ((r.bucket.as_db().to_string(), r.symbol.clone()), r))
        .collect();

    let attributed_tickers: std::collections::BTreeSet<&str> =
        attributed.iter().map(|a| a.symbol.as_str()).collect();

    // Replace attribution wholesale per ticker, so stale rows from systems
    // that rotated out cannot overstate the allocated sum.
    let mut deletes = Vec::new();
    for row in &existing {
        if !row.bucket.is_unallocated() && attributed_tickers.contains(row.symbol.as_str()) {
            deletes.push((row.bucket.clone(), row.symbol.clone()));
        }
    }

    let mut upserts = Vec::new();
    for position in attributed {
        let exec_price = book
            .get(&position.symbol)
            .or_else(|| current.get(&position.symbol).map(|v| v.current_price))
            .unwrap_or(0.0);

        let avg_price = match existing_by_key
            .get(&(position.system_id.clone(), position.symbol.clone()))
        {
            Some(old) if position.shares > old.shares && position.shares > 0.0 => {
                let added = position.shares - old.shares;
                (old.shares * old.avg_price + added * exec_price) / position.shares
            }
            Some(old) => old.avg_price,
            None => exec_price,
        };

        upserts.push(LedgerRow {
            account: account.clone(),
            bucket: Bucket::System(position.system_id.clone()),
            symbol: position.symbol.clone(),
            shares: position.shares,
            avg_price,
        });
    }

    store::ledger::write_snapshot(conn, account, &deletes, &upserts)
}

/// Unrealized P&L per bucket from the post-write ledger, priced at
/// execution-time prices.
fn compute_pnl(
    conn: &rusqlite::Connection,
    account: &AccountKey,
    book: &PriceBook,
    current: &HashMap<Ticker, PositionView>,
) -> Result<Vec<SystemPnl>> {
    let rows = store::ledger::positions_for_account(conn, account)?;

    let mut by_bucket: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for row in rows {
        let price = book
            .get(&row.symbol)
            .or_else(|| current.get(&row.symbol).map(|v| v.current_price))
            .unwrap_or(row.avg_price);
        let entry = by_bucket.entry(row.bucket.as_db().to_string()).or_insert((0.0, 0.0));
        entry.0 += row.shares * price;
        entry.1 += row.shares * row.avg_price;
    }

    Ok(by_bucket
        .into_iter()
        .map(|(system_id, (market_value, cost_basis))| {
            let unrealized = market_value - cost_basis;
            SystemPnl {
                system_id,
                market_value,
                cost_basis,
                unrealized,
                unrealized_pct: if cost_basis > 0.0 {
                    unrealized / cost_basis
                } else {
                    0.0
                },
            }
        })
        .collect())
}

fn skip(ticker: &str, side: OrderSide, reason: &str) -> OrderOutcome {
    OrderOutcome {
        symbol: ticker.to_string(),
        side,
        qty: None,
        notional: None,
        limit_price: None,
        status: OrderStatus::Skipped,
        reason: Some(reason.to_string()),
    }
}

/// Round down to 4 decimals for fractional-share order quantities.
fn floor4(x: f64) -> f64 {
    (x * 10_000.0).floor() / 10_000.0
}
