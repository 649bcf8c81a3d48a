mod mock_common;

use std::sync::Arc;

use trade_flow::model::bucket::Bucket;
use trade_flow::model::execution::{OrderStatus, QueueStatus};
use trade_flow::model::{AccountKey, SHARE_EPS};
use trade_flow::pipeline::{ExecutionMode, PipelineOutcome};
use trade_flow::store::ledger::LedgerRow;
use trade_flow::store::{self, Db};
use trade_flow::vault::Vault;
use trade_flow::warmup;

use mock_common::*;

async fn run_execution(
    db: &Db,
    vault: &Arc<Vault>,
    evaluator: &Arc<MockEvaluator>,
    provider: &Arc<MockProvider>,
    connector: &Arc<MockConnector>,
    execution_id: &str,
    mode: ExecutionMode,
) -> PipelineOutcome {
    let output = {
        let conn = db.lock().await;
        warmup::run(&conn, execution_id, None).unwrap()
    };
    let pipeline = fast_pipeline(
        Arc::clone(db),
        Arc::clone(vault),
        Arc::clone(evaluator),
        Arc::clone(provider),
        Arc::clone(connector),
    );
    pipeline.run(execution_id, &output, mode).await.unwrap()
}

async fn ledger_rows(db: &Db, account: &AccountKey) -> Vec<LedgerRow> {
    let conn = db.lock().await;
    store::ledger::positions_for_account(&conn, account).unwrap()
}

fn shares_of(rows: &[LedgerRow], bucket: &Bucket, symbol: &str) -> Option<f64> {
    rows.iter()
        .find(|r| &r.bucket == bucket && r.symbol == symbol)
        .map(|r| r.shares)
}

/// First run for a fresh account: one system at 60/40, $10k equity, 99% cap.
#[tokio::test]
async fn first_run_buys_capped_targets_and_attributes_ledger() {
    let db = store::open_in_memory().unwrap();
    let vault = Arc::new(test_vault());
    let account = paper("u1");

    seed_enabled_user(&db, "u1").await;
    seed_credentials(&db, &vault, &account, "mock://u1").await;
    let payload = leaf_payload(&["SPY", "BIL"]);
    seed_system(&db, "s1", &payload).await;
    seed_investment(&db, &account, "s1", 10_000.0).await;

    let evaluator = MockEvaluator::new();
    evaluator.respond(&payload, &[("SPY", 0.6), ("BIL", 0.4)]);

    let provider = MockProvider::new(&[("SPY", 400.0), ("BIL", 100.0)]);

    let broker = MockBroker::new(10_000.0, 10_000.0);
    broker.set_price("SPY", 400.0);
    broker.set_price("BIL", 100.0);
    let connector = MockConnector::new();
    connector.register("mock://u1", Arc::clone(&broker));

    let outcome = run_execution(
        &db,
        &vault,
        &evaluator,
        &provider,
        &connector,
        "exec-s1",
        ExecutionMode::ExecutePaper,
    )
    .await;

    assert_eq!(outcome.users_completed, 1);
    assert_eq!(outcome.users_failed, 0);
    assert_eq!(outcome.trades, 2);

    // Only buys, sized off the 99%-capped merge: 59.4% and 39.6% of $10k.
    let orders = broker.orders();
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o.side == "buy"));
    let spy = orders.iter().find(|o| o.symbol == "SPY").unwrap();
    let bil = orders.iter().find(|o| o.symbol == "BIL").unwrap();
    assert!((spy.notional.unwrap() - 5940.0).abs() < 1e-6);
    assert!((bil.notional.unwrap() - 3960.0).abs() < 1e-6);

    // Full fills at unchanged prices land in the ledger under the system.
    let rows = ledger_rows(&db, &account).await;
    let s1 = Bucket::System("s1".into());
    assert!((shares_of(&rows, &s1, "SPY").unwrap() - 14.85).abs() < SHARE_EPS);
    assert!((shares_of(&rows, &s1, "BIL").unwrap() - 39.6).abs() < SHARE_EPS);
    assert!(rows.iter().all(|r| !r.bucket.is_unallocated()));

    // Result row persisted with the computed plan.
    let conn = db.lock().await;
    let results = store::executions::results_for_execution(&conn, "exec-s1").unwrap();
    assert_eq!(results.len(), 1);
    let (_, _, report) = &results[0];
    assert_eq!(report.status, QueueStatus::Completed);
    assert!((report.net_trades["SPY"] - 14.85).abs() < SHARE_EPS);
    assert_eq!(
        store::executions::queue_for_execution(&conn, "exec-s1").unwrap()[0].status,
        QueueStatus::Completed
    );
}

/// Two users invested in the same system: the evaluator runs exactly once.
#[tokio::test]
async fn shared_system_is_evaluated_once() {
    let db = store::open_in_memory().unwrap();
    let vault = Arc::new(test_vault());
    let payload = leaf_payload(&["SPY"]);
    seed_system(&db, "shared", &payload).await;

    let connector = MockConnector::new();
    for user in ["u1", "u2"] {
        seed_enabled_user(&db, user).await;
        let url = format!("mock://{user}");
        seed_credentials(&db, &vault, &paper(user), &url).await;
        seed_investment(&db, &paper(user), "shared", 5_000.0).await;

        let broker = MockBroker::new(5_000.0, 5_000.0);
        broker.set_price("SPY", 400.0);
        connector.register(&url, broker);
    }

    let evaluator = MockEvaluator::new();
    evaluator.respond(&payload, &[("SPY", 1.0)]);
    let provider = MockProvider::new(&[("SPY", 400.0)]);

    let outcome = run_execution(
        &db,
        &vault,
        &evaluator,
        &provider,
        &connector,
        "exec-s2",
        ExecutionMode::ExecutePaper,
    )
    .await;

    assert_eq!(outcome.users_completed, 2);
    assert_eq!(evaluator.call_count(), 1);
}

/// A failing evaluator routes that system's weight to the fallback ticker.
#[tokio::test]
async fn evaluator_failure_routes_weight_to_fallback() {
    let db = store::open_in_memory().unwrap();
    let vault = Arc::new(test_vault());
    let account = paper("u1");

    seed_enabled_user(&db, "u1").await;
    seed_credentials(&db, &vault, &account, "mock://u1").await;

    let good = leaf_payload(&["SPY"]);
    let broken = leaf_payload(&["XLK", "XLE"]);
    seed_system(&db, "s1", &good).await;
    seed_system(&db, "s2", &broken).await;
    seed_investment(&db, &account, "s1", 6_000.0).await;
    seed_investment(&db, &account, "s2", 4_000.0).await;

    let evaluator = MockEvaluator::new();
    evaluator.respond(&good, &[("SPY", 1.0)]);
    evaluator.fail_for(&broken);

    let provider = MockProvider::new(&[("SPY", 400.0), ("SGOV", 100.0)]);

    let broker = MockBroker::new(10_000.0, 10_000.0);
    broker.set_price("SPY", 400.0);
    broker.set_price("SGOV", 100.0);
    let connector = MockConnector::new();
    connector.register("mock://u1", Arc::clone(&broker));

    run_execution(
        &db,
        &vault,
        &evaluator,
        &provider,
        &connector,
        "exec-s4",
        ExecutionMode::ExecutePaper,
    )
    .await;

    // s1 at weight 0.6 → SPY 60%; s2's 0.4 flows entirely to SGOV → 40%.
    // Capped to 99 → 59.4 / 39.6 of $10k.
    let orders = broker.orders();
    let sgov = orders.iter().find(|o| o.symbol == "SGOV").unwrap();
    assert!((sgov.notional.unwrap() - 3960.0).abs() < 1e-6);
}

/// All sell orders precede any buy order within one account's run.
#[tokio::test]
async fn sells_precede_buys() {
    let db = store::open_in_memory().unwrap();
    let vault = Arc::new(test_vault());
    let account = paper("u1");

    seed_enabled_user(&db, "u1").await;
    seed_credentials(&db, &vault, &account, "mock://u1").await;
    let payload = leaf_payload(&["SPY"]);
    seed_system(&db, "s1", &payload).await;
    seed_investment(&db, &account, "s1", 10_000.0).await;

    let evaluator = MockEvaluator::new();
    evaluator.respond(&payload, &[("SPY", 1.0)]);
    let provider = MockProvider::new(&[("SPY", 400.0)]);

    // The account already holds a ticker no system claims.
    let broker = MockBroker::new(10_000.0, 9_000.0);
    broker.set_price("SPY", 400.0);
    broker.set_price("AAPL", 200.0);
    broker.set_position("AAPL", 5.0);
    let connector = MockConnector::new();
    connector.register("mock://u1", Arc::clone(&broker));

    run_execution(
        &db,
        &vault,
        &evaluator,
        &provider,
        &connector,
        "exec-order",
        ExecutionMode::ExecutePaper,
    )
    .await;

    let orders = broker.orders();
    let last_sell = orders
        .iter()
        .filter(|o| o.side == "sell")
        .map(|o| o.seq)
        .max()
        .expect("a liquidation sell");
    let first_buy = orders
        .iter()
        .filter(|o| o.side == "buy")
        .map(|o| o.seq)
        .min()
        .expect("a buy");
    assert!(last_sell < first_buy, "sells must precede buys");

    // Liquidation sold the full held quantity.
    let aapl_sell = orders.iter().find(|o| o.symbol == "AAPL").unwrap();
    assert!((aapl_sell.qty.unwrap() - 5.0).abs() < SHARE_EPS);
}

/// Frozen broker state + unchanged inputs ⇒ the second run trades nothing.
#[tokio::test]
async fn second_run_with_no_drift_is_idempotent() {
    let db = store::open_in_memory().unwrap();
    let vault = Arc::new(test_vault());
    let account = paper("u1");

    seed_enabled_user(&db, "u1").await;
    seed_credentials(&db, &vault, &account, "mock://u1").await;
    let payload = leaf_payload(&["SPY", "BIL"]);
    seed_system(&db, "s1", &payload).await;
    seed_investment(&db, &account, "s1", 10_000.0).await;

    let evaluator = MockEvaluator::new();
    evaluator.respond(&payload, &[("SPY", 0.6), ("BIL", 0.4)]);
    let provider = MockProvider::new(&[("SPY", 400.0), ("BIL", 100.0)]);

    let broker = MockBroker::new(10_000.0, 10_000.0);
    broker.set_price("SPY", 400.0);
    broker.set_price("BIL", 100.0);
    let connector = MockConnector::new();
    connector.register("mock://u1", Arc::clone(&broker));

    let first = run_execution(
        &db,
        &vault,
        &evaluator,
        &provider,
        &connector,
        "exec-a",
        ExecutionMode::ExecutePaper,
    )
    .await;
    assert_eq!(first.trades, 2);

    let second = run_execution(
        &db,
        &vault,
        &evaluator,
        &provider,
        &connector,
        "exec-b",
        ExecutionMode::ExecutePaper,
    )
    .await;

    assert_eq!(second.trades, 0, "no drift ⇒ no trades");
    assert_eq!(broker.orders().len(), 2, "order log unchanged");

    let conn = db.lock().await;
    let results = store::executions::results_for_execution(&conn, "exec-b").unwrap();
    assert!(results[0].2.net_trades.is_empty());
}

/// A credential failure marks that user failed without touching the others.
#[tokio::test]
async fn decrypt_failure_is_isolated_per_user() {
    let db = store::open_in_memory().unwrap();
    let vault = Arc::new(test_vault());
    let other_vault = Vault::new("some-other-secret").unwrap();

    let payload = leaf_payload(&["SPY"]);
    seed_system(&db, "s1", &payload).await;

    seed_enabled_user(&db, "good").await;
    seed_credentials(&db, &vault, &paper("good"), "mock://good").await;
    seed_investment(&db, &paper("good"), "s1", 1_000.0).await;

    // Credentials sealed under a different key: decryption must fail closed.
    seed_enabled_user(&db, "bad").await;
    seed_credentials(&db, &other_vault, &paper("bad"), "mock://bad").await;
    seed_investment(&db, &paper("bad"), "s1", 1_000.0).await;

    let evaluator = MockEvaluator::new();
    evaluator.respond(&payload, &[("SPY", 1.0)]);
    let provider = MockProvider::new(&[("SPY", 400.0)]);

    let connector = MockConnector::new();
    for (user, equity) in [("good", 1_000.0), ("bad", 1_000.0)] {
        let broker = MockBroker::new(equity, equity);
        broker.set_price("SPY", 400.0);
        connector.register(&format!("mock://{user}"), broker);
    }

    let outcome = run_execution(
        &db,
        &vault,
        &evaluator,
        &provider,
        &connector,
        "exec-iso",
        ExecutionMode::ExecutePaper,
    )
    .await;

    assert_eq!(outcome.users_completed, 1);
    assert_eq!(outcome.users_failed, 1);

    let conn = db.lock().await;
    for row in store::executions::queue_for_execution(&conn, "exec-iso").unwrap() {
        let expected = if row.user_id == "bad" {
            QueueStatus::Failed
        } else {
            QueueStatus::Completed
        };
        assert_eq!(row.status, expected, "user {}", row.user_id);
    }
}

/// A merged ticker without any price is skipped with a reason, and priced
/// tickers still trade.
#[tokio::test]
async fn missing_price_skips_buy_with_reason() {
    let db = store::open_in_memory().unwrap();
    let vault = Arc::new(test_vault());
    let account = paper("u1");

    seed_enabled_user(&db, "u1").await;
    seed_credentials(&db, &vault, &account, "mock://u1").await;
    let payload = leaf_payload(&["SPY", "BIL"]);
    seed_system(&db, "s1", &payload).await;
    seed_investment(&db, &account, "s1", 10_000.0).await;

    let evaluator = MockEvaluator::new();
    evaluator.respond(&payload, &[("SPY", 0.5), ("BIL", 0.5)]);

    // BIL has no quote anywhere: provider misses it and so does the broker.
    let provider = MockProvider::new(&[("SPY", 400.0)]);
    let broker = MockBroker::new(10_000.0, 10_000.0);
    broker.set_price("SPY", 400.0);
    let connector = MockConnector::new();
    connector.register("mock://u1", Arc::clone(&broker));

    run_execution(
        &db,
        &vault,
        &evaluator,
        &provider,
        &connector,
        "exec-noprice",
        ExecutionMode::ExecutePaper,
    )
    .await;

    let orders = broker.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].symbol, "SPY");

    let conn = db.lock().await;
    let results = store::executions::results_for_execution(&conn, "exec-noprice").unwrap();
    let (_, _, report) = &results[0];
    let skipped = report
        .orders
        .iter()
        .find(|o| o.symbol == "BIL" && o.status == OrderStatus::Skipped)
        .expect("skipped BIL outcome");
    assert_eq!(skipped.reason.as_deref(), Some("NoPrice"));
}

/// Simulate mode records the plan but places nothing and writes no ledger.
#[tokio::test]
async fn simulate_mode_records_plan_only() {
    let db = store::open_in_memory().unwrap();
    let vault = Arc::new(test_vault());
    let account = paper("u1");

    seed_enabled_user(&db, "u1").await;
    seed_credentials(&db, &vault, &account, "mock://u1").await;
    let payload = leaf_payload(&["SPY"]);
    seed_system(&db, "s1", &payload).await;
    seed_investment(&db, &account, "s1", 10_000.0).await;

    let evaluator = MockEvaluator::new();
    evaluator.respond(&payload, &[("SPY", 1.0)]);
    let provider = MockProvider::new(&[("SPY", 400.0)]);
    let broker = MockBroker::new(10_000.0, 10_000.0);
    broker.set_price("SPY", 400.0);
    let connector = MockConnector::new();
    connector.register("mock://u1", Arc::clone(&broker));

    let outcome = run_execution(
        &db,
        &vault,
        &evaluator,
        &provider,
        &connector,
        "exec-sim",
        ExecutionMode::Simulate,
    )
    .await;

    assert_eq!(outcome.users_completed, 1);
    assert_eq!(outcome.trades, 0);
    assert!(broker.orders().is_empty());
    assert!(ledger_rows(&db, &account).await.is_empty());

    let conn = db.lock().await;
    let results = store::executions::results_for_execution(&conn, "exec-sim").unwrap();
    assert!(!results[0].2.net_trades.is_empty());
}

/// Pending manual sells drain even when the rebalance itself has no trades.
#[tokio::test]
async fn pending_manual_sells_are_drained() {
    let db = store::open_in_memory().unwrap();
    let vault = Arc::new(test_vault());
    let account = paper("holder");

    seed_enabled_user(&db, "holder").await;
    seed_credentials(&db, &vault, &account, "mock://holder").await;

    // Ledger-only account: eligible through its unallocated position.
    {
        let conn = db.lock().await;
        store::ledger::upsert(
            &conn,
            &LedgerRow {
                account: account.clone(),
                bucket: Bucket::Unallocated,
                symbol: "SPY".into(),
                shares: 10.0,
                avg_price: 400.0,
            },
        )
        .unwrap();
        conn.execute(
            "INSERT INTO pending_manual_sells (user_id, credential_type, symbol, qty)
             VALUES ('holder', 'paper', 'SPY', 2.0)",
            [],
        )
        .unwrap();
    }

    let evaluator = MockEvaluator::new();
    let provider = MockProvider::new(&[("SPY", 400.0)]);
    let broker = MockBroker::new(4_000.0, 0.0);
    broker.set_price("SPY", 400.0);
    broker.set_position("SPY", 10.0);
    let connector = MockConnector::new();
    connector.register("mock://holder", Arc::clone(&broker));

    let outcome = run_execution(
        &db,
        &vault,
        &evaluator,
        &provider,
        &connector,
        "exec-manual",
        ExecutionMode::ExecutePaper,
    )
    .await;

    assert_eq!(outcome.users_completed, 1);
    let orders = broker.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].side, "sell");
    assert!((orders[0].qty.unwrap() - 2.0).abs() < SHARE_EPS);

    let conn = db.lock().await;
    let status: String = conn
        .query_row("SELECT status FROM pending_manual_sells", [], |r| r.get(0))
        .unwrap();
    assert_eq!(status, "executed");

    // No rebalance orders: the account has no investments.
    let results = store::executions::results_for_execution(&conn, "exec-manual").unwrap();
    assert!(results[0].2.net_trades.is_empty());
}
