#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::NaiveDate;

use trade_flow::broker::{
    BrokerAccount, BrokerAuth, BrokerClient, BrokerConnector, BrokerPosition, CalendarDay,
    OrderReceipt,
};
use trade_flow::evaluator::{AllocationEntry, AllocationPoint, EvaluateOptions, Evaluator};
use trade_flow::marketdata::PriceProvider;
use trade_flow::model::AccountKey;
use trade_flow::model::payload::PayloadNode;
use trade_flow::model::settings::{CredentialType, TradingSettings, WeightMode};
use trade_flow::pipeline::Pipeline;
use trade_flow::prices::{PriceAuthority, PriceAuthorityOptions};
use trade_flow::store::{self, Db};
use trade_flow::vault::Vault;

// ── Mock broker ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub seq: usize,
    pub side: &'static str,
    pub symbol: String,
    pub qty: Option<f64>,
    pub notional: Option<f64>,
}

#[derive(Debug, Default)]
pub struct BrokerState {
    pub equity: f64,
    pub cash: f64,
    /// symbol → qty
    pub positions: HashMap<String, f64>,
    /// symbol → price used for snapshots and fills
    pub prices: HashMap<String, f64>,
    pub order_log: Vec<OrderRecord>,
    /// Apply orders to positions so the settle re-snapshot sees fills.
    pub fill_orders: bool,
    pub calendar: Vec<CalendarDay>,
    pub calendar_calls: usize,
    pub fail_account: bool,
}

/// In-memory broker with an append-only order log. Orders fill instantly at
/// the configured price when `fill_orders` is set.
pub struct MockBroker {
    pub state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new(equity: f64, cash: f64) -> Arc<Self> {
        Arc::new(MockBroker {
            state: Arc::new(Mutex::new(BrokerState {
                equity,
                cash,
                fill_orders: true,
                ..Default::default()
            })),
        })
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state.lock().unwrap().prices.insert(symbol.to_string(), price);
    }

    pub fn set_position(&self, symbol: &str, qty: f64) {
        self.state.lock().unwrap().positions.insert(symbol.to_string(), qty);
    }

    pub fn orders(&self) -> Vec<OrderRecord> {
        self.state.lock().unwrap().order_log.clone()
    }

    fn log(&self, side: &'static str, symbol: &str, qty: Option<f64>, notional: Option<f64>) {
        let mut state = self.state.lock().unwrap();
        let seq = state.order_log.len();
        state.order_log.push(OrderRecord {
            seq,
            side,
            symbol: symbol.to_string(),
            qty,
            notional,
        });
    }

    fn receipt(symbol: &str, side: &str) -> OrderReceipt {
        OrderReceipt {
            id: format!("ord-{symbol}-{side}"),
            symbol: symbol.to_string(),
            side: side.to_string(),
            status: "accepted".to_string(),
        }
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn account(&self) -> Result<BrokerAccount> {
        let state = self.state.lock().unwrap();
        if state.fail_account {
            bail!("simulated 503 from broker");
        }
        Ok(BrokerAccount {
            equity: state.equity,
            cash: state.cash,
            buying_power: state.cash,
            portfolio_value: state.equity,
            status: "ACTIVE".to_string(),
        })
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .positions
            .iter()
            .filter(|(_, qty)| **qty > 1e-9)
            .map(|(symbol, &qty)| {
                let price = state.prices.get(symbol).copied().unwrap_or(0.0);
                BrokerPosition {
                    symbol: symbol.clone(),
                    qty,
                    avg_entry_price: price,
                    current_price: price,
                    market_value: qty * price,
                }
            })
            .collect())
    }

    async fn latest_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>> {
        let state = self.state.lock().unwrap();
        Ok(symbols
            .iter()
            .filter_map(|s| state.prices.get(s).map(|&p| (s.clone(), p)))
            .collect())
    }

    async fn cancel_open_orders(&self) -> Result<()> {
        Ok(())
    }

    async fn submit_market_sell(&self, symbol: &str, qty: f64) -> Result<OrderReceipt> {
        self.log("sell", symbol, Some(qty), None);
        let mut state = self.state.lock().unwrap();
        if state.fill_orders {
            let held = state.positions.entry(symbol.to_string()).or_insert(0.0);
            *held = (*held - qty).max(0.0);
        }
        Ok(Self::receipt(symbol, "sell"))
    }

    async fn submit_notional_market_buy(
        &self,
        symbol: &str,
        notional: f64,
    ) -> Result<OrderReceipt> {
        self.log("buy", symbol, None, Some(notional));
        let mut state = self.state.lock().unwrap();
        if state.fill_orders {
            let price = state.prices.get(symbol).copied().unwrap_or(0.0);
            if price > 0.0 {
                *state.positions.entry(symbol.to_string()).or_insert(0.0) += notional / price;
            }
        }
        Ok(Self::receipt(symbol, "buy"))
    }

    async fn submit_limit_buy(
        &self,
        symbol: &str,
        qty: f64,
        _limit_price: f64,
    ) -> Result<OrderReceipt> {
        self.log("buy", symbol, Some(qty), None);
        let mut state = self.state.lock().unwrap();
        if state.fill_orders {
            *state.positions.entry(symbol.to_string()).or_insert(0.0) += qty;
        }
        Ok(Self::receipt(symbol, "buy"))
    }

    async fn market_calendar(&self, _from: NaiveDate, _to: NaiveDate) -> Result<Vec<CalendarDay>> {
        let mut state = self.state.lock().unwrap();
        state.calendar_calls += 1;
        Ok(state.calendar.clone())
    }
}

/// Routes `connect` calls to pre-registered brokers by base URL.
#[derive(Default)]
pub struct MockConnector {
    brokers: Mutex<HashMap<String, Arc<MockBroker>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(MockConnector::default())
    }

    pub fn register(&self, base_url: &str, broker: Arc<MockBroker>) {
        self.brokers
            .lock()
            .unwrap()
            .insert(base_url.to_string(), broker);
    }
}

impl BrokerConnector for MockConnector {
    fn connect(&self, auth: &BrokerAuth) -> Result<Arc<dyn BrokerClient>> {
        let brokers = self.brokers.lock().unwrap();
        match brokers.get(&auth.base_url) {
            Some(broker) => Ok(Arc::clone(broker) as Arc<dyn BrokerClient>),
            None => bail!("no mock broker registered for {}", auth.base_url),
        }
    }
}

// ── Mock evaluator ──────────────────────────────────────────────────

/// Keyed by serialized payload; records every call so tests can assert the
/// dedup guarantee (one evaluation per unique system).
#[derive(Default)]
pub struct MockEvaluator {
    /// payload json → today's entries, or None to simulate evaluator failure
    responses: Mutex<HashMap<String, Option<Vec<(String, f64)>>>>,
    calls: Mutex<Vec<String>>,
}

impl MockEvaluator {
    pub fn new() -> Arc<Self> {
        Arc::new(MockEvaluator::default())
    }

    pub fn respond(&self, payload: &PayloadNode, entries: &[(&str, f64)]) {
        let key = serde_json::to_string(payload).unwrap();
        self.responses.lock().unwrap().insert(
            key,
            Some(
                entries
                    .iter()
                    .map(|(t, w)| (t.to_string(), *w))
                    .collect(),
            ),
        );
    }

    pub fn fail_for(&self, payload: &PayloadNode) {
        let key = serde_json::to_string(payload).unwrap();
        self.responses.lock().unwrap().insert(key, None);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Evaluator for MockEvaluator {
    async fn evaluate(
        &self,
        payload: &PayloadNode,
        _opts: &EvaluateOptions,
    ) -> Result<Vec<AllocationPoint>> {
        let key = serde_json::to_string(payload).unwrap();
        self.calls.lock().unwrap().push(key.clone());

        let responses = self.responses.lock().unwrap();
        match responses.get(&key) {
            Some(Some(entries)) => Ok(vec![AllocationPoint {
                date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
                entries: entries
                    .iter()
                    .map(|(ticker, weight)| AllocationEntry {
                        ticker: ticker.clone(),
                        weight: *weight,
                    })
                    .collect(),
            }]),
            Some(None) => bail!("simulated evaluator failure"),
            None => bail!("no mock response for payload"),
        }
    }
}

// ── Mock price provider ─────────────────────────────────────────────

#[derive(Default)]
pub struct MockProvider {
    prices: Mutex<HashMap<String, f64>>,
}

impl MockProvider {
    pub fn new(prices: &[(&str, f64)]) -> Arc<Self> {
        Arc::new(MockProvider {
            prices: Mutex::new(
                prices
                    .iter()
                    .map(|(t, p)| (t.to_string(), *p))
                    .collect(),
            ),
        })
    }
}

#[async_trait]
impl PriceProvider for MockProvider {
    async fn latest_price(&self, ticker: &str) -> Result<f64> {
        match self.prices.lock().unwrap().get(ticker) {
            Some(&price) => Ok(price),
            None => bail!("no quote for {ticker}"),
        }
    }
}

// ── Seed helpers ────────────────────────────────────────────────────

pub fn test_vault() -> Vault {
    Vault::new("integration-test-secret").expect("vault")
}

pub fn leaf_payload(tickers: &[&str]) -> PayloadNode {
    PayloadNode::Leaf {
        positions: tickers.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn paper(user: &str) -> AccountKey {
    AccountKey::new(user, CredentialType::Paper)
}

pub async fn seed_settings(db: &Db, user: &str, settings: &TradingSettings) {
    let conn = db.lock().await;
    store::settings::save(&conn, user, settings).expect("settings");
}

pub async fn seed_enabled_user(db: &Db, user: &str) {
    let settings = TradingSettings {
        enabled: true,
        ..TradingSettings::default()
    };
    seed_settings(db, user, &settings).await;
}

pub async fn seed_credentials(db: &Db, vault: &Vault, account: &AccountKey, base_url: &str) {
    let row = store::credentials::CredentialRow {
        account: account.clone(),
        api_key: vault.encrypt("test-key"),
        api_secret: vault.encrypt("test-secret"),
        base_url: base_url.to_string(),
    };
    let conn = db.lock().await;
    store::credentials::put(&conn, &row).expect("credentials");
}

pub async fn seed_system(db: &Db, system_id: &str, payload: &PayloadNode) {
    let conn = db.lock().await;
    store::systems::save_payload(&conn, system_id, payload).expect("system");
}

pub async fn seed_investment(db: &Db, account: &AccountKey, system_id: &str, dollars: f64) {
    let conn = db.lock().await;
    store::investments::upsert(
        &conn,
        &trade_flow::model::Investment {
            account: account.clone(),
            system_id: system_id.to_string(),
            amount: dollars,
            weight_mode: WeightMode::Dollars,
        },
    )
    .expect("investment");
}

/// Pipeline with all delays zeroed.
pub fn fast_pipeline(
    db: Db,
    vault: Arc<Vault>,
    evaluator: Arc<MockEvaluator>,
    provider: Arc<MockProvider>,
    connector: Arc<MockConnector>,
) -> Pipeline {
    Pipeline {
        db,
        vault,
        evaluator,
        price_authority: PriceAuthority::new(
            provider,
            PriceAuthorityOptions {
                batch_delay: std::time::Duration::ZERO,
                ..PriceAuthorityOptions::default()
            },
        ),
        connector,
        settle_wait: std::time::Duration::ZERO,
    }
}
