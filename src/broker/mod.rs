pub mod rest;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Decrypted connection material for one account.
#[derive(Debug, Clone)]
pub struct BrokerAuth {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
}

/// Read-only account snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerAccount {
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
    pub portfolio_value: f64,
    pub status: String,
}

/// Read-only position snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: f64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub market_value: f64,
}

/// One trading day's session times, `"HH:MM"` in market time.
/// An empty calendar response means the market is closed that day.
#[derive(Debug, Clone, Deserialize)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub open: String,
    pub close: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderReceipt {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub status: String,
}

/// The brokerage capability set the engine consumes. Implementations live at
/// the edge (REST) or in tests (mocks); the pipeline only sees this trait.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn account(&self) -> Result<BrokerAccount>;

    async fn positions(&self) -> Result<Vec<BrokerPosition>>;

    /// Latest trade prices for a batch of symbols. Missing symbols are simply
    /// absent from the map.
    async fn latest_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>>;

    async fn cancel_open_orders(&self) -> Result<()>;

    async fn submit_market_sell(&self, symbol: &str, qty: f64) -> Result<OrderReceipt>;

    async fn submit_notional_market_buy(&self, symbol: &str, notional: f64)
    -> Result<OrderReceipt>;

    async fn submit_limit_buy(&self, symbol: &str, qty: f64, limit_price: f64)
    -> Result<OrderReceipt>;

    /// Trading days in `[from, to]`; an empty list means every day in the
    /// range is closed.
    async fn market_calendar(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<CalendarDay>>;
}

/// Builds a broker client from decrypted credentials. The pipeline connects
/// per account; tests swap in mock factories.
pub trait BrokerConnector: Send + Sync {
    fn connect(&self, auth: &BrokerAuth) -> Result<Arc<dyn BrokerClient>>;
}
