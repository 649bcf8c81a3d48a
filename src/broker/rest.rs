use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use super::{
    BrokerAccount, BrokerAuth, BrokerClient, BrokerConnector, BrokerPosition, CalendarDay,
    OrderReceipt,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// REST implementation of the broker capability set. Authenticates with
/// key/secret headers against the account's own base URL (paper and live
/// credentials differ only in URL and key material).
pub struct RestBroker {
    client: reqwest::Client,
    auth: BrokerAuth,
}

/// Numeric fields arrive as JSON strings from the broker; deserialize both.
#[derive(Debug, Deserialize)]
struct RawAccount {
    #[serde(deserialize_with = "de_f64")]
    equity: f64,
    #[serde(deserialize_with = "de_f64")]
    cash: f64,
    #[serde(deserialize_with = "de_f64")]
    buying_power: f64,
    #[serde(deserialize_with = "de_f64")]
    portfolio_value: f64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    symbol: String,
    #[serde(deserialize_with = "de_f64")]
    qty: f64,
    #[serde(deserialize_with = "de_f64")]
    avg_entry_price: f64,
    #[serde(deserialize_with = "de_f64")]
    current_price: f64,
    #[serde(deserialize_with = "de_f64")]
    market_value: f64,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "p")]
    price: f64,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    #[serde(rename = "latestTrade")]
    latest_trade: Option<RawTrade>,
}

impl RestBroker {
    pub fn new(client: reqwest::Client, auth: BrokerAuth) -> Self {
        RestBroker { client, auth }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.auth.base_url.trim_end_matches('/'), path);
        self.client
            .request(method, url)
            .header("X-API-KEY-ID", &self.auth.api_key)
            .header("X-API-SECRET-KEY", &self.auth.api_secret)
            .timeout(REQUEST_TIMEOUT)
    }

    async fn submit_order(&self, body: serde_json::Value) -> Result<OrderReceipt> {
        let resp = self
            .request(reqwest::Method::POST, "/v2/orders")
            .json(&body)
            .send()
            .await
            .context("submitting order")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("order rejected ({status}): {text}");
        }

        resp.json::<OrderReceipt>()
            .await
            .context("parsing order receipt")
    }
}

#[async_trait]
impl BrokerClient for RestBroker {
    async fn account(&self) -> Result<BrokerAccount> {
        let raw: RawAccount = self
            .request(reqwest::Method::GET, "/v2/account")
            .send()
            .await
            .context("fetching account")?
            .error_for_status()
            .context("account request")?
            .json()
            .await
            .context("parsing account")?;

        Ok(BrokerAccount {
            equity: raw.equity,
            cash: raw.cash,
            buying_power: raw.buying_power,
            portfolio_value: raw.portfolio_value,
            status: raw.status,
        })
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>> {
        let raw: Vec<RawPosition> = self
            .request(reqwest::Method::GET, "/v2/positions")
            .send()
            .await
            .context("fetching positions")?
            .error_for_status()
            .context("positions request")?
            .json()
            .await
            .context("parsing positions")?;

        Ok(raw
            .into_iter()
            .map(|p| BrokerPosition {
                symbol: p.symbol.to_uppercase(),
                qty: p.qty,
                avg_entry_price: p.avg_entry_price,
                current_price: p.current_price,
                market_value: p.market_value,
            })
            .collect())
    }

    async fn latest_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let joined = symbols.join(",");
        let batched: Result<HashMap<String, RawSnapshot>> = async {
            self.request(
                reqwest::Method::GET,
                &format!("/v2/stocks/snapshots?symbols={joined}"),
            )
            .send()
            .await
            .context("fetching snapshots")?
            .error_for_status()
            .context("snapshots request")?
            .json()
            .await
            .context("parsing snapshots")
        }
        .await;

        let mut out = HashMap::new();
        match batched {
            Ok(snapshots) => {
                for (symbol, snap) in snapshots {
                    if let Some(trade) = snap.latest_trade
                        && trade.price > 0.0
                    {
                        out.insert(symbol.to_uppercase(), trade.price);
                    }
                }
            }
            Err(_) => {
                // Single-ticker fallback when the batched endpoint is out.
                for symbol in symbols {
                    let single: Result<RawSnapshot> = async {
                        self.request(
                            reqwest::Method::GET,
                            &format!("/v2/stocks/snapshots/{symbol}"),
                        )
                        .send()
                        .await?
                        .error_for_status()?
                        .json()
                        .await
                        .map_err(Into::into)
                    }
                    .await;

                    if let Ok(snap) = single
                        && let Some(trade) = snap.latest_trade
                        && trade.price > 0.0
                    {
                        out.insert(symbol.to_uppercase(), trade.price);
                    }
                }
            }
        }

        Ok(out)
    }

    async fn cancel_open_orders(&self) -> Result<()> {
        self.request(reqwest::Method::DELETE, "/v2/orders")
            .send()
            .await
            .context("cancelling open orders")?
            .error_for_status()
            .context("cancel request")?;
        Ok(())
    }

    async fn submit_market_sell(&self, symbol: &str, qty: f64) -> Result<OrderReceipt> {
        self.submit_order(json!({
            "symbol": symbol,
            "side": "sell",
            "type": "market",
            "time_in_force": "day",
            "qty": format!("{qty}"),
        }))
        .await
    }

    async fn submit_notional_market_buy(
        &self,
        symbol: &str,
        notional: f64,
    ) -> Result<OrderReceipt> {
        self.submit_order(json!({
            "symbol": symbol,
            "side": "buy",
            "type": "market",
            "time_in_force": "day",
            "notional": format!("{notional:.2}"),
        }))
        .await
    }

    async fn submit_limit_buy(
        &self,
        symbol: &str,
        qty: f64,
        limit_price: f64,
    ) -> Result<OrderReceipt> {
        self.submit_order(json!({
            "symbol": symbol,
            "side": "buy",
            "type": "limit",
            "time_in_force": "day",
            "qty": format!("{qty}"),
            "limit_price": format!("{limit_price:.2}"),
        }))
        .await
    }

    async fn market_calendar(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<CalendarDay>> {
        self.request(
            reqwest::Method::GET,
            &format!("/v2/calendar?start={from}&end={to}"),
        )
        .send()
        .await
        .context("fetching market calendar")?
        .error_for_status()
        .context("calendar request")?
        .json()
        .await
        .context("parsing market calendar")
    }
}

/// Production connector: one shared reqwest client, per-account auth.
pub struct RestConnector {
    client: reqwest::Client,
}

impl RestConnector {
    pub fn new() -> Self {
        RestConnector {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for RestConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerConnector for RestConnector {
    fn connect(&self, auth: &BrokerAuth) -> Result<Arc<dyn BrokerClient>> {
        Ok(Arc::new(RestBroker::new(
            self.client.clone(),
            auth.clone(),
        )))
    }
}

/// Accept both `42.5` and `"42.5"`.
fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
    }

    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
