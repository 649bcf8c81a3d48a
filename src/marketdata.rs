use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;

pub const DEFAULT_BASE_URL: &str = "https://api.tickerfeed.net";

/// Primary market-data source consumed by the price authority. The broker
/// fallback lives in `prices`, not here.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Latest price for one ticker. Non-positive or missing values are errors.
    async fn latest_price(&self, ticker: &str) -> Result<f64>;
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    last: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct HistoryBar {
    #[serde(rename = "adjClose")]
    adj_close: Option<f64>,
    close: Option<f64>,
}

/// Bearer-authenticated REST client for the primary provider.
///
/// `GET /price/{ticker}` returns `{"last": <number>}`; the provider's own
/// history endpoint (`GET /history/{ticker}?limit=1`, `[{adjClose|close}]`)
/// backstops tickers the quote endpoint does not cover.
pub struct MarketDataClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl MarketDataClient {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        MarketDataClient {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
        }
    }

    async fn quote(&self, ticker: &str) -> Result<f64> {
        let url = format!("{}/price/{ticker}", self.base_url.trim_end_matches('/'));
        let resp: QuoteResponse = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("quote request")?
            .error_for_status()
            .context("quote status")?
            .json()
            .await
            .context("parsing quote")?;

        match resp.last {
            Some(last) if last > 0.0 => Ok(last),
            _ => bail!("no positive last price for {ticker}"),
        }
    }

    async fn last_close(&self, ticker: &str) -> Result<f64> {
        let url = format!(
            "{}/history/{ticker}?limit=1",
            self.base_url.trim_end_matches('/')
        );
        let bars: Vec<HistoryBar> = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("history request")?
            .error_for_status()
            .context("history status")?
            .json()
            .await
            .context("parsing history")?;

        let price = bars
            .first()
            .and_then(|bar| bar.adj_close.or(bar.close))
            .unwrap_or(0.0);

        if price > 0.0 {
            Ok(price)
        } else {
            bail!("no positive close for {ticker}")
        }
    }
}

#[async_trait]
impl PriceProvider for MarketDataClient {
    async fn latest_price(&self, ticker: &str) -> Result<f64> {
        match self.quote(ticker).await {
            Ok(price) => Ok(price),
            Err(quote_err) => self
                .last_close(ticker)
                .await
                .with_context(|| format!("quote endpoint failed first: {quote_err:#}")),
        }
    }
}
