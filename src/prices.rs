use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::marketdata::PriceProvider;
use crate::model::Ticker;

/// Where a ticker's price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Primary,
    Fallback,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Primary,
    Fallback,
    Emergency,
}

/// Provenance for one requested ticker. Present for every requested ticker,
/// whether or not a price was found.
#[derive(Debug, Clone, Serialize)]
pub struct PriceMeta {
    pub price: Option<f64>,
    pub source: PriceSource,
    pub confidence: Confidence,
    pub fetched_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one authority run. `prices` holds only tickers with a valid
/// price; `meta` covers every requested ticker.
#[derive(Debug, Default)]
pub struct PriceBook {
    pub prices: HashMap<Ticker, f64>,
    pub meta: HashMap<Ticker, PriceMeta>,
}

impl PriceBook {
    pub fn get(&self, ticker: &str) -> Option<f64> {
        self.prices.get(ticker).copied()
    }

    /// Any price served by the broker instead of the primary provider.
    pub fn degraded(&self) -> bool {
        self.meta
            .values()
            .any(|m| m.confidence == Confidence::Fallback)
    }

    /// Any ticker with no price at all.
    pub fn emergency(&self) -> bool {
        self.meta
            .values()
            .any(|m| m.confidence == Confidence::Emergency)
    }
}

#[derive(Debug, Clone)]
pub struct PriceAuthorityOptions {
    /// Primary-provider requests in flight at once.
    pub max_concurrent: usize,
    /// Pause between batches, to stay under provider rate limits.
    pub batch_delay: Duration,
    pub request_timeout: Duration,
    pub fallback_enabled: bool,
}

impl Default for PriceAuthorityOptions {
    fn default() -> Self {
        PriceAuthorityOptions {
            max_concurrent: 5,
            batch_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
            fallback_enabled: true,
        }
    }
}

/// Three-tier price fetch: primary provider in bounded parallel batches,
/// broker fallback for the stragglers in one call, and an explicit emergency
/// marker for anything still missing.
pub struct PriceAuthority {
    provider: Arc<dyn PriceProvider>,
    opts: PriceAuthorityOptions,
}

impl PriceAuthority {
    pub fn new(provider: Arc<dyn PriceProvider>, opts: PriceAuthorityOptions) -> Self {
        PriceAuthority { provider, opts }
    }

    pub async fn fetch(&self, tickers: &[Ticker], broker: Option<&dyn BrokerClient>) -> PriceBook {
        let mut book = PriceBook::default();
        let mut failed: Vec<(Ticker, String)> = Vec::new();

        for batch in tickers.chunks(self.opts.max_concurrent.max(1)) {
            let mut set: JoinSet<(Ticker, Result<f64, String>)> = JoinSet::new();
            for ticker in batch {
                let provider = Arc::clone(&self.provider);
                let ticker = ticker.clone();
                let timeout = self.opts.request_timeout;
                set.spawn(async move {
                    let result =
                        match tokio::time::timeout(timeout, provider.latest_price(&ticker)).await {
                            Ok(Ok(price)) if price > 0.0 => Ok(price),
                            Ok(Ok(price)) => Err(format!("non-positive price {price}")),
                            Ok(Err(e)) => Err(format!("{e:#}")),
                            Err(_) => Err("timed out".to_string()),
                        };
                    (ticker, result)
                });
            }

            while let Some(joined) = set.join_next().await {
                let Ok((ticker, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(price) => {
                        book.prices.insert(ticker.clone(), price);
                        book.meta.insert(
                            ticker,
                            PriceMeta {
                                price: Some(price),
                                source: PriceSource::Primary,
                                confidence: Confidence::Primary,
                                fetched_at: Utc::now(),
                                error: None,
                            },
                        );
                    }
                    Err(err) => failed.push((ticker, err)),
                }
            }

            if !self.opts.batch_delay.is_zero() {
                tokio::time::sleep(self.opts.batch_delay).await;
            }
        }

        // Second tier: one batched broker call for everything that missed.
        let mut broker_prices: HashMap<String, f64> = HashMap::new();
        if self.opts.fallback_enabled
            && !failed.is_empty()
            && let Some(broker) = broker
        {
            let symbols: Vec<String> = failed.iter().map(|(t, _)| t.clone()).collect();
            match broker.latest_prices(&symbols).await {
                Ok(map) => broker_prices = map,
                Err(e) => warn!(error = %format!("{e:#}"), "broker price fallback failed"),
            }
        }

        for (ticker, err) in failed {
            match broker_prices.get(&ticker) {
                Some(&price) if price > 0.0 => {
                    book.prices.insert(ticker.clone(), price);
                    book.meta.insert(
                        ticker,
                        PriceMeta {
                            price: Some(price),
                            source: PriceSource::Fallback,
                            confidence: Confidence::Fallback,
                            fetched_at: Utc::now(),
                            error: Some(err),
                        },
                    );
                }
                _ => {
                    book.meta.insert(
                        ticker,
                        PriceMeta {
                            price: None,
                            source: PriceSource::None,
                            confidence: Confidence::Emergency,
                            fetched_at: Utc::now(),
                            error: Some(err),
                        },
                    );
                }
            }
        }

        let primary = book
            .meta
            .values()
            .filter(|m| m.confidence == Confidence::Primary)
            .count();
        let fallback = book
            .meta
            .values()
            .filter(|m| m.confidence == Confidence::Fallback)
            .count();
        let emergency = book
            .meta
            .values()
            .filter(|m| m.confidence == Confidence::Emergency)
            .count();

        info!(
            requested = tickers.len(),
            primary, fallback, emergency, "price fetch complete"
        );
        if fallback > 0 {
            warn!(fallback, "price authority degraded: broker fallback in use");
        }
        if emergency > 0 {
            warn!(emergency, "price authority emergency: tickers without prices");
        }

        book
    }
}
