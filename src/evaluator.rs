use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::payload::PayloadNode;

/// One day's target weights as produced by the strategy evaluator,
/// `weight ∈ [0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationEntry {
    pub ticker: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationPoint {
    pub date: NaiveDate,
    pub entries: Vec<AllocationEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluateOptions {
    pub mode: String,
    #[serde(rename = "benchmarkTicker")]
    pub benchmark_ticker: String,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        EvaluateOptions {
            mode: "live".to_string(),
            benchmark_ticker: "SPY".to_string(),
        }
    }
}

/// The strategy evaluator, injected as a contract. It turns an opaque payload
/// tree into a time series of daily allocations; the last point is today.
/// The engine never interprets the payload itself.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        payload: &PayloadNode,
        opts: &EvaluateOptions,
    ) -> Result<Vec<AllocationPoint>>;
}

#[derive(Debug, Serialize)]
struct EvaluateRequest<'a> {
    payload: &'a PayloadNode,
    mode: &'a str,
    #[serde(rename = "benchmarkTicker")]
    benchmark_ticker: &'a str,
}

#[derive(Debug, Deserialize)]
struct EvaluateResponse {
    allocations: Vec<AllocationPoint>,
}

/// Calls the evaluator service over HTTP. The service owns strategy
/// semantics; this client only ships the payload and unpacks the series.
pub struct HttpEvaluator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEvaluator {
    pub fn new(base_url: String) -> Self {
        HttpEvaluator {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(
        &self,
        payload: &PayloadNode,
        opts: &EvaluateOptions,
    ) -> Result<Vec<AllocationPoint>> {
        let url = format!("{}/backtest", self.base_url.trim_end_matches('/'));
        let resp: EvaluateResponse = self
            .client
            .post(&url)
            .json(&EvaluateRequest {
                payload,
                mode: &opts.mode,
                benchmark_ticker: &opts.benchmark_ticker,
            })
            .send()
            .await
            .context("evaluator request")?
            .error_for_status()
            .context("evaluator status")?
            .json()
            .await
            .context("parsing evaluator response")?;

        Ok(resp.allocations)
    }
}
