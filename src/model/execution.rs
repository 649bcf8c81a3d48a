use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::settings::CredentialType;
use super::{SystemId, Ticker, UserId};

/// Lifecycle of one scheduled or manual run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPhase {
    Warmup,
    Execution,
    Completed,
    Failed,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::Warmup => "warmup",
            ExecutionPhase::Execution => "execution",
            ExecutionPhase::Completed => "completed",
            ExecutionPhase::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<ExecutionPhase> {
        match s {
            "warmup" => Some(ExecutionPhase::Warmup),
            "execution" => Some(ExecutionPhase::Execution),
            "completed" => Some(ExecutionPhase::Completed),
            "failed" => Some(ExecutionPhase::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionPhase::Completed | ExecutionPhase::Failed)
    }
}

/// Per-account state within an execution. Transitions only move forward:
/// `pending → executing → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Executing => "executing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<QueueStatus> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "executing" => Some(QueueStatus::Executing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTotals {
    pub users: u32,
    pub systems: u32,
    pub tickers: u32,
    pub trades: u32,
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub phase: ExecutionPhase,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub totals: ExecutionTotals,
    pub is_early_close: bool,
    pub calendar_degraded: bool,
    pub errors: Vec<String>,
}

/// One account's slot in the randomized execution order.
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub execution_id: String,
    pub user_id: UserId,
    pub credential_type: CredentialType,
    pub position: i64,
    pub status: QueueStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Submitted,
    Rejected,
    Skipped,
}

/// What happened to one intended order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderOutcome {
    pub symbol: Ticker,
    pub side: OrderSide,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notional: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Post-fill split of one held position back to a system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributedPosition {
    pub system_id: SystemId,
    pub symbol: Ticker,
    pub shares: f64,
}

/// Unrealized P&L for one system's ledger slice, priced at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPnl {
    pub system_id: SystemId,
    pub market_value: f64,
    pub cost_basis: f64,
    pub unrealized: f64,
    pub unrealized_pct: f64,
}

/// Everything the pipeline records for one account's run; persisted as the
/// `user_execution_results` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRunReport {
    pub status: QueueStatus,
    /// Ticker → share delta (positive buys, negative sells).
    pub net_trades: std::collections::BTreeMap<Ticker, f64>,
    pub orders: Vec<OrderOutcome>,
    pub attribution: Vec<AttributedPosition>,
    pub pnl: Vec<SystemPnl>,
    pub errors: Vec<String>,
}

impl UserRunReport {
    pub fn failed(errors: Vec<String>) -> Self {
        UserRunReport {
            status: QueueStatus::Failed,
            net_trades: Default::default(),
            orders: Vec::new(),
            attribution: Vec::new(),
            pnl: Vec::new(),
            errors,
        }
    }
}
