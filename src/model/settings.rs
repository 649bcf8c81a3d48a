use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which broker credential scope an account runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    Paper,
    Live,
}

impl CredentialType {
    pub const ALL: [CredentialType; 2] = [CredentialType::Paper, CredentialType::Live];

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::Paper => "paper",
            CredentialType::Live => "live",
        }
    }

    pub fn parse(s: &str) -> Option<CredentialType> {
        match s {
            "paper" => Some(CredentialType::Paper),
            "live" => Some(CredentialType::Live),
            _ => None,
        }
    }
}

impl std::fmt::Display for CredentialType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an investment amount is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightMode {
    Dollars,
    Percent,
}

impl WeightMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightMode::Dollars => "dollars",
            WeightMode::Percent => "percent",
        }
    }

    pub fn parse(s: &str) -> Option<WeightMode> {
        match s {
            "dollars" => Some(WeightMode::Dollars),
            "percent" => Some(WeightMode::Percent),
            _ => None,
        }
    }
}

/// Order style used for the buy phase. Sells are always market orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "market",
            OrderKind::Limit => "limit",
        }
    }

    pub fn parse(s: &str) -> Option<OrderKind> {
        match s {
            "market" => Some(OrderKind::Market),
            "limit" => Some(OrderKind::Limit),
            _ => None,
        }
    }
}

/// How the cash reserve is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReserveMode {
    Dollars,
    Percent,
}

impl ReserveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReserveMode::Dollars => "dollars",
            ReserveMode::Percent => "percent",
        }
    }

    pub fn parse(s: &str) -> Option<ReserveMode> {
        match s {
            "dollars" => Some(ReserveMode::Dollars),
            "percent" => Some(ReserveMode::Percent),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("max_allocation_percent must be in (0, 100], got {0}")]
    InvalidMaxAllocation(f64),

    #[error("cash_reserve_amount must be nonnegative, got {0}")]
    NegativeReserve(f64),

    #[error("limit_percent must be nonnegative, got {0}")]
    NegativeLimitPercent(f64),

    #[error("market_hours_check_hour must be 0..=23, got {0}")]
    InvalidCheckHour(u32),

    #[error("fallback_ticker must not be empty")]
    EmptyFallbackTicker,
}

/// Per-user automation settings. Loaded once per run for each user; invalid
/// settings skip that user, never the execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSettings {
    pub enabled: bool,
    pub minutes_before_close: u32,
    pub order_kind: OrderKind,
    /// Limit buys are priced `price × (1 + limit_percent / 100)`.
    pub limit_percent: f64,
    /// Upper bound on the total merged allocation before share sizing.
    pub max_allocation_percent: f64,
    /// Receives the weight of any system whose evaluation failed.
    pub fallback_ticker: String,
    pub cash_reserve_mode: ReserveMode,
    pub cash_reserve_amount: f64,
    /// Opposing pairs netted against each other before sizing.
    pub paired_tickers: Vec<(String, String)>,
    /// Hour (Eastern) of the daily market-hours cache refresh.
    pub market_hours_check_hour: u32,
}

impl Default for TradingSettings {
    fn default() -> Self {
        TradingSettings {
            enabled: false,
            minutes_before_close: 10,
            order_kind: OrderKind::Market,
            limit_percent: 0.5,
            max_allocation_percent: 99.0,
            fallback_ticker: "SGOV".to_string(),
            cash_reserve_mode: ReserveMode::Dollars,
            cash_reserve_amount: 0.0,
            paired_tickers: Vec::new(),
            market_hours_check_hour: 4,
        }
    }
}

impl TradingSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(self.max_allocation_percent > 0.0 && self.max_allocation_percent <= 100.0) {
            return Err(SettingsError::InvalidMaxAllocation(
                self.max_allocation_percent,
            ));
        }
        if self.cash_reserve_amount < 0.0 {
            return Err(SettingsError::NegativeReserve(self.cash_reserve_amount));
        }
        if self.limit_percent < 0.0 {
            return Err(SettingsError::NegativeLimitPercent(self.limit_percent));
        }
        if self.market_hours_check_hour > 23 {
            return Err(SettingsError::InvalidCheckHour(self.market_hours_check_hour));
        }
        if self.fallback_ticker.trim().is_empty() {
            return Err(SettingsError::EmptyFallbackTicker);
        }
        Ok(())
    }
}
