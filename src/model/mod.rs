pub mod bucket;
pub mod execution;
pub mod payload;
pub mod settings;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use settings::{CredentialType, WeightMode};

/// Uppercased exchange symbol.
pub type Ticker = String;

/// Globally shared strategy id (the same system may be invested in by many users).
pub type SystemId = String;

pub type UserId = String;

/// Target map from ticker to percent of equity, `0 ≤ percent ≤ 100`.
/// An empty map is valid and means "no positions today".
pub type Allocation = BTreeMap<Ticker, f64>;

/// Share quantities are equal when they differ by less than this.
pub const SHARE_EPS: f64 = 1e-4;

/// Weight sums are checked to this tolerance.
pub const WEIGHT_EPS: f64 = 1e-9;

/// The unit of execution: one user under one credential scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    pub user_id: UserId,
    pub credential_type: CredentialType,
}

impl AccountKey {
    pub fn new(user_id: impl Into<UserId>, credential_type: CredentialType) -> Self {
        AccountKey {
            user_id: user_id.into(),
            credential_type,
        }
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.credential_type.as_str())
    }
}

/// A user's declared commitment to one system under one credential scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investment {
    pub account: AccountKey,
    pub system_id: SystemId,
    /// Nonnegative; dollars or percent of equity depending on `weight_mode`.
    pub amount: f64,
    pub weight_mode: WeightMode,
}

impl Investment {
    /// Resolve the investment to dollars against the account's total equity.
    pub fn dollars(&self, total_equity: f64) -> f64 {
        match self.weight_mode {
            WeightMode::Dollars => self.amount,
            WeightMode::Percent => total_equity * self.amount / 100.0,
        }
    }
}
