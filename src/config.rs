use std::path::PathBuf;

use anyhow::{Result, anyhow};

/// Every close-time computation and date string in the system is pinned to
/// US equity market time.
pub const MARKET_TZ: chrono_tz::Tz = chrono_tz::America::New_York;

/// Process-level configuration, resolved once from the environment at startup.
pub struct AppConfig {
    pub database_path: PathBuf,
    pub encryption_secret: String,
    pub marketdata_api_key: String,
    pub marketdata_base_url: Option<String>,
    pub evaluator_url: String,
}

impl AppConfig {
    /// Resolution order for the encryption secret:
    /// 1. `ENCRYPTION_SECRET` env var (direct value)
    /// 2. `BROKER_ENCRYPTION_KEY` env var (legacy name)
    /// 3. `ENCRYPTION_SECRET_FILE` env var (path to a file containing the secret)
    ///
    /// The _FILE variant is preferred in containers — the secret never appears
    /// in `env` or `printenv` output, reducing accidental exposure.
    pub fn from_env() -> Result<Self> {
        let encryption_secret = if let Ok(s) = std::env::var("ENCRYPTION_SECRET") {
            s
        } else if let Ok(s) = std::env::var("BROKER_ENCRYPTION_KEY") {
            s
        } else if let Ok(path) = std::env::var("ENCRYPTION_SECRET_FILE") {
            std::fs::read_to_string(&path)
                .map_err(|e| anyhow!("Failed to read encryption secret from {path}: {e}"))?
                .trim()
                .to_string()
        } else {
            return Err(anyhow!(
                "Encryption secret not configured. Set ENCRYPTION_SECRET (or \
                 BROKER_ENCRYPTION_KEY), or ENCRYPTION_SECRET_FILE pointing to a \
                 file containing the secret."
            ));
        };

        let database_path = std::env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("trade-flow.db"));

        let marketdata_api_key = std::env::var("MARKETDATA_API_KEY").map_err(|_| {
            anyhow!("MARKETDATA_API_KEY not set — required for the primary price provider")
        })?;

        let marketdata_base_url = std::env::var("MARKETDATA_BASE_URL").ok();

        let evaluator_url = std::env::var("EVALUATOR_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8630".to_string());

        Ok(AppConfig {
            database_path,
            encryption_secret,
            marketdata_api_key,
            marketdata_base_url,
            evaluator_url,
        })
    }
}
