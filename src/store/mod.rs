pub mod credentials;
pub mod executions;
pub mod investments;
pub mod ledger;
pub mod settings;
pub mod systems;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;

pub type Db = Arc<Mutex<Connection>>;

pub fn open(path: &Path) -> Result<Db> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("creating db directory")?;
    }

    let conn = Connection::open(path)
        .with_context(|| format!("opening sqlite at {}", path.display()))?;

    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;

    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database for tests and simulations.
pub fn open_in_memory() -> Result<Db> {
    let conn = Connection::open_in_memory().context("opening in-memory sqlite")?;
    migrate(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS broker_credentials (
            user_id              TEXT NOT NULL,
            credential_type      TEXT NOT NULL CHECK (credential_type IN ('paper', 'live')),
            encrypted_api_key    TEXT NOT NULL,
            encrypted_api_secret TEXT NOT NULL,
            iv                   TEXT NOT NULL,
            auth_tag             TEXT NOT NULL,
            base_url             TEXT NOT NULL,
            PRIMARY KEY (user_id, credential_type)
        );

        CREATE TABLE IF NOT EXISTS trading_settings (
            user_id                 TEXT PRIMARY KEY,
            enabled                 INTEGER NOT NULL DEFAULT 0,
            minutes_before_close    INTEGER NOT NULL DEFAULT 10,
            order_type              TEXT NOT NULL DEFAULT 'market',
            limit_percent           REAL NOT NULL DEFAULT 0.5,
            max_allocation_percent  REAL NOT NULL DEFAULT 99.0,
            fallback_ticker         TEXT NOT NULL DEFAULT 'SGOV',
            cash_reserve_mode       TEXT NOT NULL DEFAULT 'dollars',
            cash_reserve_amount     REAL NOT NULL DEFAULT 0.0,
            paired_tickers          TEXT NOT NULL DEFAULT '[]',
            market_hours_check_hour INTEGER NOT NULL DEFAULT 4,
            use_v2_execution        INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS bots (
            id      TEXT PRIMARY KEY,
            payload BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_bot_investments (
            user_id           TEXT NOT NULL,
            credential_type   TEXT NOT NULL,
            bot_id            TEXT NOT NULL,
            investment_amount REAL NOT NULL,
            weight_mode       TEXT NOT NULL DEFAULT 'dollars',
            PRIMARY KEY (user_id, credential_type, bot_id)
        );

        CREATE TABLE IF NOT EXISTS bot_position_ledger (
            user_id         TEXT NOT NULL,
            credential_type TEXT NOT NULL,
            bot_id          TEXT NOT NULL,
            symbol          TEXT NOT NULL,
            shares          REAL NOT NULL,
            avg_price       REAL NOT NULL,
            updated_at      INTEGER NOT NULL DEFAULT (unixepoch()),
            PRIMARY KEY (user_id, credential_type, bot_id, symbol)
        );

        CREATE TABLE IF NOT EXISTS trade_executions_v2 (
            execution_id      TEXT PRIMARY KEY,
            phase             TEXT NOT NULL,
            status            TEXT NOT NULL DEFAULT 'running',
            started_at        INTEGER NOT NULL,
            completed_at      INTEGER,
            total_users       INTEGER NOT NULL DEFAULT 0,
            total_systems     INTEGER NOT NULL DEFAULT 0,
            total_tickers     INTEGER NOT NULL DEFAULT 0,
            total_trades      INTEGER NOT NULL DEFAULT 0,
            is_early_close    INTEGER NOT NULL DEFAULT 0,
            calendar_degraded INTEGER NOT NULL DEFAULT 0,
            errors            TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS execution_queue (
            execution_id    TEXT NOT NULL,
            user_id         TEXT NOT NULL,
            credential_type TEXT NOT NULL,
            queue_position  INTEGER NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending',
            started_at      INTEGER,
            completed_at    INTEGER,
            PRIMARY KEY (execution_id, user_id, credential_type)
        );

        CREATE TABLE IF NOT EXISTS user_execution_results (
            execution_id        TEXT NOT NULL,
            user_id             TEXT NOT NULL,
            credential_type     TEXT NOT NULL,
            queue_position      INTEGER NOT NULL,
            status              TEXT NOT NULL,
            net_trades          TEXT NOT NULL DEFAULT '{}',
            orders_executed     TEXT NOT NULL DEFAULT '[]',
            attribution_results TEXT NOT NULL DEFAULT '[]',
            pnl_results         TEXT NOT NULL DEFAULT '[]',
            errors              TEXT NOT NULL DEFAULT '[]',
            started_at          INTEGER,
            completed_at        INTEGER,
            PRIMARY KEY (execution_id, user_id, credential_type)
        );

        CREATE TABLE IF NOT EXISTS system_deduplication (
            system_id       TEXT PRIMARY KEY,
            user_count      INTEGER NOT NULL DEFAULT 0,
            last_allocation TEXT,
            last_updated    INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS pending_manual_sells (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id         TEXT NOT NULL,
            credential_type TEXT NOT NULL,
            symbol          TEXT NOT NULL,
            qty             REAL NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending',
            executed_at     INTEGER,
            error_message   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_ledger_account
            ON bot_position_ledger (user_id, credential_type);
        CREATE INDEX IF NOT EXISTS idx_queue_execution
            ON execution_queue (execution_id, queue_position);
        CREATE INDEX IF NOT EXISTS idx_manual_sells_pending
            ON pending_manual_sells (user_id, credential_type, status);
        ",
    )
    .context("running migrations")?;
    Ok(())
}
