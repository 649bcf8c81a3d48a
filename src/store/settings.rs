use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::model::UserId;
use crate::model::settings::{OrderKind, ReserveMode, TradingSettings};

pub fn load(conn: &Connection, user_id: &str) -> Result<Option<TradingSettings>> {
    let row = conn
        .query_row(
            "SELECT enabled, minutes_before_close, order_type, limit_percent,
                    max_allocation_percent, fallback_ticker, cash_reserve_mode,
                    cash_reserve_amount, paired_tickers, market_hours_check_hour
             FROM trading_settings WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok((
                    row.get::<_, bool>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, u32>(9)?,
                ))
            },
        )
        .optional()
        .context("loading trading settings")?;

    let Some((
        enabled,
        minutes_before_close,
        order_type,
        limit_percent,
        max_allocation_percent,
        fallback_ticker,
        reserve_mode,
        cash_reserve_amount,
        paired_json,
        market_hours_check_hour,
    )) = row
    else {
        return Ok(None);
    };

    let paired_tickers: Vec<(String, String)> =
        serde_json::from_str(&paired_json).context("parsing paired_tickers json")?;

    Ok(Some(TradingSettings {
        enabled,
        minutes_before_close,
        order_kind: OrderKind::parse(&order_type).unwrap_or(OrderKind::Market),
        limit_percent,
        max_allocation_percent,
        fallback_ticker,
        cash_reserve_mode: ReserveMode::parse(&reserve_mode).unwrap_or(ReserveMode::Dollars),
        cash_reserve_amount,
        paired_tickers,
        market_hours_check_hour,
    }))
}

pub fn save(conn: &Connection, user_id: &str, settings: &TradingSettings) -> Result<()> {
    let paired_json =
        serde_json::to_string(&settings.paired_tickers).context("encoding paired_tickers")?;

    conn.execute(
        "INSERT INTO trading_settings
             (user_id, enabled, minutes_before_close, order_type, limit_percent,
              max_allocation_percent, fallback_ticker, cash_reserve_mode,
              cash_reserve_amount, paired_tickers, market_hours_check_hour)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT (user_id) DO UPDATE SET
             enabled = excluded.enabled,
             minutes_before_close = excluded.minutes_before_close,
             order_type = excluded.order_type,
             limit_percent = excluded.limit_percent,
             max_allocation_percent = excluded.max_allocation_percent,
             fallback_ticker = excluded.fallback_ticker,
             cash_reserve_mode = excluded.cash_reserve_mode,
             cash_reserve_amount = excluded.cash_reserve_amount,
             paired_tickers = excluded.paired_tickers,
             market_hours_check_hour = excluded.market_hours_check_hour",
        params![
            user_id,
            settings.enabled,
            settings.minutes_before_close,
            settings.order_kind.as_str(),
            settings.limit_percent,
            settings.max_allocation_percent,
            settings.fallback_ticker,
            settings.cash_reserve_mode.as_str(),
            settings.cash_reserve_amount,
            paired_json,
            settings.market_hours_check_hour,
        ],
    )
    .context("saving trading settings")?;
    Ok(())
}

/// Users with automation enabled, in stable id order.
pub fn enabled_users(conn: &Connection) -> Result<Vec<UserId>> {
    let mut stmt = conn
        .prepare("SELECT user_id FROM trading_settings WHERE enabled = 1 ORDER BY user_id")?;
    let users = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()
        .context("listing enabled users")?;
    Ok(users)
}
