use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::model::settings::WeightMode;
use crate::model::{AccountKey, Investment};

pub fn for_account(conn: &Connection, account: &AccountKey) -> Result<Vec<Investment>> {
    let mut stmt = conn.prepare(
        "SELECT bot_id, investment_amount, weight_mode
         FROM user_bot_investments
         WHERE user_id = ?1 AND credential_type = ?2
         ORDER BY bot_id",
    )?;

    let rows = stmt
        .query_map(
            params![account.user_id, account.credential_type.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()
        .context("loading investments")?;

    Ok(rows
        .into_iter()
        .map(|(system_id, amount, mode)| Investment {
            account: account.clone(),
            system_id,
            amount,
            weight_mode: WeightMode::parse(&mode).unwrap_or(WeightMode::Dollars),
        })
        .collect())
}

pub fn upsert(conn: &Connection, inv: &Investment) -> Result<()> {
    conn.execute(
        "INSERT INTO user_bot_investments
             (user_id, credential_type, bot_id, investment_amount, weight_mode)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (user_id, credential_type, bot_id) DO UPDATE SET
             investment_amount = excluded.investment_amount,
             weight_mode = excluded.weight_mode",
        params![
            inv.account.user_id,
            inv.account.credential_type.as_str(),
            inv.system_id,
            inv.amount,
            inv.weight_mode.as_str(),
        ],
    )
    .context("storing investment")?;
    Ok(())
}

pub fn has_any(conn: &Connection, account: &AccountKey) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM user_bot_investments
         WHERE user_id = ?1 AND credential_type = ?2",
        params![account.user_id, account.credential_type.as_str()],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}
