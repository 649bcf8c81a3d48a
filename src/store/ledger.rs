use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::model::bucket::Bucket;
use crate::model::{AccountKey, SHARE_EPS, Ticker};

/// One attribution row: shares of a symbol held on behalf of a bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRow {
    pub account: AccountKey,
    pub bucket: Bucket,
    pub symbol: Ticker,
    pub shares: f64,
    pub avg_price: f64,
}

/// Rows with meaningful share counts for one account.
pub fn positions_for_account(conn: &Connection, account: &AccountKey) -> Result<Vec<LedgerRow>> {
    let mut stmt = conn.prepare(
        "SELECT bot_id, symbol, shares, avg_price
         FROM bot_position_ledger
         WHERE user_id = ?1 AND credential_type = ?2 AND shares >= ?3
         ORDER BY bot_id, symbol",
    )?;

    let rows = stmt
        .query_map(
            params![account.user_id, account.credential_type.as_str(), SHARE_EPS],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()
        .context("loading ledger positions")?;

    Ok(rows
        .into_iter()
        .map(|(bucket, symbol, shares, avg_price)| LedgerRow {
            account: account.clone(),
            bucket: Bucket::from_db(&bucket),
            symbol,
            shares,
            avg_price,
        })
        .collect())
}

pub fn upsert(conn: &Connection, row: &LedgerRow) -> Result<()> {
    conn.execute(
        "INSERT INTO bot_position_ledger
             (user_id, credential_type, bot_id, symbol, shares, avg_price, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, unixepoch())
         ON CONFLICT (user_id, credential_type, bot_id, symbol) DO UPDATE SET
             shares = excluded.shares,
             avg_price = excluded.avg_price,
             updated_at = excluded.updated_at",
        params![
            row.account.user_id,
            row.account.credential_type.as_str(),
            row.bucket.as_db(),
            row.symbol,
            row.shares,
            row.avg_price,
        ],
    )
    .context("upserting ledger row")?;
    Ok(())
}

pub fn delete(conn: &Connection, account: &AccountKey, bucket: &Bucket, symbol: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM bot_position_ledger
         WHERE user_id = ?1 AND credential_type = ?2 AND bot_id = ?3 AND symbol = ?4",
        params![
            account.user_id,
            account.credential_type.as_str(),
            bucket.as_db(),
            symbol,
        ],
    )
    .context("deleting ledger row")?;
    Ok(())
}

/// Apply one account's ledger rewrite atomically: a crash leaves either the
/// previous snapshot or the new one, never a partial mix.
pub fn write_snapshot(
    conn: &mut Connection,
    account: &AccountKey,
    deletes: &[(Bucket, Ticker)],
    upserts: &[LedgerRow],
) -> Result<()> {
    let tx = conn.transaction().context("starting ledger transaction")?;

    for (bucket, symbol) in deletes {
        tx.execute(
            "DELETE FROM bot_position_ledger
             WHERE user_id = ?1 AND credential_type = ?2 AND bot_id = ?3 AND symbol = ?4",
            params![
                account.user_id,
                account.credential_type.as_str(),
                bucket.as_db(),
                symbol,
            ],
        )?;
    }

    for row in upserts {
        if row.shares < SHARE_EPS {
            tx.execute(
                "DELETE FROM bot_position_ledger
                 WHERE user_id = ?1 AND credential_type = ?2 AND bot_id = ?3 AND symbol = ?4",
                params![
                    account.user_id,
                    account.credential_type.as_str(),
                    row.bucket.as_db(),
                    row.symbol,
                ],
            )?;
            continue;
        }
        tx.execute(
            "INSERT INTO bot_position_ledger
                 (user_id, credential_type, bot_id, symbol, shares, avg_price, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, unixepoch())
             ON CONFLICT (user_id, credential_type, bot_id, symbol) DO UPDATE SET
                 shares = excluded.shares,
                 avg_price = excluded.avg_price,
                 updated_at = excluded.updated_at",
            params![
                account.user_id,
                account.credential_type.as_str(),
                row.bucket.as_db(),
                row.symbol,
                row.shares,
                row.avg_price,
            ],
        )?;
    }

    // Sub-epsilon residue never survives a snapshot write.
    tx.execute(
        "DELETE FROM bot_position_ledger
         WHERE user_id = ?1 AND credential_type = ?2 AND shares < ?3",
        params![account.user_id, account.credential_type.as_str(), SHARE_EPS],
    )?;

    tx.commit().context("committing ledger transaction")
}

pub fn has_unallocated(conn: &Connection, account: &AccountKey) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM bot_position_ledger
         WHERE user_id = ?1 AND credential_type = ?2 AND bot_id = ?3 AND shares >= ?4",
        params![
            account.user_id,
            account.credential_type.as_str(),
            Bucket::Unallocated.as_db(),
            SHARE_EPS,
        ],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

pub fn has_any_positions(conn: &Connection, account: &AccountKey) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM bot_position_ledger
         WHERE user_id = ?1 AND credential_type = ?2 AND shares >= ?3",
        params![account.user_id, account.credential_type.as_str(), SHARE_EPS],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}
