use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::model::AccountKey;
use crate::model::execution::{
    ExecutionPhase, ExecutionRecord, ExecutionTotals, QueueRow, QueueStatus, UserRunReport,
};
use crate::model::settings::CredentialType;

pub fn insert_execution(conn: &Connection, record: &ExecutionRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO trade_executions_v2
             (execution_id, phase, status, started_at, is_early_close, calendar_degraded)
         VALUES (?1, ?2, 'running', ?3, ?4, ?5)",
        params![
            record.execution_id,
            record.phase.as_str(),
            record.started_at.timestamp(),
            record.is_early_close,
            record.calendar_degraded,
        ],
    )
    .context("inserting execution record")?;
    Ok(())
}

pub fn set_phase(conn: &Connection, execution_id: &str, phase: ExecutionPhase) -> Result<()> {
    conn.execute(
        "UPDATE trade_executions_v2 SET phase = ?2 WHERE execution_id = ?1",
        params![execution_id, phase.as_str()],
    )
    .context("updating execution phase")?;
    Ok(())
}

pub fn set_totals(conn: &Connection, execution_id: &str, totals: &ExecutionTotals) -> Result<()> {
    conn.execute(
        "UPDATE trade_executions_v2
         SET total_users = ?2, total_systems = ?3, total_tickers = ?4, total_trades = ?5
         WHERE execution_id = ?1",
        params![
            execution_id,
            totals.users,
            totals.systems,
            totals.tickers,
            totals.trades,
        ],
    )
    .context("updating execution totals")?;
    Ok(())
}

/// Terminal transition: phase becomes `completed` or `failed`, the status
/// column follows, and accumulated errors are persisted.
pub fn finish(
    conn: &Connection,
    execution_id: &str,
    phase: ExecutionPhase,
    errors: &[String],
) -> Result<()> {
    debug_assert!(phase.is_terminal());
    let errors_json = serde_json::to_string(errors).context("encoding execution errors")?;
    conn.execute(
        "UPDATE trade_executions_v2
         SET phase = ?2, status = ?3, completed_at = unixepoch(), errors = ?4
         WHERE execution_id = ?1",
        params![execution_id, phase.as_str(), phase.as_str(), errors_json],
    )
    .context("finishing execution record")?;
    Ok(())
}

pub fn get_execution(conn: &Connection, execution_id: &str) -> Result<Option<ExecutionRecord>> {
    conn.query_row(
        "SELECT execution_id, phase, started_at, completed_at, total_users,
                total_systems, total_tickers, total_trades, is_early_close,
                calendar_degraded, errors
         FROM trade_executions_v2 WHERE execution_id = ?1",
        params![execution_id],
        record_from_row,
    )
    .optional()
    .context("loading execution record")
}

pub fn history(conn: &Connection, limit: usize) -> Result<Vec<ExecutionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT execution_id, phase, started_at, completed_at, total_users,
                total_systems, total_tickers, total_trades, is_early_close,
                calendar_degraded, errors
         FROM trade_executions_v2
         ORDER BY started_at DESC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], record_from_row)?
        .collect::<Result<Vec<_>, _>>()
        .context("listing executions")?;
    Ok(rows)
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let phase: String = row.get(1)?;
    let started: i64 = row.get(2)?;
    let completed: Option<i64> = row.get(3)?;
    let errors_json: String = row.get(10)?;
    Ok(ExecutionRecord {
        execution_id: row.get(0)?,
        phase: ExecutionPhase::parse(&phase).unwrap_or(ExecutionPhase::Failed),
        started_at: ts(started),
        completed_at: completed.map(ts),
        totals: ExecutionTotals {
            users: row.get(4)?,
            systems: row.get(5)?,
            tickers: row.get(6)?,
            trades: row.get(7)?,
        },
        is_early_close: row.get(8)?,
        calendar_degraded: row.get(9)?,
        errors: serde_json::from_str(&errors_json).unwrap_or_default(),
    })
}

// ── Execution queue ─────────────────────────────────────────────────

pub fn insert_queue_rows(conn: &Connection, rows: &[QueueRow]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO execution_queue
             (execution_id, user_id, credential_type, queue_position, status)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for row in rows {
        stmt.execute(params![
            row.execution_id,
            row.user_id,
            row.credential_type.as_str(),
            row.position,
            row.status.as_str(),
        ])
        .context("inserting queue row")?;
    }
    Ok(())
}

pub fn queue_for_execution(conn: &Connection, execution_id: &str) -> Result<Vec<QueueRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, credential_type, queue_position, status, started_at, completed_at
         FROM execution_queue
         WHERE execution_id = ?1
         ORDER BY queue_position",
    )?;
    let rows = stmt
        .query_map(params![execution_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<i64>>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()
        .context("loading execution queue")?;

    Ok(rows
        .into_iter()
        .map(
            |(user_id, ct, position, status, started, completed)| QueueRow {
                execution_id: execution_id.to_string(),
                user_id,
                credential_type: CredentialType::parse(&ct).unwrap_or(CredentialType::Paper),
                position,
                status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Pending),
                started_at: started.map(ts),
                completed_at: completed.map(ts),
            },
        )
        .collect())
}

pub fn mark_queue_executing(
    conn: &Connection,
    execution_id: &str,
    account: &AccountKey,
) -> Result<()> {
    conn.execute(
        "UPDATE execution_queue
         SET status = 'executing', started_at = unixepoch()
         WHERE execution_id = ?1 AND user_id = ?2 AND credential_type = ?3",
        params![
            execution_id,
            account.user_id,
            account.credential_type.as_str()
        ],
    )
    .context("marking queue row executing")?;
    Ok(())
}

pub fn mark_queue_done(
    conn: &Connection,
    execution_id: &str,
    account: &AccountKey,
    status: QueueStatus,
) -> Result<()> {
    conn.execute(
        "UPDATE execution_queue
         SET status = ?4, completed_at = unixepoch()
         WHERE execution_id = ?1 AND user_id = ?2 AND credential_type = ?3",
        params![
            execution_id,
            account.user_id,
            account.credential_type.as_str(),
            status.as_str(),
        ],
    )
    .context("marking queue row done")?;
    Ok(())
}

// ── Per-user results ────────────────────────────────────────────────

pub fn insert_user_result(
    conn: &Connection,
    execution_id: &str,
    account: &AccountKey,
    position: i64,
    report: &UserRunReport,
    started_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO user_execution_results
             (execution_id, user_id, credential_type, queue_position, status,
              net_trades, orders_executed, attribution_results, pnl_results,
              errors, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, unixepoch())
         ON CONFLICT (execution_id, user_id, credential_type) DO UPDATE SET
             status = excluded.status,
             net_trades = excluded.net_trades,
             orders_executed = excluded.orders_executed,
             attribution_results = excluded.attribution_results,
             pnl_results = excluded.pnl_results,
             errors = excluded.errors,
             completed_at = excluded.completed_at",
        params![
            execution_id,
            account.user_id,
            account.credential_type.as_str(),
            position,
            report.status.as_str(),
            serde_json::to_string(&report.net_trades)?,
            serde_json::to_string(&report.orders)?,
            serde_json::to_string(&report.attribution)?,
            serde_json::to_string(&report.pnl)?,
            serde_json::to_string(&report.errors)?,
            started_at.timestamp(),
        ],
    )
    .context("inserting user execution result")?;
    Ok(())
}

/// Parsed result rows for one execution, in queue order.
pub fn results_for_execution(
    conn: &Connection,
    execution_id: &str,
) -> Result<Vec<(AccountKey, i64, UserRunReport)>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, credential_type, queue_position, status, net_trades,
                orders_executed, attribution_results, pnl_results, errors
         FROM user_execution_results
         WHERE execution_id = ?1
         ORDER BY queue_position",
    )?;

    let rows = stmt
        .query_map(params![execution_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()
        .context("loading user execution results")?;

    Ok(rows
        .into_iter()
        .map(
            |(user_id, ct, position, status, trades, orders, attribution, pnl, errors)| {
                let account = AccountKey::new(
                    user_id,
                    CredentialType::parse(&ct).unwrap_or(CredentialType::Paper),
                );
                let report = UserRunReport {
                    status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Failed),
                    net_trades: serde_json::from_str(&trades).unwrap_or_default(),
                    orders: serde_json::from_str(&orders).unwrap_or_default(),
                    attribution: serde_json::from_str(&attribution).unwrap_or_default(),
                    pnl: serde_json::from_str(&pnl).unwrap_or_default(),
                    errors: serde_json::from_str(&errors).unwrap_or_default(),
                };
                (account, position, report)
            },
        )
        .collect())
}

// ── Pending manual sells ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ManualSell {
    pub id: i64,
    pub symbol: String,
    pub qty: f64,
}

pub fn pending_manual_sells(conn: &Connection, account: &AccountKey) -> Result<Vec<ManualSell>> {
    let mut stmt = conn.prepare(
        "SELECT id, symbol, qty FROM pending_manual_sells
         WHERE user_id = ?1 AND credential_type = ?2 AND status = 'pending'
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map(
            params![account.user_id, account.credential_type.as_str()],
            |row| {
                Ok(ManualSell {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    qty: row.get(2)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()
        .context("loading pending manual sells")?;
    Ok(rows)
}

pub fn mark_manual_sell(
    conn: &Connection,
    id: i64,
    executed: bool,
    error_message: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE pending_manual_sells
         SET status = ?2, executed_at = unixepoch(), error_message = ?3
         WHERE id = ?1",
        params![
            id,
            if executed { "executed" } else { "failed" },
            error_message,
        ],
    )
    .context("updating manual sell")?;
    Ok(())
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
