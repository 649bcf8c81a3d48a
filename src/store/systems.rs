use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::model::Allocation;
use crate::model::payload::PayloadNode;

/// Load and decode one system's strategy payload. `None` when the system id
/// is unknown.
pub fn load_payload(conn: &Connection, system_id: &str) -> Result<Option<PayloadNode>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT payload FROM bots WHERE id = ?1",
            params![system_id],
            |row| row.get(0),
        )
        .optional()
        .context("loading system payload")?;

    match blob {
        Some(blob) => Ok(Some(
            PayloadNode::from_blob(&blob)
                .with_context(|| format!("decoding payload for system {system_id}"))?,
        )),
        None => Ok(None),
    }
}

pub fn save_payload(conn: &Connection, system_id: &str, payload: &PayloadNode) -> Result<()> {
    conn.execute(
        "INSERT INTO bots (id, payload) VALUES (?1, ?2)
         ON CONFLICT (id) DO UPDATE SET payload = excluded.payload",
        params![system_id, payload.to_blob()],
    )
    .context("storing system payload")?;
    Ok(())
}

/// Refresh one dedup-cache row. `last_allocation` stays untouched when `None`
/// (warmup writes counts, the pipeline writes allocations).
pub fn upsert_dedup(
    conn: &Connection,
    system_id: &str,
    user_count: usize,
    last_allocation: Option<&Allocation>,
) -> Result<()> {
    match last_allocation {
        Some(alloc) => {
            let json = serde_json::to_string(alloc).context("encoding allocation")?;
            conn.execute(
                "INSERT INTO system_deduplication (system_id, user_count, last_allocation, last_updated)
                 VALUES (?1, ?2, ?3, unixepoch())
                 ON CONFLICT (system_id) DO UPDATE SET
                     user_count = excluded.user_count,
                     last_allocation = excluded.last_allocation,
                     last_updated = excluded.last_updated",
                params![system_id, user_count as i64, json],
            )
        }
        None => conn.execute(
            "INSERT INTO system_deduplication (system_id, user_count, last_updated)
             VALUES (?1, ?2, unixepoch())
             ON CONFLICT (system_id) DO UPDATE SET
                 user_count = excluded.user_count,
                 last_updated = excluded.last_updated",
            params![system_id, user_count as i64],
        ),
    }
    .context("upserting system_deduplication")?;
    Ok(())
}

pub fn dedup_user_count(conn: &Connection, system_id: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT user_count FROM system_deduplication WHERE system_id = ?1",
        params![system_id],
        |row| row.get(0),
    )
    .optional()
    .context("reading system_deduplication")
}
