use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::model::bucket::Bucket;
use crate::model::execution::{QueueRow, QueueStatus};
use crate::model::payload::PayloadNode;
use crate::model::settings::CredentialType;
use crate::model::{AccountKey, Ticker};
use crate::store;

/// One system after cross-user deduplication: the shared payload plus every
/// account that invests in it. The unallocated sentinel rides along so
/// ledger-only accounts still enter the queue.
#[derive(Debug, Clone)]
pub struct UniqueSystem {
    pub bucket: Bucket,
    pub payload: Option<PayloadNode>,
    pub accounts: Vec<AccountKey>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WarmupStats {
    pub accounts: usize,
    pub unique_systems: usize,
    pub tickers: usize,
}

#[derive(Debug)]
pub struct WarmupOutput {
    pub systems: Vec<UniqueSystem>,
    pub tickers: Vec<Ticker>,
    pub queue: Vec<QueueRow>,
    pub stats: WarmupStats,
}

/// Phase 1: enumerate eligible accounts, collect and deduplicate their
/// systems, extract the ticker union, and persist a randomized queue.
pub fn run(
    conn: &Connection,
    execution_id: &str,
    override_account: Option<AccountKey>,
) -> Result<WarmupOutput> {
    let accounts = match override_account {
        Some(account) => vec![account],
        None => eligible_accounts(conn)?,
    };

    // Collect per-account systems, deduplicating by bucket as we go. Vec
    // keeps first-seen order so the evaluation pass is deterministic.
    let mut systems: Vec<UniqueSystem> = Vec::new();

    for account in &accounts {
        for inv in store::investments::for_account(conn, account)? {
            let bucket = Bucket::System(inv.system_id.clone());
            match systems.iter_mut().find(|s| s.bucket == bucket) {
                Some(existing) => existing.accounts.push(account.clone()),
                None => {
                    let payload = store::systems::load_payload(conn, &inv.system_id)
                        .with_context(|| format!("loading payload for {}", inv.system_id))?;
                    if payload.is_none() {
                        debug!(system_id = %inv.system_id, "investment references unknown system");
                    }
                    systems.push(UniqueSystem {
                        bucket,
                        payload,
                        accounts: vec![account.clone()],
                    });
                }
            }
        }

        if store::ledger::has_unallocated(conn, account)? {
            match systems
                .iter_mut()
                .find(|s| s.bucket == Bucket::Unallocated)
            {
                Some(existing) => existing.accounts.push(account.clone()),
                None => systems.push(UniqueSystem {
                    bucket: Bucket::Unallocated,
                    payload: None,
                    accounts: vec![account.clone()],
                }),
            }
        }
    }

    // Union of every ticker any real system can hold.
    let mut ticker_set = std::collections::BTreeSet::new();
    for system in &systems {
        if system.bucket.is_unallocated() {
            continue;
        }
        if let Some(payload) = &system.payload {
            ticker_set.extend(payload.tickers());
        }
    }
    let tickers: Vec<Ticker> = ticker_set.into_iter().collect();

    // Unbiased Fisher–Yates over the account order, seeded from the
    // cryptographic thread RNG.
    let mut shuffled = accounts.clone();
    shuffled.shuffle(&mut rand::rng());

    let queue: Vec<QueueRow> = shuffled
        .iter()
        .enumerate()
        .map(|(i, account)| QueueRow {
            execution_id: execution_id.to_string(),
            user_id: account.user_id.clone(),
            credential_type: account.credential_type,
            position: i as i64,
            status: QueueStatus::Pending,
            started_at: None,
            completed_at: None,
        })
        .collect();

    store::executions::insert_queue_rows(conn, &queue)?;

    for system in &systems {
        if let Some(system_id) = system.bucket.system_id() {
            store::systems::upsert_dedup(conn, system_id, system.accounts.len(), None)?;
        }
    }

    let stats = WarmupStats {
        accounts: accounts.len(),
        unique_systems: systems.len(),
        tickers: tickers.len(),
    };

    info!(
        execution_id,
        accounts = stats.accounts,
        unique_systems = stats.unique_systems,
        tickers = stats.tickers,
        "warmup complete"
    );

    Ok(WarmupOutput {
        systems,
        tickers,
        queue,
        stats,
    })
}

/// Accounts that will execute: enabled users, per credential scope, with
/// credentials on file and something to manage (an investment or a ledgered
/// position).
fn eligible_accounts(conn: &Connection) -> Result<Vec<AccountKey>> {
    let mut accounts = Vec::new();

    for user_id in store::settings::enabled_users(conn)? {
        for credential_type in CredentialType::ALL {
            let account = AccountKey::new(user_id.clone(), credential_type);

            if !store::credentials::exists(conn, &account)? {
                continue;
            }

            let has_investment = store::investments::has_any(conn, &account)?;
            let has_positions = store::ledger::has_any_positions(conn, &account)?;
            if has_investment || has_positions {
                accounts.push(account);
            }
        }
    }

    Ok(accounts)
}
