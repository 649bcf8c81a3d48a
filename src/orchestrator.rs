use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use tracing::{error, info};
use uuid::Uuid;

use crate::broker::BrokerConnector;
use crate::evaluator::Evaluator;
use crate::marketdata::PriceProvider;
use crate::model::AccountKey;
use crate::model::execution::{
    ExecutionPhase, ExecutionRecord, ExecutionTotals, QueueRow, UserRunReport,
};
use crate::pipeline::{ExecutionMode, Pipeline, SETTLE_WAIT};
use crate::prices::{PriceAuthority, PriceAuthorityOptions};
use crate::store::{self, Db};
use crate::vault::Vault;
use crate::warmup;

/// Calendar context stamped onto the execution record.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalendarNote {
    pub is_early_close: bool,
    pub degraded: bool,
}

#[derive(Debug)]
pub struct ExecutionDetails {
    pub record: ExecutionRecord,
    pub queue: Vec<QueueRow>,
    pub results: Vec<(AccountKey, i64, UserRunReport)>,
}

#[derive(Default)]
struct OrchState {
    is_executing: bool,
    last_execution_date: Option<NaiveDate>,
}

/// Binds the trigger to one run: assigns the execution id, drives Phase 1
/// then Phase 2, and records the lifecycle. Also the single owner of the
/// `is_executing` / `last_execution_date` lock the scheduler consults.
pub struct Orchestrator {
    db: Db,
    vault: Arc<Vault>,
    evaluator: Arc<dyn Evaluator>,
    connector: Arc<dyn BrokerConnector>,
    price_provider: Arc<dyn PriceProvider>,
    price_opts: PriceAuthorityOptions,
    settle_wait: Duration,
    state: Mutex<OrchState>,
}

impl Orchestrator {
    pub fn new(
        db: Db,
        vault: Arc<Vault>,
        evaluator: Arc<dyn Evaluator>,
        connector: Arc<dyn BrokerConnector>,
        price_provider: Arc<dyn PriceProvider>,
    ) -> Self {
        Orchestrator {
            db,
            vault,
            evaluator,
            connector,
            price_provider,
            price_opts: PriceAuthorityOptions::default(),
            settle_wait: SETTLE_WAIT,
            state: Mutex::new(OrchState::default()),
        }
    }

    /// Shorten delays for tests.
    pub fn with_timing(mut self, price_opts: PriceAuthorityOptions, settle_wait: Duration) -> Self {
        self.price_opts = price_opts;
        self.settle_wait = settle_wait;
        self
    }

    pub fn is_executing(&self) -> bool {
        self.state.lock().expect("orchestrator lock").is_executing
    }

    pub fn has_executed_on(&self, date: NaiveDate) -> bool {
        self.state.lock().expect("orchestrator lock").last_execution_date == Some(date)
    }

    /// Scheduled entry point: runs once and stamps `last_execution_date` —
    /// success or failure — so the minute tick cannot re-fire the same
    /// trading day. A failed day is retried only via the manual trigger.
    pub async fn run_scheduled(
        &self,
        mode: ExecutionMode,
        date: NaiveDate,
        note: CalendarNote,
    ) -> Result<String> {
        self.begin()?;
        let result = self.execute(mode, None, note).await;
        self.end(Some(date));
        result
    }

    /// Manual entry point: clears the daily suppression and runs
    /// immediately. Rejected while another execution is in progress.
    pub async fn trigger_manual(
        &self,
        mode: ExecutionMode,
        override_account: Option<AccountKey>,
    ) -> Result<String> {
        {
            let mut state = self.state.lock().expect("orchestrator lock");
            if state.is_executing {
                bail!("an execution is already in progress");
            }
            state.is_executing = true;
            state.last_execution_date = None;
        }
        let result = self
            .execute(mode, override_account, CalendarNote::default())
            .await;
        self.end(None);
        result
    }

    fn begin(&self) -> Result<()> {
        let mut state = self.state.lock().expect("orchestrator lock");
        if state.is_executing {
            bail!("an execution is already in progress");
        }
        state.is_executing = true;
        Ok(())
    }

    fn end(&self, mark_date: Option<NaiveDate>) {
        let mut state = self.state.lock().expect("orchestrator lock");
        state.is_executing = false;
        if let Some(date) = mark_date {
            state.last_execution_date = Some(date);
        }
    }

    async fn execute(
        &self,
        mode: ExecutionMode,
        override_account: Option<AccountKey>,
        note: CalendarNote,
    ) -> Result<String> {
        let execution_id = Uuid::new_v4().to_string();
        info!(execution_id, mode = mode.as_str(), "execution starting");

        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            phase: ExecutionPhase::Warmup,
            started_at: chrono::Utc::now(),
            completed_at: None,
            totals: ExecutionTotals::default(),
            is_early_close: note.is_early_close,
            calendar_degraded: note.degraded,
            errors: Vec::new(),
        };

        {
            let conn = self.db.lock().await;
            store::executions::insert_execution(&conn, &record)?;
        }

        // Phase 1. A failure here (setup) is the only thing that fails the
        // execution outright.
        let warmup_output = {
            let conn = self.db.lock().await;
            match warmup::run(&conn, &execution_id, override_account) {
                Ok(output) => output,
                Err(e) => {
                    error!(execution_id, error = %format!("{e:#}"), "warmup failed");
                    store::executions::finish(
                        &conn,
                        &execution_id,
                        ExecutionPhase::Failed,
                        &[format!("warmup: {e:#}")],
                    )?;
                    return Err(e.context("warmup phase"));
                }
            }
        };

        let mut totals = ExecutionTotals {
            users: warmup_output.stats.accounts as u32,
            systems: warmup_output.stats.unique_systems as u32,
            tickers: warmup_output.stats.tickers as u32,
            trades: 0,
        };

        {
            let conn = self.db.lock().await;
            store::executions::set_phase(&conn, &execution_id, ExecutionPhase::Execution)?;
            store::executions::set_totals(&conn, &execution_id, &totals)?;
        }

        let pipeline = Pipeline {
            db: Arc::clone(&self.db),
            vault: Arc::clone(&self.vault),
            evaluator: Arc::clone(&self.evaluator),
            price_authority: PriceAuthority::new(
                Arc::clone(&self.price_provider),
                self.price_opts.clone(),
            ),
            connector: Arc::clone(&self.connector),
            settle_wait: self.settle_wait,
        };

        match pipeline.run(&execution_id, &warmup_output, mode).await {
            Ok(outcome) => {
                totals.trades = outcome.trades;
                let conn = self.db.lock().await;
                store::executions::set_totals(&conn, &execution_id, &totals)?;
                store::executions::finish(
                    &conn,
                    &execution_id,
                    ExecutionPhase::Completed,
                    &outcome.errors,
                )?;
                info!(execution_id, trades = totals.trades, "execution completed");
                Ok(execution_id)
            }
            Err(e) => {
                error!(execution_id, error = %format!("{e:#}"), "execution failed");
                let conn = self.db.lock().await;
                store::executions::finish(
                    &conn,
                    &execution_id,
                    ExecutionPhase::Failed,
                    &[format!("{e:#}")],
                )?;
                Err(e.context("execution phase"))
            }
        }
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.db.lock().await;
        store::executions::history(&conn, limit)
    }

    pub async fn details(&self, execution_id: &str) -> Result<Option<ExecutionDetails>> {
        let conn = self.db.lock().await;
        let Some(record) = store::executions::get_execution(&conn, execution_id)? else {
            return Ok(None);
        };
        let queue = store::executions::queue_for_execution(&conn, execution_id)
            .context("loading queue")?;
        let results = store::executions::results_for_execution(&conn, execution_id)
            .context("loading results")?;
        Ok(Some(ExecutionDetails {
            record,
            queue,
            results,
        }))
    }
}
