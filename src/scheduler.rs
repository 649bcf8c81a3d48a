use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveTime, Timelike};
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::BrokerConnector;
use crate::config::MARKET_TZ;
use crate::model::settings::TradingSettings;
use crate::orchestrator::{CalendarNote, Orchestrator};
use crate::pipeline::ExecutionMode;
use crate::store::{self, Db};
use crate::vault::Vault;

const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Today's session times for the Eastern-time date, as cached by the
/// scheduler. `close: None` means the market is closed today.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketHours {
    pub date: NaiveDate,
    pub close: Option<NaiveTime>,
    pub is_early_close: bool,
    /// Set when the calendar fetch errored and 16:00 was assumed.
    pub degraded: bool,
}

fn regular_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).expect("valid time")
}

#[derive(Default)]
struct SchedState {
    cached: Option<MarketHours>,
    /// Eastern date of the last check-hour refresh; distinct from cache
    /// presence so an already-cached (possibly degraded) entry is still
    /// re-fetched once at the designated hour.
    refreshed_on: Option<NaiveDate>,
}

/// Market-calendar-aware trigger. A minute tick keeps the market-hours
/// cache warm and fires the orchestrator once per trading day at
/// `close − minutes_before_close`; the daily refresh at
/// `market_hours_check_hour` pre-warms the cache long before the close.
///
/// The tick is the single writer of the cached hours; re-firing is
/// suppressed by the orchestrator's `last_execution_date`.
pub struct Scheduler {
    db: Db,
    vault: Arc<Vault>,
    connector: Arc<dyn BrokerConnector>,
    orchestrator: Arc<Orchestrator>,
    mode: ExecutionMode,
    state: Mutex<SchedState>,
}

impl Scheduler {
    pub fn new(
        db: Db,
        vault: Arc<Vault>,
        connector: Arc<dyn BrokerConnector>,
        orchestrator: Arc<Orchestrator>,
        mode: ExecutionMode,
    ) -> Self {
        Scheduler {
            db,
            vault,
            connector,
            orchestrator,
            mode,
            state: Mutex::new(SchedState::default()),
        }
    }

    /// Minute-tick loop. Runs until the task is dropped.
    pub async fn run(&self) -> Result<()> {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("scheduler started");

        loop {
            interval.tick().await;
            let now = chrono::Utc::now().with_timezone(&MARKET_TZ);
            if let Err(e) = self.tick(now).await {
                warn!(error = %format!("{e:#}"), "scheduler tick failed");
            }
        }
    }

    /// One tick: refresh the cache if needed, then fire if the execution
    /// instant has arrived. Calendar failures only degrade today's close
    /// time; they never cancel future days.
    pub async fn tick(&self, now: DateTime<Tz>) -> Result<()> {
        let today = now.date_naive();

        let enabled_settings = self.enabled_settings().await?;
        if enabled_settings.is_empty() {
            return Ok(());
        }

        let check_hour = enabled_settings
            .first()
            .map(|s| s.market_hours_check_hour)
            .unwrap_or(4);

        let (needs_fetch, needs_refresh) = {
            let state = self.state.lock().await;
            let miss = state.cached.map(|h| h.date) != Some(today);
            let refresh = now.hour() == check_hour && state.refreshed_on != Some(today);
            (miss, refresh)
        };

        // Fetch on a cache miss, and once more at the daily check hour even
        // when today's entry already exists, so a degraded morning fetch is
        // corrected before the close.
        if needs_fetch || needs_refresh {
            if let Some(hours) = self.fetch_market_hours(today).await {
                let mut state = self.state.lock().await;
                // A degraded refetch never clobbers a good same-day entry.
                let downgrade = hours.degraded
                    && state.cached.is_some_and(|h| h.date == today && !h.degraded);
                if !downgrade {
                    state.cached = Some(hours);
                }
            }
            if needs_refresh {
                let mut state = self.state.lock().await;
                state.refreshed_on = Some(today);
            }
        }

        let hours = {
            let state = self.state.lock().await;
            match state.cached {
                Some(hours) if hours.date == today => hours,
                _ => return Ok(()),
            }
        };

        let Some(close) = hours.close else {
            // Holiday or weekend: nothing fires today.
            return Ok(());
        };

        // Divergent per-user lead times resolve to the minimum: never fire
        // later than any user asked for.
        let minutes_before = enabled_settings
            .iter()
            .map(|s| s.minutes_before_close)
            .min()
            .unwrap_or(10);

        let instant = close - chrono::Duration::minutes(minutes_before as i64);

        if now.time() < instant {
            return Ok(());
        }
        if self.orchestrator.has_executed_on(today) || self.orchestrator.is_executing() {
            return Ok(());
        }

        info!(
            date = %today,
            close = %close,
            early_close = hours.is_early_close,
            "execution instant reached, triggering"
        );

        let note = CalendarNote {
            is_early_close: hours.is_early_close,
            degraded: hours.degraded,
        };
        if let Err(e) = self.orchestrator.run_scheduled(self.mode, today, note).await {
            warn!(error = %format!("{e:#}"), "scheduled execution failed");
        }

        Ok(())
    }

    async fn enabled_settings(&self) -> Result<Vec<TradingSettings>> {
        let conn = self.db.lock().await;
        let mut out = Vec::new();
        for user_id in store::settings::enabled_users(&conn)? {
            if let Some(settings) = store::settings::load(&conn, &user_id)? {
                out.push(settings);
            }
        }
        Ok(out)
    }

    /// Today's session via the broker calendar, with any one account's paper
    /// credentials. Errors degrade to a regular 16:00 close rather than
    /// skipping the day.
    async fn fetch_market_hours(&self, date: NaiveDate) -> Option<MarketHours> {
        let creds = {
            let conn = self.db.lock().await;
            match store::credentials::any_paper(&conn) {
                Ok(creds) => creds,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "loading calendar credentials failed");
                    None
                }
            }
        }?;

        let broker = creds
            .decrypt(&self.vault)
            .ok()
            .and_then(|auth| self.connector.connect(&auth).ok())?;

        match broker.market_calendar(date, date).await {
            Ok(days) => {
                let today = days.iter().find(|d| d.date == date);
                match today {
                    Some(day) => {
                        let close = NaiveTime::parse_from_str(&day.close, "%H:%M").ok();
                        let is_early_close =
                            close.map(|c| c < regular_close()).unwrap_or(false);
                        debug!(date = %date, close = %day.close, "market hours cached");
                        Some(MarketHours {
                            date,
                            close: Some(close.unwrap_or_else(regular_close)),
                            is_early_close,
                            degraded: close.is_none(),
                        })
                    }
                    None => {
                        debug!(date = %date, "market closed today");
                        Some(MarketHours {
                            date,
                            close: None,
                            is_early_close: false,
                            degraded: false,
                        })
                    }
                }
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "calendar fetch failed, assuming 16:00 close");
                Some(MarketHours {
                    date,
                    close: Some(regular_close()),
                    is_early_close: false,
                    degraded: true,
                })
            }
        }
    }

    /// Seed the cache directly (tests).
    pub async fn set_market_hours(&self, hours: MarketHours) {
        let mut state = self.state.lock().await;
        state.cached = Some(hours);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_close_instant() {
        // close 13:00, lead 10 minutes → fires at 12:50
        let close = NaiveTime::from_hms_opt(13, 0, 0).unwrap();
        let instant = close - chrono::Duration::minutes(10);
        assert_eq!(instant, NaiveTime::from_hms_opt(12, 50, 0).unwrap());
        assert!(close < regular_close());
    }
}
