mod mock_common;

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, TimeZone};

use trade_flow::broker::CalendarDay;
use trade_flow::config::MARKET_TZ;
use trade_flow::orchestrator::Orchestrator;
use trade_flow::pipeline::ExecutionMode;
use trade_flow::scheduler::{MarketHours, Scheduler};
use trade_flow::store;

use mock_common::*;

fn eastern(date: NaiveDate, h: u32, m: u32) -> chrono::DateTime<chrono_tz::Tz> {
    MARKET_TZ
        .from_local_datetime(&date.and_hms_opt(h, m, 0).unwrap())
        .single()
        .unwrap()
}

fn build(db: &store::Db) -> (Arc<Orchestrator>, Scheduler) {
    let vault = Arc::new(test_vault());
    let evaluator = MockEvaluator::new();
    let provider = MockProvider::new(&[]);
    let connector = MockConnector::new();

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(db),
        Arc::clone(&vault),
        evaluator,
        connector.clone(),
        provider,
    ));
    let scheduler = Scheduler::new(
        Arc::clone(db),
        vault,
        connector,
        Arc::clone(&orchestrator),
        ExecutionMode::Simulate,
    );
    (orchestrator, scheduler)
}

/// Early-close day: close 13:00 with a 10-minute lead fires at 12:50, not
/// 12:49, and only once.
#[tokio::test]
async fn early_close_fires_at_the_right_minute_once() {
    let db = store::open_in_memory().unwrap();
    seed_enabled_user(&db, "u1").await;

    let (orchestrator, scheduler) = build(&db);
    let date = NaiveDate::from_ymd_opt(2024, 7, 3).unwrap();
    scheduler
        .set_market_hours(MarketHours {
            date,
            close: Some(NaiveTime::from_hms_opt(13, 0, 0).unwrap()),
            is_early_close: true,
            degraded: false,
        })
        .await;

    scheduler.tick(eastern(date, 12, 49)).await.unwrap();
    assert!(orchestrator.history(10).await.unwrap().is_empty());

    scheduler.tick(eastern(date, 12, 50)).await.unwrap();
    let records = orchestrator.history(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_early_close);
    assert!(orchestrator.has_executed_on(date));

    // Subsequent ticks the same day are suppressed.
    scheduler.tick(eastern(date, 12, 51)).await.unwrap();
    scheduler.tick(eastern(date, 13, 0)).await.unwrap();
    assert_eq!(orchestrator.history(10).await.unwrap().len(), 1);
}

/// A closed market day never fires.
#[tokio::test]
async fn closed_day_never_fires() {
    let db = store::open_in_memory().unwrap();
    seed_enabled_user(&db, "u1").await;

    let (orchestrator, scheduler) = build(&db);
    let date = NaiveDate::from_ymd_opt(2024, 7, 4).unwrap();
    scheduler
        .set_market_hours(MarketHours {
            date,
            close: None,
            is_early_close: false,
            degraded: false,
        })
        .await;

    for minute in [9, 30, 50] {
        scheduler.tick(eastern(date, 15, minute)).await.unwrap();
    }
    assert!(orchestrator.history(10).await.unwrap().is_empty());
}

/// No enabled users: the tick is a no-op.
#[tokio::test]
async fn no_enabled_users_is_a_noop() {
    let db = store::open_in_memory().unwrap();
    let (orchestrator, scheduler) = build(&db);
    let date = NaiveDate::from_ymd_opt(2024, 7, 5).unwrap();

    scheduler.tick(eastern(date, 15, 50)).await.unwrap();
    assert!(orchestrator.history(10).await.unwrap().is_empty());
}

/// The daily check-hour refetch corrects a degraded cache entry even though
/// today's hours are already cached, and runs only once per day.
#[tokio::test]
async fn check_hour_refetch_corrects_degraded_hours() {
    let db = store::open_in_memory().unwrap();
    let vault = Arc::new(test_vault());

    seed_enabled_user(&db, "u1").await;
    seed_credentials(&db, &vault, &paper("u1"), "mock://cal").await;

    let date = NaiveDate::from_ymd_opt(2024, 11, 29).unwrap();

    let broker = MockBroker::new(0.0, 0.0);
    broker.state.lock().unwrap().calendar = vec![CalendarDay {
        date,
        open: "09:30".to_string(),
        close: "13:00".to_string(),
    }];
    let connector = MockConnector::new();
    connector.register("mock://cal", Arc::clone(&broker));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        Arc::clone(&vault),
        MockEvaluator::new(),
        connector.clone(),
        MockProvider::new(&[]),
    ));
    let scheduler = Scheduler::new(
        Arc::clone(&db),
        vault,
        connector,
        Arc::clone(&orchestrator),
        ExecutionMode::Simulate,
    );

    // A failed early fetch left the degraded 16:00 assumption in the cache.
    scheduler
        .set_market_hours(MarketHours {
            date,
            close: Some(NaiveTime::from_hms_opt(16, 0, 0).unwrap()),
            is_early_close: false,
            degraded: true,
        })
        .await;

    // Check hour (default 04): today's entry exists, yet the refetch still
    // runs and picks up the real 13:00 early close. The second tick in the
    // same hour must not fetch again.
    scheduler.tick(eastern(date, 4, 2)).await.unwrap();
    scheduler.tick(eastern(date, 4, 3)).await.unwrap();
    assert_eq!(broker.state.lock().unwrap().calendar_calls, 1);

    // Under the degraded 16:00 close the trigger would wait until 15:50;
    // the corrected calendar fires at 12:50.
    scheduler.tick(eastern(date, 12, 50)).await.unwrap();
    let records = orchestrator.history(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_early_close);
}

/// Divergent lead times resolve to the minimum across enabled users.
#[tokio::test]
async fn divergent_lead_times_take_the_minimum() {
    let db = store::open_in_memory().unwrap();

    let mut early = trade_flow::model::settings::TradingSettings::default();
    early.enabled = true;
    early.minutes_before_close = 30;
    seed_settings(&db, "careful", &early).await;

    let mut late = trade_flow::model::settings::TradingSettings::default();
    late.enabled = true;
    late.minutes_before_close = 5;
    seed_settings(&db, "bold", &late).await;

    let (orchestrator, scheduler) = build(&db);
    let date = NaiveDate::from_ymd_opt(2024, 7, 8).unwrap();
    scheduler
        .set_market_hours(MarketHours {
            date,
            close: Some(NaiveTime::from_hms_opt(16, 0, 0).unwrap()),
            is_early_close: false,
            degraded: false,
        })
        .await;

    // min(30, 5) = 5 → fires at 15:55, not 15:30.
    scheduler.tick(eastern(date, 15, 30)).await.unwrap();
    assert!(orchestrator.history(10).await.unwrap().is_empty());

    scheduler.tick(eastern(date, 15, 55)).await.unwrap();
    assert_eq!(orchestrator.history(10).await.unwrap().len(), 1);
}
