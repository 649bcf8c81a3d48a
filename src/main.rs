use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trade_flow::broker::rest::RestConnector;
use trade_flow::cli::{Cli, Command};
use trade_flow::config::{AppConfig, MARKET_TZ};
use trade_flow::evaluator::{EvaluateOptions, HttpEvaluator};
use trade_flow::marketdata::MarketDataClient;
use trade_flow::model::AccountKey;
use trade_flow::model::settings::CredentialType;
use trade_flow::orchestrator::Orchestrator;
use trade_flow::pipeline::ExecutionMode;
use trade_flow::scheduler::Scheduler;
use trade_flow::vault::Vault;
use trade_flow::{allocation, report, store, target};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    rt.block_on(dispatch(cli))
}

struct App {
    db: store::Db,
    vault: Arc<Vault>,
    connector: Arc<RestConnector>,
    orchestrator: Arc<Orchestrator>,
}

fn build_app() -> Result<App> {
    let config = AppConfig::from_env()?;
    let db = store::open(&config.database_path)?;
    let vault = Arc::new(Vault::new(&config.encryption_secret)?);
    let connector = Arc::new(RestConnector::new());
    let evaluator = Arc::new(HttpEvaluator::new(config.evaluator_url.clone()));
    let provider = Arc::new(MarketDataClient::new(
        config.marketdata_api_key.clone(),
        config.marketdata_base_url.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        Arc::clone(&vault),
        evaluator,
        connector.clone(),
        provider,
    ));

    Ok(App {
        db,
        vault,
        connector,
        orchestrator,
    })
}

fn parse_mode(s: &str) -> Result<ExecutionMode> {
    ExecutionMode::parse(s)
        .with_context(|| format!("unknown mode '{s}' (simulate, execute-paper, execute-live)"))
}

fn parse_credential_type(s: &str) -> Result<CredentialType> {
    CredentialType::parse(s).with_context(|| format!("unknown credential type '{s}'"))
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run { mode } => {
            let mode = parse_mode(&mode)?;
            let app = build_app()?;
            let scheduler = Scheduler::new(
                Arc::clone(&app.db),
                Arc::clone(&app.vault),
                app.connector.clone(),
                Arc::clone(&app.orchestrator),
                mode,
            );

            info!(mode = mode.as_str(), "trade-flow daemon starting");
            tokio::select! {
                result = scheduler.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    Ok(())
                }
            }
        }

        Command::Execute {
            user,
            credential_type,
            mode,
        } => {
            let mode = parse_mode(&mode)?;
            let credential_type = parse_credential_type(&credential_type)?;
            let app = build_app()?;

            let override_account = user.map(|u| AccountKey::new(u, credential_type));
            let execution_id = app
                .orchestrator
                .trigger_manual(mode, override_account)
                .await?;
            println!("Execution {execution_id} completed.");
            Ok(())
        }

        Command::History { limit } => {
            let app = build_app()?;
            let records = app.orchestrator.history(limit).await?;
            if records.is_empty() {
                println!("No executions recorded.");
                return Ok(());
            }
            println!(
                "{:<38} {:<10} {:>6} {:>8} {:>8} {:>7}  started",
                "execution", "phase", "users", "systems", "tickers", "trades"
            );
            for r in records {
                println!(
                    "{:<38} {:<10} {:>6} {:>8} {:>8} {:>7}  {}",
                    r.execution_id,
                    r.phase.as_str(),
                    r.totals.users,
                    r.totals.systems,
                    r.totals.tickers,
                    r.totals.trades,
                    r.started_at.with_timezone(&MARKET_TZ).format("%Y-%m-%d %H:%M"),
                );
            }
            Ok(())
        }

        Command::Show { execution_id } => {
            let app = build_app()?;
            let Some(details) = app.orchestrator.details(&execution_id).await? else {
                bail!("no execution with id {execution_id}");
            };

            let r = &details.record;
            println!("Execution {}", r.execution_id);
            println!("  phase:       {}", r.phase.as_str());
            println!(
                "  started:     {}",
                r.started_at.with_timezone(&MARKET_TZ).format("%Y-%m-%d %H:%M:%S")
            );
            if let Some(done) = r.completed_at {
                println!(
                    "  completed:   {}",
                    done.with_timezone(&MARKET_TZ).format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!(
                "  totals:      {} users, {} systems, {} tickers, {} trades",
                r.totals.users, r.totals.systems, r.totals.tickers, r.totals.trades
            );
            if r.is_early_close {
                println!("  early close: yes");
            }
            if r.calendar_degraded {
                println!("  calendar:    degraded (assumed 16:00)");
            }
            for error in &r.errors {
                println!("  error: {error}");
            }

            println!("\nQueue:");
            for q in &details.queue {
                println!(
                    "  #{:<3} {:<28} {}",
                    q.position,
                    format!("{}/{}", q.user_id, q.credential_type),
                    q.status.as_str()
                );
            }

            for (account, position, report) in &details.results {
                println!("\n#{position} {account} — {}", report.status.as_str());
                for (ticker, delta) in &report.net_trades {
                    println!("  trade  {ticker:<8} {delta:>12.4}");
                }
                for order in &report.orders {
                    println!(
                        "  order  {:<8} {:<4} {:<9} {}",
                        order.symbol,
                        format!("{:?}", order.side).to_lowercase(),
                        format!("{:?}", order.status).to_lowercase(),
                        order.reason.as_deref().unwrap_or(""),
                    );
                }
                for pnl in &report.pnl {
                    println!(
                        "  pnl    {:<20} mv {:>12.2}  basis {:>12.2}  unrealized {:>10.2} ({:+.2}%)",
                        pnl.system_id,
                        pnl.market_value,
                        pnl.cost_basis,
                        pnl.unrealized,
                        pnl.unrealized_pct * 100.0
                    );
                }
                for error in &report.errors {
                    println!("  error: {error}");
                }
            }
            Ok(())
        }

        Command::ExportAllocations {
            user,
            credential_type,
            output,
        } => {
            let credential_type = parse_credential_type(&credential_type)?;
            let config = AppConfig::from_env()?;
            let db = store::open(&config.database_path)?;
            let vault = Vault::new(&config.encryption_secret)?;
            let connector = RestConnector::new();
            let evaluator = HttpEvaluator::new(config.evaluator_url.clone());

            let account = AccountKey::new(user, credential_type);
            let (settings, investments, credentials) = {
                let conn = db.lock().await;
                let settings = store::settings::load(&conn, &account.user_id)?
                    .context("user has no trading settings")?;
                let investments = store::investments::for_account(&conn, &account)?;
                let credentials = store::credentials::get(&conn, &account)?;
                (settings, investments, credentials)
            };
            if investments.is_empty() {
                bail!("account {account} has no investments");
            }

            // Percent-mode investments need equity to resolve; without
            // credentials only dollar amounts enter the weighting.
            let equity = match credentials {
                Some(row) => {
                    use trade_flow::broker::BrokerConnector;
                    let auth = row.decrypt(&vault)?;
                    let broker = connector.connect(&auth)?;
                    broker.account().await.map(|a| a.equity).unwrap_or(0.0)
                }
                None => 0.0,
            };

            let weights = target::system_weights(&investments, equity);
            if weights.is_empty() {
                bail!("account {account} has no positive investment weights");
            }

            // Single-account path: the benchmark is this user's own
            // fallback ticker.
            let mut opts = EvaluateOptions::default();
            let benchmark = settings.fallback_ticker.trim().to_uppercase();
            if !benchmark.is_empty() {
                opts.benchmark_ticker = benchmark;
            }
            let mut allocations = std::collections::HashMap::new();
            for weight in &weights {
                let payload = {
                    let conn = db.lock().await;
                    store::systems::load_payload(&conn, &weight.system_id)?
                };
                let result = allocation::allocations_for(
                    &evaluator,
                    &weight.system_id,
                    payload.as_ref(),
                    &opts,
                )
                .await;
                let allocation = result.unwrap_or_else(|| {
                    trade_flow::model::Allocation::from([(
                        settings.fallback_ticker.to_uppercase(),
                        100.0,
                    )])
                });
                allocations.insert(weight.system_id.clone(), allocation);
            }

            let merged = target::merge_allocations(&weights, &allocations);
            let merged = target::apply_paired_netting(merged, &settings.paired_tickers);
            let merged = target::apply_safety_cap(merged, settings.max_allocation_percent);

            let today = chrono::Utc::now().with_timezone(&MARKET_TZ).date_naive();
            let csv = report::format_allocation_csv(today, &merged);

            match output {
                Some(path) => {
                    std::fs::write(&path, csv)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Wrote {}", path.display());
                }
                None => print!("{csv}"),
            }
            Ok(())
        }
    }
}
