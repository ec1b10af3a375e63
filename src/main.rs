use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use tokio::sync::watch;

use edgebot::api::router::create_router;
use edgebot::broker::{Broker, IbkrClient, PaperBroker, PositionView, RetryPolicy};
use edgebot::config::{AppConfig, BrokerMode, QuantitySource, TradeConfig};
use edgebot::execution::{BuilderConfig, MarketHours, OrderExecutor};
use edgebot::ingestion::{Pipeline, PipelineConfig, SignalParser, SpoolDirSource, WatermarkStore};
use edgebot::ledger::{LedgerSnapshot, LedgerStore, PositionLedger};
use edgebot::services::audit::AuditLog;
use edgebot::services::notifier::{self, Notifier};
use edgebot::services::scheduler::{ControlFlags, Worker};
use edgebot::AppState;

const USAGE: &str = "usage: edgebot [serve | parse <subject> <body> | reconcile]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = AppConfig::from_env()?;

    match args.first().map(String::as_str) {
        None | Some("serve") => serve(config).await,
        Some("parse") => {
            let (Some(subject), Some(body)) = (args.get(1), args.get(2)) else {
                bail!(USAGE);
            };
            match SignalParser::new(config.body_param_order).parse(subject, body) {
                Ok(signal) => {
                    println!("{}", serde_json::to_string_pretty(&signal)?);
                    Ok(())
                }
                Err(e) => {
                    let report = serde_json::json!({ "error": e.to_string(), "code": e.code() });
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    std::process::exit(1);
                }
            }
        }
        Some("reconcile") => {
            let mut pipeline = build_pipeline(&config, Arc::new(AuditLog::new(&config.audit_log_path)))?;
            let report = pipeline.reconcile().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                std::process::exit(2);
            }
            Ok(())
        }
        Some(other) => bail!("unknown command {other}\n{USAGE}"),
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let metrics_handle = edgebot::metrics::init_metrics();
    let audit = Arc::new(AuditLog::new(&config.audit_log_path));

    tracing::info!(
        account = %config.account,
        broker = config.broker_mode.as_str(),
        trade_version = config.trade_version.as_str(),
        demo = config.is_demo(),
        "Starting edgebot"
    );

    let mut pipeline = build_pipeline(&config, audit.clone())?;

    // Startup reconciliation is report-only.
    let report = pipeline.reconcile().await;
    if report.is_clean() {
        tracing::info!(checked = report.checked.len(), "Startup reconciliation clean");
    } else {
        tracing::warn!(
            mismatches = report.mismatches.len(),
            errors = report.errors.len(),
            "Startup reconciliation found discrepancies"
        );
    }

    let (snapshot_tx, snapshot_rx) = watch::channel(LedgerSnapshot::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flags = ControlFlags::default();

    let worker = Worker::new(
        pipeline,
        Arc::new(SpoolDirSource::new(&config.spool_dir)),
        WatermarkStore::new(&config.watermark_path),
        snapshot_tx,
        flags.clone(),
        Duration::from_secs(config.poll_interval_secs.max(1)),
        config.reconcile_every_cycle,
    );
    let worker_handle = tokio::spawn(worker.run(shutdown_rx.clone()));

    let api_handle = if config.api_enabled {
        let addr = format!("{}:{}", config.host, config.port);
        let state = AppState {
            config: config.clone(),
            metrics_handle,
            ledger: snapshot_rx,
            audit,
            flags,
            started_at: Utc::now(),
        };
        let router = create_router(state);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Server listening on {addr}");

        let mut api_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    while !*api_shutdown.borrow_and_update() {
                        if api_shutdown.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "API server failed");
            }
        }))
    } else {
        tracing::info!("Operator API disabled (API_ENABLED=false)");
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received; finishing in-flight alert");
    shutdown_tx.send_replace(true);

    worker_handle.await?;
    if let Some(handle) = api_handle {
        handle.await?;
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

fn build_pipeline(config: &AppConfig, audit: Arc<AuditLog>) -> anyhow::Result<Pipeline> {
    let retry = RetryPolicy::new(
        config.broker_max_retries.max(1),
        Duration::from_millis(config.broker_retry_base_ms),
        Duration::from_secs(config.broker_timeout_secs),
    );
    let broker = build_broker(config)?;

    let notifier = match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat)) if config.has_telegram() => {
            Some(Notifier::new(token.clone(), chat.clone()))
        }
        _ => {
            tracing::info!("Telegram notifications disabled");
            None
        }
    };

    let store = LedgerStore::new(&config.ledger_path, config.ledger_backup_keep);
    let (ledger, source) = PositionLedger::open(store)
        .with_context(|| format!("opening ledger {}", config.ledger_path.display()))?;
    let ledger = ledger.with_tolerance(config.reconcile_tolerance);
    tracing::info!(?source, safe_mode = ledger.safe_mode(), "Ledger loaded");
    if let (Some(n), Some(msg)) = (&notifier, notifier::format_ledger_load(&source)) {
        n.spawn_send(msg);
    }

    let trade_config = match TradeConfig::load(&config.trade_config_path, &config.account) {
        Ok(tc) => {
            tracing::info!(rows = tc.len(), path = %config.trade_config_path.display(), "Trade config loaded");
            tc
        }
        Err(e) if config.quantity_source == QuantitySource::Config => return Err(e.into()),
        Err(e) => {
            tracing::warn!(error = %e, "Trade config unavailable; reconciling ledger tickers only");
            TradeConfig::default()
        }
    };

    let builder = BuilderConfig {
        missing_sl_tp: config.missing_sl_tp_policy,
        price_decimals: config.price_decimals,
        ..BuilderConfig::new(&config.account, config.trade_version.uses_brackets())
    };

    Ok(Pipeline::new(
        SignalParser::new(config.body_param_order),
        ledger,
        PositionView::new(broker.clone(), retry),
        OrderExecutor::new(broker, retry),
        trade_config,
        audit,
        notifier,
        PipelineConfig {
            builder,
            market_hours: MarketHours {
                tz: config.market_timezone,
                open: config.market_open,
                close: config.market_close,
            },
            quantity_source: config.quantity_source,
            demo: config.is_demo(),
        },
    ))
}

fn build_broker(config: &AppConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match config.broker_mode {
        BrokerMode::Paper => {
            tracing::warn!(account = %config.account, "Using paper broker; no real orders will be sent");
            Ok(Arc::new(PaperBroker::new(
                config.account.clone(),
                config.paper_positions.clone(),
            )))
        }
        BrokerMode::Ibkr => {
            let http = IbkrClient::http_client(
                config.ibkr_accept_invalid_certs,
                Duration::from_secs(config.broker_timeout_secs),
            )?;
            tracing::info!(base_url = %config.ibkr_base_url, "Using IBKR Client Portal gateway");
            Ok(Arc::new(IbkrClient::new(
                http,
                config.ibkr_base_url.clone(),
                config.account.clone(),
            )))
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
