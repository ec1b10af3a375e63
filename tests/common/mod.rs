use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use edgebot::broker::{Broker, BrokerError, PaperBroker, PositionView, RetryPolicy};
use edgebot::config::{AppConfig, TradeConfig};
use edgebot::execution::{BuilderConfig, MarketHours, OrderExecutor};
use edgebot::ingestion::{Pipeline, PipelineConfig, SignalParser};
use edgebot::ledger::{LedgerStore, LoadSource, PositionLedger};
use edgebot::models::{AlertMessage, BracketAck, BracketOrder, OpenOrder, OrderAck, SingleOrder, TradeStatus};
use edgebot::services::audit::AuditLog;

/// Config with every path inside `dir` and a paper broker.
#[allow(dead_code)]
pub fn test_config(dir: &Path, extra: &[(&str, &str)]) -> AppConfig {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("IBKR_ACCOUNT".into(), "DEMO".into()),
        ("LEDGER_PATH".into(), dir.join("bot_trades.json").display().to_string()),
        ("WATERMARK_PATH".into(), dir.join("last_processed.json").display().to_string()),
        ("AUDIT_LOG_PATH".into(), dir.join("audit.jsonl").display().to_string()),
        ("ALERT_SPOOL_DIR".into(), dir.join("inbox").display().to_string()),
    ]);
    for (k, v) in extra {
        vars.insert((*k).into(), (*v).into());
    }
    AppConfig::from_lookup(|key| vars.get(key).cloned()).expect("test config")
}

/// An alert whose event timestamp falls inside regular Toronto hours.
#[allow(dead_code)]
pub fn alert(action: &str, ticker: &str, qty: &str, price: &str, minute: u32) -> AlertMessage {
    AlertMessage {
        id: format!("{action}-{ticker}-{minute}"),
        subject: format!("Alert: Strategy {ticker} v3"),
        body: format!(
            "Signal order {action} @ {price} for {qty} filled on {ticker} at 2025-06-02T14:{minute:02}:00Z"
        ),
        received_at: received(minute),
    }
}

#[allow(dead_code)]
pub fn received(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 14, minute, 30).unwrap()
}

/// Drop an alert into the spool directory the way the mail bridge does.
#[allow(dead_code)]
pub fn spool(dir: &Path, msg: &AlertMessage) {
    std::fs::create_dir_all(dir).unwrap();
    let name = if msg.id.is_empty() {
        format!("{}.json", msg.received_at.timestamp_nanos_opt().unwrap_or_default())
    } else {
        format!("{}.json", msg.id)
    };
    std::fs::write(dir.join(name), serde_json::to_vec(msg).unwrap()).unwrap();
}

#[allow(dead_code)]
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_secs(1))
}

/// Pipeline over a persisted ledger at `dir/bot_trades.json`.
#[allow(dead_code)]
pub fn persisted_pipeline(
    dir: &Path,
    broker: Arc<dyn Broker>,
    audit: Arc<AuditLog>,
) -> (Pipeline, LoadSource) {
    let store = LedgerStore::new(dir.join("bot_trades.json"), 5);
    let (ledger, source) = PositionLedger::open(store).unwrap();
    let pipeline = Pipeline::new(
        SignalParser::default(),
        ledger,
        PositionView::new(broker.clone(), fast_retry()),
        OrderExecutor::new(broker, fast_retry()),
        TradeConfig::default(),
        audit,
        None,
        PipelineConfig {
            builder: BuilderConfig::new("DEMO", false),
            market_hours: MarketHours::default(),
            quantity_source: edgebot::config::QuantitySource::Alert,
            demo: true,
        },
    );
    (pipeline, source)
}

/// Paper broker that fails the first `failures` calls of every kind with `error`.
#[allow(dead_code)]
pub struct FlakyBroker {
    pub inner: PaperBroker,
    pub error: BrokerError,
    remaining: AtomicUsize,
    pub calls: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyBroker {
    pub fn new(inner: PaperBroker, failures: usize, error: BrokerError) -> Self {
        Self {
            inner,
            error,
            remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    fn trip(&self) -> Result<(), BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.remaining.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining.store(left - 1, Ordering::SeqCst);
            return Err(self.error.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn position(&self, ticker: &str) -> Result<Decimal, BrokerError> {
        self.trip()?;
        self.inner.position(ticker).await
    }

    async fn place_order(&self, order: &SingleOrder) -> Result<OrderAck, BrokerError> {
        self.trip()?;
        self.inner.place_order(order).await
    }

    async fn place_bracket_order(&self, order: &BracketOrder) -> Result<BracketAck, BrokerError> {
        self.trip()?;
        self.inner.place_bracket_order(order).await
    }

    async fn order_status(&self, order_id: &str) -> Result<TradeStatus, BrokerError> {
        self.inner.order_status(order_id).await
    }

    async fn open_orders(&self, ticker: &str) -> Result<Vec<OpenOrder>, BrokerError> {
        self.inner.open_orders(ticker).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.inner.cancel_order(order_id).await
    }
}
