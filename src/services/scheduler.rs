use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::ingestion::{MessageSource, Outcome, Pipeline, Watermark, WatermarkStore};
use crate::ledger::LedgerSnapshot;

/// Counts for one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub fetched: usize,
    pub placed: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub failed: usize,
    pub fills_updated: usize,
    pub mismatches: usize,
}

impl CycleStats {
    fn count(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Placed { .. } => self.placed += 1,
            Outcome::Blocked { .. } => self.blocked += 1,
            Outcome::Skipped { .. } => self.skipped += 1,
            Outcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Flags shared with the operator API.
#[derive(Debug, Clone, Default)]
pub struct ControlFlags {
    pub paused: Arc<AtomicBool>,
    pub clear_safe_mode: Arc<AtomicBool>,
}

/// Single consumer of alerts. Messages are handled strictly one at a time so
/// the ledger and broker view never see interleaved decisions.
pub struct Worker {
    pipeline: Pipeline,
    source: Arc<dyn MessageSource>,
    watermark: WatermarkStore,
    mark: Watermark,
    snapshot_tx: watch::Sender<LedgerSnapshot>,
    flags: ControlFlags,
    poll_interval: Duration,
    reconcile_every_cycle: bool,
}

impl Worker {
    pub fn new(
        pipeline: Pipeline,
        source: Arc<dyn MessageSource>,
        watermark: WatermarkStore,
        snapshot_tx: watch::Sender<LedgerSnapshot>,
        flags: ControlFlags,
        poll_interval: Duration,
        reconcile_every_cycle: bool,
    ) -> Self {
        let mark = watermark.load();
        snapshot_tx.send_replace(pipeline.ledger().snapshot());
        Self {
            pipeline,
            source,
            watermark,
            mark,
            snapshot_tx,
            flags,
            poll_interval,
            reconcile_every_cycle,
        }
    }

    pub fn last_processed(&self) -> DateTime<Utc> {
        self.mark.last_processed
    }

    pub fn watermark(&self) -> &Watermark {
        &self.mark
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// One fetch → process → persist pass.
    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) -> CycleStats {
        let mut stats = CycleStats::default();

        if self.flags.clear_safe_mode.swap(false, Ordering::SeqCst) {
            match self.pipeline.clear_safe_mode() {
                Ok(()) => tracing::warn!("Operator cleared ledger safe mode"),
                Err(e) => tracing::error!(error = %e, "Failed to persist safe-mode clear, staying in safe mode"),
            }
        }

        self.pipeline.start_cycle();
        stats.fills_updated = self.pipeline.poll_fills().await;

        let messages: Vec<_> = match self.source.fetch_since(self.mark.last_processed).await {
            Ok(m) => m.into_iter().filter(|msg| self.mark.admits(msg)).collect(),
            Err(e) => {
                tracing::error!(error = %e, "Message fetch failed; retrying next cycle");
                self.publish();
                return stats;
            }
        };
        stats.fetched = messages.len();
        if !messages.is_empty() {
            tracing::info!(count = messages.len(), since = %self.mark.last_processed, "Fetched alerts");
        }

        for msg in &messages {
            if *shutdown.borrow() {
                tracing::info!("Shutdown requested; stopping mid-batch");
                break;
            }
            let outcome = self.pipeline.process_message(msg).await;
            tracing::debug!(?outcome, id = %msg.id, received_at = %msg.received_at, "Alert handled");
            stats.count(&outcome);

            self.mark.advance(msg);
            if let Err(e) = self.watermark.save(&self.mark) {
                tracing::error!(error = %e, "Failed to persist watermark");
            }
        }

        if self.reconcile_every_cycle {
            stats.mismatches = self.pipeline.reconcile().await.mismatches.len();
        }

        self.publish();
        stats
    }

    /// Poll until `shutdown` flips to true. An in-flight message always finishes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.poll_interval.as_secs(),
            since = %self.mark.last_processed,
            "Alert worker started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            if self.flags.paused.load(Ordering::SeqCst) {
                tracing::debug!("Worker paused; skipping cycle");
                continue;
            }

            let stats = self.run_cycle(&shutdown).await;
            if stats.fetched > 0 || stats.fills_updated > 0 {
                tracing::info!(
                    fetched = stats.fetched,
                    placed = stats.placed,
                    blocked = stats.blocked,
                    skipped = stats.skipped,
                    failed = stats.failed,
                    fills_updated = stats.fills_updated,
                    "Cycle complete"
                );
            }
        }

        tracing::info!(last_processed = %self.mark.last_processed, "Alert worker stopped");
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.pipeline.ledger().snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerError, PaperBroker, PositionView, RetryPolicy};
    use crate::config::{QuantitySource, TradeConfig};
    use crate::execution::{BuilderConfig, MarketHours, OrderExecutor};
    use crate::ingestion::{PipelineConfig, SignalParser};
    use crate::ledger::PositionLedger;
    use crate::models::{
        AlertMessage, BracketAck, BracketOrder, OpenOrder, OrderAck, SingleOrder, TradeStatus,
    };
    use crate::services::audit::AuditLog;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct VecSource(Mutex<Vec<AlertMessage>>);

    #[async_trait]
    impl MessageSource for VecSource {
        async fn fetch_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<AlertMessage>> {
            let msgs = self.0.lock().unwrap_or_else(|e| e.into_inner());
            Ok(msgs.iter().filter(|m| m.received_at >= since).cloned().collect())
        }
    }

    fn alert(action: &str, qty: &str, minute: u32) -> AlertMessage {
        AlertMessage {
            id: format!("{action}-{qty}-{minute}"),
            subject: "Alert: AAPL".into(),
            body: format!("order {action} @ 190 for {qty} filled on AAPL at 2025-06-02T14:{minute:02}:00Z"),
            received_at: Utc.with_ymd_and_hms(2025, 6, 2, 14, minute, 5).unwrap(),
        }
    }

    /// Flips the shutdown signal once the first order reaches the broker.
    struct StopAfterFirstOrder {
        inner: PaperBroker,
        stop: watch::Sender<bool>,
    }

    #[async_trait]
    impl Broker for StopAfterFirstOrder {
        fn name(&self) -> &'static str {
            "stop-after-first"
        }

        async fn position(&self, ticker: &str) -> Result<Decimal, BrokerError> {
            self.inner.position(ticker).await
        }

        async fn place_order(&self, order: &SingleOrder) -> Result<OrderAck, BrokerError> {
            self.stop.send_replace(true);
            self.inner.place_order(order).await
        }

        async fn place_bracket_order(&self, order: &BracketOrder) -> Result<BracketAck, BrokerError> {
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

    fn worker(
        dir: &std::path::Path,
        msgs: Vec<AlertMessage>,
    ) -> (Worker, watch::Receiver<LedgerSnapshot>, ControlFlags) {
        worker_with(dir, msgs, Arc::new(PaperBroker::new("DEMO", Vec::new())))
    }

    fn worker_with(
        dir: &std::path::Path,
        msgs: Vec<AlertMessage>,
        paper: Arc<dyn Broker>,
    ) -> (Worker, watch::Receiver<LedgerSnapshot>, ControlFlags) {
        let retry = RetryPolicy::new(1, Duration::from_millis(1), Duration::from_secs(1));
        let pipeline = Pipeline::new(
            SignalParser::default(),
            PositionLedger::in_memory(),
            PositionView::new(paper.clone(), retry),
            OrderExecutor::new(paper, retry),
            TradeConfig::default(),
            Arc::new(AuditLog::in_memory()),
            None,
            PipelineConfig {
                builder: BuilderConfig::new("DEMO", false),
                market_hours: MarketHours::default(),
                quantity_source: QuantitySource::Alert,
                demo: true,
            },
        );
        let (tx, rx) = watch::channel(LedgerSnapshot::default());
        let flags = ControlFlags::default();
        let worker = Worker::new(
            pipeline,
            Arc::new(VecSource(Mutex::new(msgs))),
            WatermarkStore::new(dir.join("watermark.json")),
            tx,
            flags.clone(),
            Duration::from_millis(10),
            false,
        );
        (worker, rx, flags)
    }

    #[tokio::test]
    async fn test_cycle_processes_in_order_and_advances_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let msgs = vec![alert("buy", "5", 1), alert("sell", "2", 2)];
        let (mut w, rx, _) = worker(dir.path(), msgs);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let stats = w.run_cycle(&stop_rx).await;
        assert_eq!(stats.fetched, 2);
        assert_eq!(stats.placed, 2);
        assert_eq!(w.pipeline().ledger().open_quantity("AAPL"), dec!(3));
        assert_eq!(rx.borrow().total_trades, 2);

        let saved = WatermarkStore::new(dir.path().join("watermark.json")).load();
        assert_eq!(saved.last_processed, Utc.with_ymd_and_hms(2025, 6, 2, 14, 2, 5).unwrap());
        assert_eq!(saved.seen_at_mark, vec!["sell-2-2"]);

        // Nothing newer than the watermark: no reprocessing.
        let again = w.run_cycle(&stop_rx).await;
        assert_eq!(again.fetched, 0);
        assert_eq!(w.pipeline().ledger().open_quantity("AAPL"), dec!(3));
    }

    #[tokio::test]
    async fn test_stop_between_same_instant_alerts_resumes_with_second() {
        let dir = tempfile::tempdir().unwrap();
        let first = alert("buy", "5", 1);
        let mut second = alert("buy", "2", 1);
        second.received_at = first.received_at;
        let msgs = vec![first, second];

        let (stop_tx, stop_rx) = watch::channel(false);
        let stopper = Arc::new(StopAfterFirstOrder {
            inner: PaperBroker::new("DEMO", Vec::new()),
            stop: stop_tx,
        });
        let (mut w, _rx, _) = worker_with(dir.path(), msgs.clone(), stopper);
        let stats = w.run_cycle(&stop_rx).await;
        assert_eq!(stats.fetched, 2);
        assert_eq!(stats.placed, 1);
        assert_eq!(w.watermark().seen_at_mark, vec!["buy-5-1"]);

        // Restart: only the unhandled alert at the same instant comes back.
        let (mut restarted, _rx, _) = worker(dir.path(), msgs);
        let (_keep, running) = watch::channel(false);
        let stats = restarted.run_cycle(&running).await;
        assert_eq!(stats.fetched, 1);
        assert_eq!(stats.placed, 1);
        assert_eq!(restarted.pipeline().ledger().open_quantity("AAPL"), dec!(2));

        let again = restarted.run_cycle(&running).await;
        assert_eq!(again.fetched, 0);
    }

    #[tokio::test]
    async fn test_clear_safe_mode_flag_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut w, _rx, flags) = worker(dir.path(), Vec::new());
        flags.clear_safe_mode.store(true, Ordering::SeqCst);
        let (_stop_tx, stop_rx) = watch::channel(false);

        w.run_cycle(&stop_rx).await;
        assert!(!flags.clear_safe_mode.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (w, _rx, _) = worker(dir.path(), vec![alert("buy", "1", 1)]);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(w.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
