use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use rust_decimal::Decimal;

use crate::broker::PositionView;
use crate::config::{QuantitySource, TradeConfig};
use crate::execution::{
    authorize, build, reconcile_all, BuilderConfig, DecisionReason, MarketHours, OrderExecutor,
    ReconcileReport,
};
use crate::ledger::{LedgerError, PositionLedger};
use crate::models::{AlertMessage, BotTrade, Side, TradeSignal};
use crate::services::audit::{AuditEvent, AuditLog};
use crate::services::notifier::{self, Notifier};

use super::parser::SignalParser;

/// Per-message knobs assembled once from the app config.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub builder: BuilderConfig,
    pub market_hours: MarketHours,
    pub quantity_source: QuantitySource,
    /// Paper broker in use; tags notifications.
    pub demo: bool,
}

/// What happened to one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Placed {
        order_id: String,
        ticker: String,
        side: Side,
        quantity: Decimal,
    },
    Blocked {
        reason: DecisionReason,
    },
    /// Deliberately not traded (`not_configured`, `sell_pending`).
    Skipped {
        reason: &'static str,
    },
    Failed {
        reason: String,
    },
}

/// Process one alert at a time: parse → validate → build → submit → ledger.
///
/// Owns the ledger; nothing else mutates it.
pub struct Pipeline {
    parser: SignalParser,
    ledger: PositionLedger,
    view: PositionView,
    executor: OrderExecutor,
    trade_config: TradeConfig,
    audit: Arc<AuditLog>,
    notifier: Option<Notifier>,
    config: PipelineConfig,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parser: SignalParser,
        ledger: PositionLedger,
        view: PositionView,
        executor: OrderExecutor,
        trade_config: TradeConfig,
        audit: Arc<AuditLog>,
        notifier: Option<Notifier>,
        config: PipelineConfig,
    ) -> Self {
        let pipeline = Self {
            parser,
            ledger,
            view,
            executor,
            trade_config,
            audit,
            notifier,
            config,
        };
        pipeline.publish_gauges();
        pipeline
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn clear_safe_mode(&mut self) -> Result<(), LedgerError> {
        self.ledger.clear_safe_mode()?;
        self.publish_gauges();
        Ok(())
    }

    /// Fresh broker positions for the next batch.
    pub fn start_cycle(&mut self) {
        self.view.clear();
    }

    pub async fn process_message(&mut self, msg: &AlertMessage) -> Outcome {
        let start = Instant::now();
        counter!("alerts_received_total").increment(1);
        let source = msg.excerpt();

        let outcome = self.process_inner(msg, &source).await;

        histogram!("message_latency_seconds").record(start.elapsed().as_secs_f64());
        self.publish_gauges();
        outcome
    }

    async fn process_inner(&mut self, msg: &AlertMessage, source: &str) -> Outcome {
        // Step 1: Parse
        let mut signal = match self.parser.parse(&msg.subject, &msg.body) {
            Ok(s) => s,
            Err(e) => {
                counter!("alerts_parse_failed_total").increment(1);
                self.audit.record(AuditEvent::failed(
                    None,
                    "parse_error",
                    format!("{} ({})", e, e.code()),
                    source,
                ));
                return Outcome::Failed {
                    reason: "parse_error".into(),
                };
            }
        };

        tracing::info!(%signal, received_at = %msg.received_at, "Processing alert");

        // Step 2: Trade-config quantity
        if self.config.quantity_source == QuantitySource::Config {
            match self.trade_config.quantity_for(&signal.ticker) {
                Some(q) if q > Decimal::ZERO => signal = signal.with_quantity(q),
                _ => {
                    self.audit.record(AuditEvent::failed(
                        Some(&signal),
                        "not_configured",
                        format!(
                            "No trade config row for {} on {}",
                            signal.ticker, self.config.builder.account
                        ),
                        source,
                    ));
                    return Outcome::Skipped {
                        reason: "not_configured",
                    };
                }
            }
        }

        // Step 3: Safety validation
        let decision = authorize(&signal, &self.ledger, &mut self.view).await;
        if !decision.is_allowed() {
            counter!("decisions_blocked_total").increment(1);
            self.audit
                .record(AuditEvent::decision(&signal, &decision, None, source));
            self.notify(notifier::format_blocked(&signal, &decision));
            return Outcome::Blocked {
                reason: decision.reason,
            };
        }
        counter!("decisions_allowed_total").increment(1);

        // Step 4: Sells clear bracket exits and refuse to stack on a pending sell
        let mut cancelled_exits = Vec::new();
        if signal.action == Side::Sell {
            match self.executor.prepare_sell(&signal.ticker).await {
                Ok(prep) if !prep.pending_sells.is_empty() => {
                    let mut detail = format!(
                        "Sell for {} already working: {}",
                        signal.ticker,
                        prep.pending_sells.join(", ")
                    );
                    if !prep.cancelled.is_empty() {
                        detail.push_str(&format!("; cancelled exits: {}", prep.cancelled.join(", ")));
                    }
                    self.audit.record(
                        AuditEvent::failed(Some(&signal), "sell_pending", detail, source)
                            .with_decision_quantities(&decision),
                    );
                    return Outcome::Skipped {
                        reason: "sell_pending",
                    };
                }
                Ok(prep) => cancelled_exits = prep.cancelled,
                Err(e) => return self.fail(&signal, e.code(), e.to_string(), source),
            }
        }

        // Step 5: Build
        let market_open = self.config.market_hours.is_open(signal.event_timestamp);
        let request = match build(
            &signal,
            decision.validated_quantity,
            market_open,
            &self.config.builder,
        ) {
            Ok(r) => r,
            Err(e) => {
                return self.fail_sell(&signal, &cancelled_exits, e.code(), e.to_string(), source)
            }
        };

        // Step 6: Submit
        let placement = match self.executor.submit(&request).await {
            Ok(p) => p,
            Err(e) => {
                counter!("orders_failed_total").increment(1);
                return self.fail_sell(&signal, &cancelled_exits, e.code(), e.to_string(), source);
            }
        };
        counter!("orders_placed_total").increment(1);
        self.view.invalidate(&signal.ticker);

        // Step 7: Ledger feedback
        let price = signal.price.round_dp(self.config.builder.price_decimals);
        let recorded = match signal.action {
            Side::Buy => self.ledger.record_open(
                BotTrade::open_buy(
                    placement.order_id.clone(),
                    signal.ticker.clone(),
                    decision.validated_quantity,
                    price,
                    placement.status,
                    signal.sl_pct,
                    signal.tp_pct,
                )
                .with_source(source),
            ),
            Side::Sell => self
                .ledger
                .record_sell(
                    BotTrade::sell(
                        placement.order_id.clone(),
                        signal.ticker.clone(),
                        decision.validated_quantity,
                        price,
                        placement.status,
                        Vec::new(),
                    )
                    .with_source(source),
                )
                .map(|alloc| {
                    tracing::info!(
                        ticker = %signal.ticker,
                        order_id = %placement.order_id,
                        allocated = %alloc.allocated(),
                        lots = alloc.closed_from.len(),
                        "Sell allocated FIFO"
                    );
                }),
        };
        if let Err(e) = recorded {
            tracing::error!(
                order_id = %placement.order_id,
                ticker = %signal.ticker,
                error = %e,
                "Order placed but ledger update failed; reconcile manually"
            );
            return self.fail(
                &signal,
                "ledger_error",
                format!("order {} placed but not recorded: {e}", placement.order_id),
                source,
            );
        }

        // Step 8: Audit + notify
        self.audit.record(AuditEvent::decision(
            &signal,
            &decision,
            Some(placement.order_id.clone()),
            source,
        ));
        if signal.event_timestamp.date_naive() == Utc::now().date_naive() {
            self.notify(notifier::format_order_placed(
                &signal,
                &request,
                &placement.order_id,
                self.config.demo,
            ));
        }

        Outcome::Placed {
            order_id: placement.order_id,
            ticker: signal.ticker,
            side: signal.action,
            quantity: decision.validated_quantity,
        }
    }

    /// Refresh pending ledger trades from the broker. Returns how many changed.
    pub async fn poll_fills(&mut self) -> usize {
        let mut updated = 0;
        for order_id in self.ledger.pending_orders() {
            let status = match self.executor.order_status(&order_id).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(%order_id, error = %e, "Fill poll: status query failed");
                    continue;
                }
            };
            match self.ledger.update_status(&order_id, status) {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(%order_id, error = %e, "Fill poll: ledger update failed"),
            }
        }
        if updated > 0 {
            tracing::info!(updated, "Fill poll applied status changes");
            self.publish_gauges();
        }
        updated
    }

    /// Compare ledger vs broker for every known ticker. Never mutates the ledger.
    pub async fn reconcile(&mut self) -> ReconcileReport {
        self.view.clear();
        let configured = self.trade_config.tickers();
        let report = reconcile_all(&self.ledger, &mut self.view, &configured).await;
        if let Some(msg) = notifier::format_reconcile(&report) {
            self.notify(msg);
        }
        report
    }

    fn fail(&self, signal: &TradeSignal, reason: &str, detail: String, source: &str) -> Outcome {
        self.audit
            .record(AuditEvent::failed(Some(signal), reason, detail.clone(), source));
        self.notify(notifier::format_failure(&signal.ticker, reason, &detail));
        Outcome::Failed {
            reason: reason.to_string(),
        }
    }

    /// Failure after Step 4 cancelled bracket exits leaves the position without exits.
    fn fail_sell(
        &self,
        signal: &TradeSignal,
        cancelled: &[String],
        reason: &str,
        detail: String,
        source: &str,
    ) -> Outcome {
        if cancelled.is_empty() {
            return self.fail(signal, reason, detail, source);
        }
        let cancelled = cancelled.join(", ");
        tracing::error!(
            ticker = %signal.ticker,
            %cancelled,
            cause = reason,
            "Sell failed after bracket exits were cancelled; position has no exits"
        );
        self.fail(
            signal,
            "sell_failed_exits_cancelled",
            format!("{detail} ({reason}); cancelled exits: {cancelled}"),
            source,
        )
    }

    fn notify(&self, message: String) {
        if let Some(n) = &self.notifier {
            n.spawn_send(message);
        }
    }

    fn publish_gauges(&self) {
        let open_tickers = self
            .ledger
            .summary()
            .iter()
            .filter(|s| s.open_quantity > Decimal::ZERO)
            .count();
        gauge!("ledger_open_tickers").set(open_tickers as f64);
        gauge!("ledger_safe_mode").set(if self.ledger.safe_mode() { 1.0 } else { 0.0 });
    }
}
