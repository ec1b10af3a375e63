//! The bot's own record of what it bought and has not yet sold.
//!
//! Per ticker, buys form a FIFO queue: the oldest open buy is closed first. Every
//! mutation is persisted before it returns; a failed write rolls the in-memory state
//! back so the ledger never holds a change the store does not.

pub mod store;

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::models::{Allocation, BotTrade, Side, TradeStatus};

pub use store::{LedgerError, LedgerMap, LedgerStore, LoadSource};

/// Result of walking the open queue for a sell.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AllocationResult {
    /// Buys consumed, oldest first.
    pub closed_from: Vec<Allocation>,
    /// Requested quantity the queue could not cover. Never force-satisfied.
    pub shortfall: Decimal,
}

impl AllocationResult {
    pub fn allocated(&self) -> Decimal {
        self.closed_from.iter().map(|a| a.quantity).sum()
    }
}

/// Ledger and broker disagree on a ticker. Reported, never auto-corrected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MismatchReport {
    pub ticker: String,
    pub ledger_quantity: Decimal,
    pub broker_quantity: Decimal,
    /// `broker - ledger`.
    pub difference: Decimal,
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hint = if self.difference > Decimal::ZERO {
            "broker holds more than the bot bought (manual or external position)"
        } else {
            "bot believes it owns more than the broker holds"
        };
        write!(
            f,
            "{}: ledger {} vs broker {} ({hint})",
            self.ticker, self.ledger_quantity, self.broker_quantity
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickerSummary {
    pub ticker: String,
    pub open_quantity: Decimal,
    pub open_entries: usize,
    pub total_bought: Decimal,
    pub total_sold: Decimal,
}

/// Read-only copy published to the operator API after every cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerSnapshot {
    pub open: BTreeMap<String, Vec<BotTrade>>,
    pub summary: Vec<TickerSummary>,
    pub safe_mode: bool,
    pub total_trades: usize,
}

#[derive(Debug)]
pub struct PositionLedger {
    trades: LedgerMap,
    store: Option<LedgerStore>,
    safe_mode: bool,
    tolerance: Decimal,
}

impl PositionLedger {
    /// Unpersisted ledger.
    pub fn in_memory() -> Self {
        Self {
            trades: LedgerMap::new(),
            store: None,
            safe_mode: false,
            tolerance: Decimal::new(1, 6),
        }
    }

    /// Load from `store`. An unrecoverable store yields an empty ledger in safe mode.
    pub fn open(store: LedgerStore) -> Result<(Self, LoadSource), LedgerError> {
        let (trades, source) = store.load()?;
        let safe_mode = source.requires_safe_mode();
        if safe_mode {
            warn!("Ledger in safe mode: sells are blocked until a buy is recorded or an operator clears it");
        }
        let ledger = Self {
            trades,
            store: Some(store),
            safe_mode,
            tolerance: Decimal::new(1, 6),
        };
        Ok((ledger, source))
    }

    pub fn with_tolerance(mut self, tolerance: Decimal) -> Self {
        self.tolerance = tolerance.abs();
        self
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode
    }

    /// Leave safe mode and retire the corrupt store copies, so the next start does not
    /// come back in safe mode.
    pub fn clear_safe_mode(&mut self) -> Result<(), LedgerError> {
        if !self.safe_mode {
            return Ok(());
        }
        if let Some(store) = &self.store {
            store.retire_corrupt_copies()?;
        }
        self.safe_mode = false;
        info!("Ledger safe mode cleared by operator");
        Ok(())
    }

    /// Append a buy to its ticker's FIFO queue.
    pub fn record_open(&mut self, trade: BotTrade) -> Result<(), LedgerError> {
        if trade.action != Side::Buy {
            return Err(LedgerError::Invalid(format!(
                "record_open called with a {} trade",
                trade.action
            )));
        }
        self.check_new(&trade)?;

        let mut trade = trade;
        if trade.status == TradeStatus::Rejected {
            trade.remaining_quantity = Decimal::ZERO;
            trade.is_closed = true;
            trade.closed_at = Some(Utc::now());
        }
        let rejected = trade.status == TradeStatus::Rejected;
        let (order_id, ticker, quantity) =
            (trade.order_id.clone(), trade.ticker.clone(), trade.quantity);
        let was_safe = self.safe_mode;

        self.transact(|trades| {
            trades.entry(trade.ticker.clone()).or_default().push(trade);
            Ok(())
        })?;

        if was_safe && !rejected {
            match self.store.as_ref().map(LedgerStore::retire_corrupt_copies) {
                Some(Err(e)) => {
                    warn!(%ticker, error = %e, "Could not retire corrupt ledger copies, staying in safe mode");
                }
                _ => {
                    self.safe_mode = false;
                    info!(%ticker, "Buy recorded, leaving ledger safe mode");
                }
            }
        }
        info!(%ticker, %order_id, %quantity, "Recorded open buy");
        Ok(())
    }

    /// Close up to `quantity` from the ticker's open buys, oldest first.
    pub fn allocate_close(
        &mut self,
        ticker: &str,
        quantity: Decimal,
    ) -> Result<AllocationResult, LedgerError> {
        if quantity <= Decimal::ZERO {
            return Err(LedgerError::InvalidQuantity(quantity));
        }
        self.transact(|trades| Ok(allocate(trades, ticker, quantity)))
    }

    /// Allocate a placed sell against the open queue and record the sell itself,
    /// in one persisted write.
    pub fn record_sell(&mut self, sell: BotTrade) -> Result<AllocationResult, LedgerError> {
        if sell.action != Side::Sell {
            return Err(LedgerError::Invalid(format!(
                "record_sell called with a {} trade",
                sell.action
            )));
        }
        self.check_new(&sell)?;

        let result = self.transact(|trades| {
            let result = if sell.status == TradeStatus::Rejected {
                AllocationResult::default()
            } else {
                allocate(trades, &sell.ticker, sell.quantity)
            };
            let mut sell = sell;
            sell.closes = result.closed_from.clone();
            trades.entry(sell.ticker.clone()).or_default().push(sell);
            Ok(result)
        })?;

        if result.shortfall > Decimal::ZERO {
            warn!(shortfall = %result.shortfall, "Sell exceeded bot-owned quantity");
        }
        Ok(result)
    }

    /// Apply a broker status change. Returns `false` when nothing changed.
    pub fn update_status(&mut self, order_id: &str, status: TradeStatus) -> Result<bool, LedgerError> {
        let current = self
            .get(order_id)
            .ok_or_else(|| LedgerError::UnknownOrder(order_id.to_string()))?;
        if current.status == status {
            return Ok(false);
        }

        let released = self.transact(|trades| {
            let mut released = Vec::new();
            if let Some(t) = trades.values_mut().flatten().find(|t| t.order_id == order_id) {
                t.status = status;
                if status == TradeStatus::Rejected {
                    match t.action {
                        Side::Buy if !t.is_closed => {
                            t.remaining_quantity = Decimal::ZERO;
                            t.is_closed = true;
                            t.closed_at = Some(Utc::now());
                        }
                        // A sell that never executed hands its lots back.
                        Side::Sell => released = std::mem::take(&mut t.closes),
                        Side::Buy => {}
                    }
                }
            }
            for alloc in &released {
                reopen(trades, alloc);
            }
            Ok(released)
        })?;

        if !released.is_empty() {
            let quantity: Decimal = released.iter().map(|a| a.quantity).sum();
            warn!(%order_id, %quantity, lots = released.len(), "Rejected sell released its allocations");
        }
        info!(%order_id, %status, "Trade status updated");
        Ok(true)
    }

    /// Sum of remaining quantity across the ticker's open buys.
    pub fn open_quantity(&self, ticker: &str) -> Decimal {
        self.open_entries(ticker).map(|t| t.remaining_quantity).sum()
    }

    /// Open buys for `ticker`, FIFO order.
    pub fn open_entries<'a>(&'a self, ticker: &str) -> impl Iterator<Item = &'a BotTrade> + 'a {
        self.trades
            .get(ticker)
            .into_iter()
            .flatten()
            .filter(|t| t.is_open())
    }

    /// Compare against a broker quantity. Pure: never mutates either side.
    pub fn reconcile(&self, broker_quantity: Decimal, ticker: &str) -> Option<MismatchReport> {
        let ledger_quantity = self.open_quantity(ticker);
        let difference = broker_quantity - ledger_quantity;
        if difference.abs() <= self.tolerance {
            return None;
        }
        Some(MismatchReport {
            ticker: ticker.to_string(),
            ledger_quantity,
            broker_quantity,
            difference,
        })
    }

    pub fn get(&self, order_id: &str) -> Option<&BotTrade> {
        self.trades.values().flatten().find(|t| t.order_id == order_id)
    }

    /// Every ticker that has ever been traded.
    pub fn tickers(&self) -> Vec<String> {
        self.trades.keys().cloned().collect()
    }

    /// Order ids still awaiting a final broker status.
    pub fn pending_orders(&self) -> Vec<String> {
        self.trades
            .values()
            .flatten()
            .filter(|t| t.status == TradeStatus::Pending)
            .map(|t| t.order_id.clone())
            .collect()
    }

    pub fn summary(&self) -> Vec<TickerSummary> {
        self.trades
            .iter()
            .map(|(ticker, entries)| {
                let live = entries.iter().filter(|t| t.status != TradeStatus::Rejected);
                let (mut bought, mut sold) = (Decimal::ZERO, Decimal::ZERO);
                for t in live {
                    match t.action {
                        Side::Buy => bought += t.quantity,
                        Side::Sell => sold += t.quantity,
                    }
                }
                TickerSummary {
                    ticker: ticker.clone(),
                    open_quantity: self.open_quantity(ticker),
                    open_entries: self.open_entries(ticker).count(),
                    total_bought: bought,
                    total_sold: sold,
                }
            })
            .collect()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let open = self
            .trades
            .keys()
            .filter_map(|ticker| {
                let entries: Vec<BotTrade> = self.open_entries(ticker).cloned().collect();
                (!entries.is_empty()).then(|| (ticker.clone(), entries))
            })
            .collect();
        LedgerSnapshot {
            open,
            summary: self.summary(),
            safe_mode: self.safe_mode,
            total_trades: self.trades.values().map(Vec::len).sum(),
        }
    }

    fn check_new(&self, trade: &BotTrade) -> Result<(), LedgerError> {
        if trade.quantity <= Decimal::ZERO {
            return Err(LedgerError::InvalidQuantity(trade.quantity));
        }
        if self.get(&trade.order_id).is_some() {
            return Err(LedgerError::DuplicateOrder(trade.order_id.clone()));
        }
        Ok(())
    }

    /// Mutate, persist, and roll back on a failed write.
    fn transact<T, F>(&mut self, mutate: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut LedgerMap) -> Result<T, LedgerError>,
    {
        let before = self.trades.clone();
        let out = match mutate(&mut self.trades) {
            Ok(out) => out,
            Err(e) => {
                self.trades = before;
                return Err(e);
            }
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.trades) {
                self.trades = before;
                return Err(e);
            }
        }
        Ok(out)
    }
}

fn reopen(trades: &mut LedgerMap, alloc: &Allocation) {
    let Some(buy) = trades
        .values_mut()
        .flatten()
        .find(|t| t.order_id == alloc.order_id && t.action == Side::Buy)
    else {
        return;
    };
    if buy.status == TradeStatus::Rejected {
        return;
    }
    buy.remaining_quantity = (buy.remaining_quantity + alloc.quantity).min(buy.quantity);
    buy.is_closed = false;
    buy.closed_at = None;
}

fn allocate(trades: &mut LedgerMap, ticker: &str, quantity: Decimal) -> AllocationResult {
    let mut needed = quantity;
    let mut closed_from = Vec::new();

    if let Some(entries) = trades.get_mut(ticker) {
        for entry in entries.iter_mut().filter(|t| t.is_open()) {
            if needed <= Decimal::ZERO {
                break;
            }
            let take = needed.min(entry.remaining_quantity);
            entry.remaining_quantity -= take;
            needed -= take;
            if entry.remaining_quantity.is_zero() {
                entry.is_closed = true;
                entry.closed_at = Some(Utc::now());
            }
            closed_from.push(Allocation {
                order_id: entry.order_id.clone(),
                quantity: take,
            });
        }
    }

    AllocationResult {
        closed_from,
        shortfall: needed.max(Decimal::ZERO),
    }
}
