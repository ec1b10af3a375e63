//! Long-only sell authorization.
//!
//! A sell is never allowed for more than the lesser of what the broker holds and
//! what the bot itself bought. Buys pass structurally; margin is the broker's concern.

use std::fmt;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::broker::{BrokerError, PositionView};
use crate::ledger::PositionLedger;
use crate::models::{Side, TradeSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Block,
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Buy,
    SellAuthorized,
    /// Allowed, but for less than requested.
    SellClamped,
    SafeMode,
    NoBrokerPosition,
    NoBotOwnedPosition,
    ZeroQuantity,
    BrokerUnavailable,
}

impl DecisionReason {
    pub fn code(&self) -> &'static str {
        match self {
            DecisionReason::Buy => "buy",
            DecisionReason::SellAuthorized => "sell_authorized",
            DecisionReason::SellClamped => "sell_clamped",
            DecisionReason::SafeMode => "safe_mode",
            DecisionReason::NoBrokerPosition => "no_broker_position",
            DecisionReason::NoBotOwnedPosition => "no_bot_owned_position",
            DecisionReason::ZeroQuantity => "zero_quantity",
            DecisionReason::BrokerUnavailable => "broker_unavailable",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub validated_quantity: Decimal,
    pub reason: DecisionReason,
    pub requested_quantity: Decimal,
    /// Broker-reported holding; `None` when not consulted.
    pub broker_quantity: Option<Decimal>,
    /// Ledger open quantity; `None` when not consulted.
    pub ledger_quantity: Option<Decimal>,
    pub message: String,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    fn block(
        reason: DecisionReason,
        requested: Decimal,
        broker: Option<Decimal>,
        ledger: Option<Decimal>,
        message: String,
    ) -> Self {
        Self {
            verdict: Verdict::Block,
            validated_quantity: Decimal::ZERO,
            reason,
            requested_quantity: requested,
            broker_quantity: broker,
            ledger_quantity: ledger,
            message,
        }
    }
}

/// Decide a signal given already-fetched quantities.
///
/// `broker_quantity` and `ledger_quantity` are only read for sells.
pub fn decide(
    signal: &TradeSignal,
    ledger_quantity: Decimal,
    broker_quantity: Decimal,
    safe_mode: bool,
) -> Decision {
    let requested = signal.quantity;
    let ticker = &signal.ticker;

    if signal.action == Side::Buy {
        return Decision {
            verdict: Verdict::Allow,
            validated_quantity: requested,
            reason: DecisionReason::Buy,
            requested_quantity: requested,
            broker_quantity: None,
            ledger_quantity: None,
            message: format!("BUY {ticker} x{requested} allowed"),
        };
    }

    if safe_mode {
        return Decision::block(
            DecisionReason::SafeMode,
            requested,
            None,
            Some(ledger_quantity),
            format!("SELL {ticker} blocked: ledger is in safe mode after an unrecoverable load"),
        );
    }

    // 1. Broker must hold a long position
    if broker_quantity <= Decimal::ZERO {
        return Decision::block(
            DecisionReason::NoBrokerPosition,
            requested,
            Some(broker_quantity),
            None,
            format!("SELL {ticker} blocked: no broker position (broker reports {broker_quantity})"),
        );
    }

    // 2. Bot must own some of it
    if ledger_quantity <= Decimal::ZERO {
        return Decision::block(
            DecisionReason::NoBotOwnedPosition,
            requested,
            Some(broker_quantity),
            Some(ledger_quantity),
            format!("SELL {ticker} blocked: no bot-owned position (broker holds {broker_quantity})"),
        );
    }

    // 3. Clamp to the smallest bound
    let validated = requested.min(broker_quantity).min(ledger_quantity);
    if validated <= Decimal::ZERO {
        return Decision::block(
            DecisionReason::ZeroQuantity,
            requested,
            Some(broker_quantity),
            Some(ledger_quantity),
            format!("SELL {ticker} blocked: validated quantity is zero"),
        );
    }

    let (reason, message) = if validated < requested {
        (
            DecisionReason::SellClamped,
            format!(
                "SELL {ticker} clamped from {requested} to {validated} (broker {broker_quantity}, bot {ledger_quantity})"
            ),
        )
    } else {
        (
            DecisionReason::SellAuthorized,
            format!("SELL {ticker} x{validated} authorized"),
        )
    };

    Decision {
        verdict: Verdict::Allow,
        validated_quantity: validated,
        reason,
        requested_quantity: requested,
        broker_quantity: Some(broker_quantity),
        ledger_quantity: Some(ledger_quantity),
        message,
    }
}

/// Authorize a signal against the ledger and live broker holdings.
///
/// A broker query that fails after retries blocks the sell.
pub async fn authorize(
    signal: &TradeSignal,
    ledger: &PositionLedger,
    broker: &mut PositionView,
) -> Decision {
    if signal.action == Side::Buy {
        return decide(signal, Decimal::ZERO, Decimal::ZERO, ledger.safe_mode());
    }

    let ledger_quantity = ledger.open_quantity(&signal.ticker);
    if ledger.safe_mode() {
        return decide(signal, ledger_quantity, Decimal::ZERO, true);
    }

    match broker.position(&signal.ticker).await {
        Ok(broker_quantity) => decide(signal, ledger_quantity, broker_quantity, false),
        Err(e) => unavailable(signal, ledger_quantity, &e),
    }
}

fn unavailable(signal: &TradeSignal, ledger_quantity: Decimal, e: &BrokerError) -> Decision {
    Decision::block(
        DecisionReason::BrokerUnavailable,
        signal.quantity,
        None,
        Some(ledger_quantity),
        format!("SELL {} blocked: broker position unavailable ({e})", signal.ticker),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
