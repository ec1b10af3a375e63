use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Side;

/// Where the stop-loss / take-profit percentages of a signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlTpSource {
    Body,
    Subject,
    None,
}

impl fmt::Display for SlTpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlTpSource::Body => write!(f, "body"),
            SlTpSource::Subject => write!(f, "subject"),
            SlTpSource::None => write!(f, "none"),
        }
    }
}

/// A structured trade intent extracted from one alert message.
///
/// Built only by the parser, which guarantees `quantity > 0` and `price > 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub ticker: String,
    pub action: Side,
    /// Fill price announced by the alert.
    pub price: Decimal,
    /// Filled quantity announced by the alert.
    pub quantity: Decimal,
    /// Timestamp declared inside the alert body.
    pub event_timestamp: DateTime<Utc>,
    pub sl_pct: Option<Decimal>,
    pub tp_pct: Option<Decimal>,
    pub source_of_sl_tp: SlTpSource,
}

impl TradeSignal {
    /// True when both bracket percentages are known.
    pub fn has_sl_tp(&self) -> bool {
        self.sl_pct.is_some() && self.tp_pct.is_some()
    }

    /// Same signal with a different order quantity (trade-config override).
    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = quantity;
        self
    }
}

impl fmt::Display for TradeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} x{} @ {} (SL: {}, TP: {}, from {})",
            self.action,
            self.ticker,
            self.quantity,
            self.price,
            self.sl_pct.map(|v| format!("{v}%")).unwrap_or_else(|| "-".into()),
            self.tp_pct.map(|v| format!("{v}%")).unwrap_or_else(|| "-".into()),
            self.source_of_sl_tp,
        )
    }
}
