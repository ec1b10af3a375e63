use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Side;

/// Lifecycle of an order the bot placed, as acknowledged by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Filled,
    Rejected,
}

impl TradeStatus {
    pub fn from_api_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "filled" => TradeStatus::Filled,
            "rejected" | "cancelled" | "canceled" | "inactive" | "expired" => {
                TradeStatus::Rejected
            }
            _ => TradeStatus::Pending,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, TradeStatus::Pending)
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeStatus::Pending => write!(f, "pending"),
            TradeStatus::Filled => write!(f, "filled"),
            TradeStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Quantity taken from one open buy when a sell was allocated FIFO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub order_id: String,
    pub quantity: Decimal,
}

/// One order the bot itself placed. Never deleted; closed entries stay for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotTrade {
    pub order_id: String,
    pub ticker: String,
    pub action: Side,
    /// Quantity at placement; never changes afterwards.
    pub quantity: Decimal,
    /// Part of a buy still available for FIFO allocation. Zero for sells.
    pub remaining_quantity: Decimal,
    pub price: Decimal,
    pub status: TradeStatus,
    pub is_closed: bool,
    pub sl_pct: Option<Decimal>,
    pub tp_pct: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// For sells: the buys this sell consumed, oldest first.
    #[serde(default)]
    pub closes: Vec<Allocation>,
    #[serde(default)]
    pub source: String,
}

impl BotTrade {
    /// A freshly placed buy: fully open.
    pub fn open_buy(
        order_id: impl Into<String>,
        ticker: impl Into<String>,
        quantity: Decimal,
        price: Decimal,
        status: TradeStatus,
        sl_pct: Option<Decimal>,
        tp_pct: Option<Decimal>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            ticker: ticker.into(),
            action: Side::Buy,
            quantity,
            remaining_quantity: quantity,
            price,
            status,
            is_closed: false,
            sl_pct,
            tp_pct,
            opened_at: Utc::now(),
            closed_at: None,
            closes: Vec::new(),
            source: String::new(),
        }
    }

    /// A placed sell. Sells close exposure, so they are closed on creation.
    pub fn sell(
        order_id: impl Into<String>,
        ticker: impl Into<String>,
        quantity: Decimal,
        price: Decimal,
        status: TradeStatus,
        closes: Vec<Allocation>,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: order_id.into(),
            ticker: ticker.into(),
            action: Side::Sell,
            quantity,
            remaining_quantity: Decimal::ZERO,
            price,
            status,
            is_closed: true,
            sl_pct: None,
            tp_pct: None,
            opened_at: now,
            closed_at: Some(now),
            closes,
            source: String::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// True when this entry still counts toward the bot-owned open quantity.
    pub fn is_open(&self) -> bool {
        self.action == Side::Buy
            && !self.is_closed
            && self.status != TradeStatus::Rejected
            && self.remaining_quantity > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_from_api_str() {
        assert_eq!(TradeStatus::from_api_str("Filled"), TradeStatus::Filled);
        assert_eq!(TradeStatus::from_api_str("Cancelled"), TradeStatus::Rejected);
        assert_eq!(TradeStatus::from_api_str("PreSubmitted"), TradeStatus::Pending);
    }

    #[test]
    fn test_rejected_buy_is_not_open() {
        let mut t = BotTrade::open_buy("1", "AAPL", dec!(5), dec!(100), TradeStatus::Pending, None, None);
        assert!(t.is_open());
        t.status = TradeStatus::Rejected;
        assert!(!t.is_open());
    }

    #[test]
    fn test_sell_is_closed_on_creation() {
        let t = BotTrade::sell("2", "AAPL", dec!(5), dec!(101), TradeStatus::Filled, vec![]);
        assert!(t.is_closed);
        assert!(!t.is_open());
        assert_eq!(t.remaining_quantity, Decimal::ZERO);
    }
}
