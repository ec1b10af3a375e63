use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Side, TradeStatus};

/// Order pricing instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit { price: Decimal },
    Stop { trigger: Decimal },
}

impl OrderType {
    /// Brokerage order type code.
    pub fn code(&self) -> &'static str {
        match self {
            OrderType::Market => "MKT",
            OrderType::Limit { .. } => "LMT",
            OrderType::Stop { .. } => "STP",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MKT"),
            OrderType::Limit { price } => write!(f, "LMT {price}"),
            OrderType::Stop { trigger } => write!(f, "STP {trigger}"),
        }
    }
}

/// One order leg, good-till-cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleOrder {
    /// Client-side reference, unique per leg.
    pub client_ref: String,
    /// Client reference of the entry leg this leg hangs off (bracket exits only).
    pub parent_ref: Option<String>,
    /// One-cancels-other group shared by the two exit legs of a bracket.
    pub oca_group: Option<String>,
    pub account: String,
    pub ticker: String,
    pub side: Side,
    pub quantity: Decimal,
    pub order_type: OrderType,
}

/// Entry plus take-profit and stop-loss exits. The broker activates the exits when
/// the entry fills and cancels the surviving exit when the other one fills.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BracketOrder {
    pub entry: SingleOrder,
    pub take_profit: SingleOrder,
    pub stop_loss: SingleOrder,
}

impl BracketOrder {
    pub fn take_profit_price(&self) -> Option<Decimal> {
        match self.take_profit.order_type {
            OrderType::Limit { price } => Some(price),
            _ => None,
        }
    }

    pub fn stop_loss_price(&self) -> Option<Decimal> {
        match self.stop_loss.order_type {
            OrderType::Stop { trigger } => Some(trigger),
            _ => None,
        }
    }
}

/// What the order builder hands to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderRequest {
    Single(SingleOrder),
    Bracket(BracketOrder),
}

impl OrderRequest {
    fn entry(&self) -> &SingleOrder {
        match self {
            OrderRequest::Single(o) => o,
            OrderRequest::Bracket(b) => &b.entry,
        }
    }

    pub fn ticker(&self) -> &str {
        &self.entry().ticker
    }

    pub fn side(&self) -> Side {
        self.entry().side
    }

    pub fn quantity(&self) -> Decimal {
        self.entry().quantity
    }

    pub fn order_type(&self) -> &OrderType {
        &self.entry().order_type
    }

    pub fn is_bracket(&self) -> bool {
        matches!(self, OrderRequest::Bracket(_))
    }
}

/// Broker acknowledgement of a single order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: TradeStatus,
}

/// Broker acknowledgement of a bracket: the parent id identifies the position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BracketAck {
    pub parent_order_id: String,
    pub leg_ids: Vec<String>,
    pub status: TradeStatus,
}

/// A working order at the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub ticker: String,
    pub side: Side,
    /// Set for bracket exit legs.
    pub parent_id: Option<String>,
}

impl OpenOrder {
    pub fn is_bracket_exit(&self) -> bool {
        self.parent_id.is_some()
    }
}
