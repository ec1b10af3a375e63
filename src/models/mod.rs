pub mod message;
pub mod order;
pub mod signal;
pub mod trade;

pub use message::AlertMessage;
pub use order::{
    BracketAck, BracketOrder, OpenOrder, OrderAck, OrderRequest, OrderType, SingleOrder,
};
pub use signal::{SlTpSource, TradeSignal};
pub use trade::{Allocation, BotTrade, TradeStatus};

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_alert_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Instrument kind: routes the contract lookup at the broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    Stock,
    Crypto,
}

impl InstrumentKind {
    pub fn for_ticker(ticker: &str) -> Self {
        let upper = ticker.to_uppercase();
        if upper.contains("BTC") || upper.contains("ETH") {
            InstrumentKind::Crypto
        } else {
            InstrumentKind::Stock
        }
    }

    /// Security type code used by the brokerage contract search.
    pub fn sec_type(&self) -> &'static str {
        match self {
            InstrumentKind::Stock => "STK",
            InstrumentKind::Crypto => "CRYPTO",
        }
    }
}
