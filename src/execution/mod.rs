pub mod market_hours;
pub mod order_builder;
pub mod order_executor;
pub mod reconciler;
pub mod safety;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::broker::BrokerError;

pub use market_hours::MarketHours;
pub use order_builder::{build, BuilderConfig, MissingSlTpPolicy};
pub use order_executor::{OrderExecutor, Placement, SellPreparation};
pub use reconciler::{reconcile_all, ReconcileReport};
pub use safety::{authorize, decide, Decision, DecisionReason, Verdict};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{ticker}: bracket wanted but SL/TP missing and policy is reject")]
    MissingSlTp { ticker: String },

    #[error("order quantity must be positive, got {0}")]
    InvalidQuantity(Decimal),

    #[error("computed {leg} price {price} is not positive")]
    InvalidPrice { leg: &'static str, price: Decimal },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ExecutionError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::MissingSlTp { .. } => "missing_sl_tp",
            ExecutionError::InvalidQuantity(_) => "invalid_quantity",
            ExecutionError::InvalidPrice { .. } => "invalid_price",
            ExecutionError::Broker(e) => e.code(),
        }
    }
}
