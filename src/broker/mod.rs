pub mod ibkr;
pub mod paper;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{BracketAck, BracketOrder, OpenOrder, OrderAck, SingleOrder, TradeStatus};

pub use ibkr::IbkrClient;
pub use paper::PaperBroker;
pub use retry::RetryPolicy;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker call timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Transient failures are retried with backoff; permanent ones are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout(_)
                | BrokerError::RateLimited(_)
                | BrokerError::Transport(_)
                | BrokerError::Unavailable(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::Timeout(_) => "broker_timeout",
            BrokerError::RateLimited(_) => "broker_rate_limited",
            BrokerError::Transport(_) => "broker_transport",
            BrokerError::Unavailable(_) => "broker_unavailable",
            BrokerError::Rejected(_) => "order_rejected",
            BrokerError::InvalidSymbol(_) => "invalid_symbol",
            BrokerError::Other(_) => "broker_error",
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BrokerError::Timeout(e.to_string())
        } else if e.is_decode() {
            BrokerError::Other(e.to_string())
        } else {
            BrokerError::Transport(e.to_string())
        }
    }
}

/// Brokerage execution interface.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Signed quantity held for `ticker`; zero when flat.
    async fn position(&self, ticker: &str) -> Result<Decimal, BrokerError>;

    async fn place_order(&self, order: &SingleOrder) -> Result<OrderAck, BrokerError>;

    async fn place_bracket_order(&self, order: &BracketOrder) -> Result<BracketAck, BrokerError>;

    async fn order_status(&self, order_id: &str) -> Result<TradeStatus, BrokerError>;

    /// Working orders for `ticker`.
    async fn open_orders(&self, ticker: &str) -> Result<Vec<OpenOrder>, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;
}

/// Broker positions as seen during one processing cycle.
///
/// Each ticker is fetched once per cycle and cached. Placing an order on a ticker
/// invalidates its entry so the next decision sees fresh holdings.
pub struct PositionView {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
    cache: HashMap<String, Decimal>,
}

impl PositionView {
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        Self {
            broker,
            retry,
            cache: HashMap::new(),
        }
    }

    pub async fn position(&mut self, ticker: &str) -> Result<Decimal, BrokerError> {
        if let Some(qty) = self.cache.get(ticker) {
            return Ok(*qty);
        }
        let broker = self.broker.clone();
        let qty = self
            .retry
            .run("position", || {
                let broker = broker.clone();
                let ticker = ticker.to_string();
                async move { broker.position(&ticker).await }
            })
            .await?;
        self.cache.insert(ticker.to_string(), qty);
        Ok(qty)
    }

    pub fn invalidate(&mut self, ticker: &str) {
        self.cache.remove(ticker);
    }

    /// Start of a new cycle.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    #[test]
    fn test_retryable_classification() {
        assert!(BrokerError::Timeout("t".into()).is_retryable());
        assert!(BrokerError::RateLimited("r".into()).is_retryable());
        assert!(BrokerError::Unavailable("u".into()).is_retryable());
        assert!(!BrokerError::Rejected("x".into()).is_retryable());
        assert!(!BrokerError::InvalidSymbol("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_position_view_caches_until_invalidated() {
        let paper = Arc::new(PaperBroker::new("DEMO", vec![("AAPL".into(), dec!(10))]));
        let mut view = PositionView::new(
            paper.clone(),
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_secs(1)),
        );

        assert_eq!(view.position("AAPL").await.unwrap(), dec!(10));
        paper.set_position("AAPL", dec!(3)).await;
        assert_eq!(view.position("AAPL").await.unwrap(), dec!(10));

        view.invalidate("AAPL");
        assert_eq!(view.position("AAPL").await.unwrap(), dec!(3));

        paper.set_position("AAPL", dec!(1)).await;
        view.clear();
        assert_eq!(view.position("AAPL").await.unwrap(), dec!(1));
    }
}
