use std::sync::Arc;

use tracing::{info, warn};

use crate::broker::{Broker, BrokerError, RetryPolicy};
use crate::models::{OrderRequest, Side, TradeStatus};

/// Broker acknowledgement of a submitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Entry order id; for brackets the parent id.
    pub order_id: String,
    pub status: TradeStatus,
    pub leg_ids: Vec<String>,
}

/// Outcome of clearing the way for a sell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SellPreparation {
    /// Bracket exit legs that were cancelled.
    pub cancelled: Vec<String>,
    /// Other working sell orders. Non-empty means a sell is already pending.
    pub pending_sells: Vec<String>,
}

/// Submits orders through the retry policy.
pub struct OrderExecutor {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
}

impl OrderExecutor {
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        Self { broker, retry }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub async fn submit(&self, request: &OrderRequest) -> Result<Placement, BrokerError> {
        let broker = self.broker.clone();
        let placement = match request {
            OrderRequest::Single(order) => {
                let ack = self
                    .retry
                    .run("place_order", || {
                        let broker = broker.clone();
                        async move { broker.place_order(order).await }
                    })
                    .await?;
                Placement {
                    order_id: ack.order_id,
                    status: ack.status,
                    leg_ids: Vec::new(),
                }
            }
            OrderRequest::Bracket(bracket) => {
                let ack = self
                    .retry
                    .run("place_bracket_order", || {
                        let broker = broker.clone();
                        async move { broker.place_bracket_order(bracket).await }
                    })
                    .await?;
                Placement {
                    order_id: ack.parent_order_id,
                    status: ack.status,
                    leg_ids: ack.leg_ids,
                }
            }
        };

        info!(
            broker = self.broker.name(),
            order_id = %placement.order_id,
            ticker = %request.ticker(),
            side = %request.side(),
            quantity = %request.quantity(),
            order_type = %request.order_type(),
            bracket = request.is_bracket(),
            status = %placement.status,
            "Order submitted"
        );
        Ok(placement)
    }

    /// Cancel working bracket exits on `ticker` and report any other working sell.
    pub async fn prepare_sell(&self, ticker: &str) -> Result<SellPreparation, BrokerError> {
        let broker = self.broker.clone();
        let open = self
            .retry
            .run("open_orders", || {
                let broker = broker.clone();
                let ticker = ticker.to_string();
                async move { broker.open_orders(&ticker).await }
            })
            .await?;

        let mut prep = SellPreparation::default();
        for order in open.into_iter().filter(|o| o.side == Side::Sell) {
            if !order.is_bracket_exit() {
                prep.pending_sells.push(order.order_id);
                continue;
            }
            let id = order.order_id.clone();
            let result = self
                .retry
                .run("cancel_order", || {
                    let broker = broker.clone();
                    let id = id.clone();
                    async move { broker.cancel_order(&id).await }
                })
                .await;
            match result {
                Ok(()) => {
                    info!(%ticker, order_id = %id, "Cancelled bracket exit before sell");
                    prep.cancelled.push(id);
                }
                Err(e) => {
                    // A leg we cannot cancel may still fill, so treat it as a pending sell.
                    warn!(%ticker, order_id = %id, error = %e, "Failed to cancel bracket exit");
                    prep.pending_sells.push(id);
                }
            }
        }
        Ok(prep)
    }

    pub async fn order_status(&self, order_id: &str) -> Result<TradeStatus, BrokerError> {
        let broker = self.broker.clone();
        self.retry
            .run("order_status", || {
                let broker = broker.clone();
                let id = order_id.to_string();
                async move { broker.order_status(&id).await }
            })
            .await
    }
}
