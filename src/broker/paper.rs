//! Simulated broker for demo mode. Entries fill immediately; bracket exits stay working.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Broker, BrokerError};
use crate::models::{
    BracketAck, BracketOrder, OpenOrder, OrderAck, Side, SingleOrder, TradeStatus,
};

#[derive(Debug, Clone)]
struct PaperOrder {
    ticker: String,
    side: Side,
    status: TradeStatus,
    parent_id: Option<String>,
}

#[derive(Debug, Default)]
struct PaperState {
    positions: HashMap<String, Decimal>,
    orders: HashMap<String, PaperOrder>,
}

pub struct PaperBroker {
    account: String,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(account: impl Into<String>, positions: Vec<(String, Decimal)>) -> Self {
        let positions = positions
            .into_iter()
            .map(|(t, q)| (t.to_uppercase(), q))
            .collect();
        Self {
            account: account.into(),
            state: Mutex::new(PaperState {
                positions,
                orders: HashMap::new(),
            }),
        }
    }

    pub async fn set_position(&self, ticker: &str, quantity: Decimal) {
        self.state
            .lock()
            .await
            .positions
            .insert(ticker.to_uppercase(), quantity);
    }

    fn new_order_id() -> String {
        format!("PAPER-{}", Uuid::new_v4())
    }

    fn check_account(&self, order: &SingleOrder) -> Result<(), BrokerError> {
        if order.account != self.account {
            return Err(BrokerError::Rejected(format!(
                "order for account {} sent to paper account {}",
                order.account, self.account
            )));
        }
        if order.quantity <= Decimal::ZERO {
            return Err(BrokerError::Rejected(format!(
                "quantity must be positive, got {}",
                order.quantity
            )));
        }
        Ok(())
    }
}

/// Apply an immediate fill. Sells beyond the held quantity are refused.
fn fill(state: &mut PaperState, order: &SingleOrder) -> Result<(), BrokerError> {
    let held = state
        .positions
        .get(&order.ticker)
        .copied()
        .unwrap_or(Decimal::ZERO);
    let next = match order.side {
        Side::Buy => held + order.quantity,
        Side::Sell => {
            if order.quantity > held {
                return Err(BrokerError::Rejected(format!(
                    "paper account holds {held} {}, cannot sell {}",
                    order.ticker, order.quantity
                )));
            }
            held - order.quantity
        }
    };
    state.positions.insert(order.ticker.clone(), next);
    Ok(())
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn position(&self, ticker: &str) -> Result<Decimal, BrokerError> {
        let state = self.state.lock().await;
        Ok(state
            .positions
            .get(&ticker.to_uppercase())
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn place_order(&self, order: &SingleOrder) -> Result<OrderAck, BrokerError> {
        self.check_account(order)?;
        let mut state = self.state.lock().await;
        fill(&mut state, order)?;

        let order_id = Self::new_order_id();
        state.orders.insert(
            order_id.clone(),
            PaperOrder {
                ticker: order.ticker.clone(),
                side: order.side,
                status: TradeStatus::Filled,
                parent_id: None,
            },
        );
        tracing::info!(
            %order_id,
            ticker = %order.ticker,
            side = %order.side,
            quantity = %order.quantity,
            order_type = %order.order_type,
            "Paper order filled"
        );
        Ok(OrderAck {
            order_id,
            status: TradeStatus::Filled,
        })
    }

    async fn place_bracket_order(&self, order: &BracketOrder) -> Result<BracketAck, BrokerError> {
        self.check_account(&order.entry)?;
        let mut state = self.state.lock().await;
        fill(&mut state, &order.entry)?;

        let parent_order_id = Self::new_order_id();
        state.orders.insert(
            parent_order_id.clone(),
            PaperOrder {
                ticker: order.entry.ticker.clone(),
                side: order.entry.side,
                status: TradeStatus::Filled,
                parent_id: None,
            },
        );

        let mut leg_ids = Vec::with_capacity(2);
        for leg in [&order.take_profit, &order.stop_loss] {
            let leg_id = Self::new_order_id();
            state.orders.insert(
                leg_id.clone(),
                PaperOrder {
                    ticker: leg.ticker.clone(),
                    side: leg.side,
                    status: TradeStatus::Pending,
                    parent_id: Some(parent_order_id.clone()),
                },
            );
            leg_ids.push(leg_id);
        }

        tracing::info!(
            %parent_order_id,
            ticker = %order.entry.ticker,
            quantity = %order.entry.quantity,
            take_profit = ?order.take_profit_price(),
            stop_loss = ?order.stop_loss_price(),
            "Paper bracket placed"
        );
        Ok(BracketAck {
            parent_order_id,
            leg_ids,
            status: TradeStatus::Filled,
        })
    }

    async fn order_status(&self, order_id: &str) -> Result<TradeStatus, BrokerError> {
        let state = self.state.lock().await;
        state
            .orders
            .get(order_id)
            .map(|o| o.status)
            .ok_or_else(|| BrokerError::Other(format!("unknown paper order {order_id}")))
    }

    async fn open_orders(&self, ticker: &str) -> Result<Vec<OpenOrder>, BrokerError> {
        let ticker = ticker.to_uppercase();
        let state = self.state.lock().await;
        let mut open: Vec<OpenOrder> = state
            .orders
            .iter()
            .filter(|(_, o)| o.ticker == ticker && o.status == TradeStatus::Pending)
            .map(|(id, o)| OpenOrder {
                order_id: id.clone(),
                ticker: o.ticker.clone(),
                side: o.side,
                parent_id: o.parent_id.clone(),
            })
            .collect();
        open.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        Ok(open)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(order_id) {
            Some(o) if o.status == TradeStatus::Pending => {
                o.status = TradeStatus::Rejected;
                tracing::info!(%order_id, "Paper order cancelled");
                Ok(())
            }
            Some(_) => Err(BrokerError::Rejected(format!("order {order_id} is not working"))),
            None => Err(BrokerError::Other(format!("unknown paper order {order_id}"))),
        }
    }
}
