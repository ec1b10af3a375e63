//! Interactive Brokers Client Portal gateway (REST).
//!
//! The gateway runs locally with a self-signed certificate and an already
//! authenticated session; this client only issues order and portfolio calls.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Broker, BrokerError};
use crate::models::{
    BracketAck, BracketOrder, InstrumentKind, OpenOrder, OrderAck, OrderType, Side, SingleOrder,
    TradeStatus,
};

/// Order warnings the gateway asks us to confirm before it accepts an order.
const MAX_CONFIRMATIONS: usize = 5;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderTicket {
    acct_id: String,
    conid: i64,
    sec_type: String,
    #[serde(rename = "cOID")]
    c_oid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
    order_type: &'static str,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    price: Option<Decimal>,
    side: String,
    #[serde(with = "rust_decimal::serde::float")]
    quantity: Decimal,
    tif: &'static str,
    #[serde(rename = "outsideRTH")]
    outside_rth: bool,
}

#[derive(Debug, Serialize)]
struct OrdersBody {
    orders: Vec<OrderTicket>,
}

#[derive(Debug, Deserialize)]
struct ReplyItem {
    #[serde(default)]
    order_id: Option<Value>,
    #[serde(default)]
    order_status: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message: Option<Vec<String>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SecdefHit {
    #[serde(default)]
    conid: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PositionEntry {
    #[serde(default)]
    position: Decimal,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    order_status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveOrder {
    order_id: Value,
    #[serde(default)]
    ticker: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    status: String,
    #[serde(default, alias = "parent_id")]
    parent_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LiveOrders {
    #[serde(default)]
    orders: Vec<LiveOrder>,
}

pub struct IbkrClient {
    http: Client,
    base_url: String,
    account: String,
    conids: Mutex<HashMap<String, i64>>,
}

impl IbkrClient {
    pub fn new(http: Client, base_url: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            account: account.into(),
            conids: Mutex::new(HashMap::new()),
        }
    }

    /// HTTP client for the local gateway.
    pub fn http_client(accept_invalid_certs: bool, timeout: Duration) -> Result<Client, BrokerError> {
        Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Other(format!("failed to build HTTP client: {e}")))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Contract id for a ticker, cached for the life of the process.
    async fn conid(&self, ticker: &str) -> Result<i64, BrokerError> {
        if let Some(id) = self.conids.lock().await.get(ticker) {
            return Ok(*id);
        }

        let kind = InstrumentKind::for_ticker(ticker);
        let symbol = match kind {
            InstrumentKind::Crypto => ticker.trim_end_matches("USD"),
            InstrumentKind::Stock => ticker,
        };
        let url = self.url(&format!(
            "/iserver/secdef/search?symbol={symbol}&secType={}",
            kind.sec_type()
        ));
        let resp = check(self.http.get(&url).send().await?).await?;
        let hits: Vec<SecdefHit> = resp.json().await.unwrap_or_default();

        let conid = hits
            .iter()
            .find_map(|h| h.conid.as_ref().and_then(value_to_i64))
            .ok_or_else(|| BrokerError::InvalidSymbol(ticker.to_string()))?;

        debug!(%ticker, conid, "Resolved contract id");
        self.conids.lock().await.insert(ticker.to_string(), conid);
        Ok(conid)
    }

    async fn ticket(&self, order: &SingleOrder) -> Result<OrderTicket, BrokerError> {
        let conid = self.conid(&order.ticker).await?;
        let kind = InstrumentKind::for_ticker(&order.ticker);
        let (order_type, price) = match &order.order_type {
            OrderType::Market => ("MKT", None),
            OrderType::Limit { price } => ("LMT", Some(*price)),
            OrderType::Stop { trigger } => ("STP", Some(*trigger)),
        };
        Ok(OrderTicket {
            acct_id: order.account.clone(),
            conid,
            sec_type: format!("{conid}:{}", kind.sec_type()),
            c_oid: order.client_ref.clone(),
            parent_id: order.parent_ref.clone(),
            order_type,
            price,
            side: order.side.to_string(),
            quantity: order.quantity,
            tif: "GTC",
            outside_rth: matches!(order.order_type, OrderType::Limit { .. }) && order.parent_ref.is_none(),
        })
    }

    /// Submit tickets and walk the confirmation prompts until order ids come back.
    async fn submit(&self, tickets: Vec<OrderTicket>) -> Result<Vec<(String, TradeStatus)>, BrokerError> {
        let url = self.url(&format!("/iserver/account/{}/orders", self.account));
        let resp = check(self.http.post(&url).json(&OrdersBody { orders: tickets }).send().await?).await?;
        let mut items: Vec<ReplyItem> = resp.json().await?;

        for _ in 0..MAX_CONFIRMATIONS {
            if let Some(err) = items.iter().find_map(|i| i.error.clone()) {
                return Err(BrokerError::Rejected(err));
            }

            let placed: Vec<(String, TradeStatus)> = items
                .iter()
                .filter_map(|i| {
                    let id = i.order_id.as_ref().and_then(value_to_string)?;
                    let status = i
                        .order_status
                        .as_deref()
                        .map(TradeStatus::from_api_str)
                        .unwrap_or(TradeStatus::Pending);
                    Some((id, status))
                })
                .collect();
            if !placed.is_empty() {
                return Ok(placed);
            }

            let Some(reply) = items.iter().find(|i| i.id.is_some() && i.message.is_some()) else {
                return Err(BrokerError::Other("gateway returned no order id".into()));
            };
            let reply_id = reply.id.clone().unwrap_or_default();
            warn!(
                reply_id = %reply_id,
                message = ?reply.message,
                "Confirming gateway order warning"
            );
            let url = self.url(&format!("/iserver/reply/{reply_id}"));
            let resp = check(
                self.http
                    .post(&url)
                    .json(&serde_json::json!({ "confirmed": true }))
                    .send()
                    .await?,
            )
            .await?;
            items = resp.json().await?;
        }

        Err(BrokerError::Other("too many order confirmation prompts".into()))
    }
}

#[async_trait]
impl Broker for IbkrClient {
    fn name(&self) -> &'static str {
        "ibkr"
    }

    async fn position(&self, ticker: &str) -> Result<Decimal, BrokerError> {
        let conid = self.conid(ticker).await?;
        let url = self.url(&format!("/portfolio/{}/position/{conid}", self.account));
        let resp = check(self.http.get(&url).send().await?).await?;
        let entries: Vec<PositionEntry> = resp.json().await?;
        Ok(entries.iter().map(|e| e.position).sum())
    }

    async fn place_order(&self, order: &SingleOrder) -> Result<OrderAck, BrokerError> {
        let ticket = self.ticket(order).await?;
        let placed = self.submit(vec![ticket]).await?;
        let (order_id, status) = placed
            .into_iter()
            .next()
            .ok_or_else(|| BrokerError::Other("empty order acknowledgement".into()))?;
        info!(%order_id, ticker = %order.ticker, side = %order.side, %status, "IBKR order placed");
        Ok(OrderAck { order_id, status })
    }

    async fn place_bracket_order(&self, order: &BracketOrder) -> Result<BracketAck, BrokerError> {
        let tickets = vec![
            self.ticket(&order.entry).await?,
            self.ticket(&order.take_profit).await?,
            self.ticket(&order.stop_loss).await?,
        ];
        let mut placed = self.submit(tickets).await?.into_iter();
        let (parent_order_id, status) = placed
            .next()
            .ok_or_else(|| BrokerError::Other("empty bracket acknowledgement".into()))?;
        let leg_ids: Vec<String> = placed.map(|(id, _)| id).collect();
        info!(
            %parent_order_id,
            ticker = %order.entry.ticker,
            legs = leg_ids.len(),
            %status,
            "IBKR bracket placed"
        );
        Ok(BracketAck {
            parent_order_id,
            leg_ids,
            status,
        })
    }

    async fn order_status(&self, order_id: &str) -> Result<TradeStatus, BrokerError> {
        let url = self.url(&format!("/iserver/account/order/status/{order_id}"));
        let resp = check(self.http.get(&url).send().await?).await?;
        let body: StatusBody = resp.json().await?;
        if let Some(err) = body.error {
            return Err(BrokerError::Other(err));
        }
        Ok(body
            .order_status
            .as_deref()
            .map(TradeStatus::from_api_str)
            .unwrap_or(TradeStatus::Pending))
    }

    async fn open_orders(&self, ticker: &str) -> Result<Vec<OpenOrder>, BrokerError> {
        let url = self.url("/iserver/account/orders");
        let resp = check(self.http.get(&url).send().await?).await?;
        let live: LiveOrders = resp.json().await?;
        Ok(live
            .orders
            .into_iter()
            .filter(|o| o.ticker.eq_ignore_ascii_case(ticker))
            .filter(|o| !TradeStatus::from_api_str(&o.status).is_final())
            .filter_map(|o| {
                Some(OpenOrder {
                    order_id: value_to_string(&o.order_id)?,
                    ticker: o.ticker.to_uppercase(),
                    side: Side::from_alert_str(&o.side)?,
                    parent_id: o.parent_id.as_ref().and_then(value_to_string),
                })
            })
            .collect())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let url = self.url(&format!("/iserver/account/{}/order/{order_id}", self.account));
        let resp = check(self.http.delete(&url).send().await?).await?;
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if let Some(err) = body.get("error").and_then(Value::as_str) {
            return Err(BrokerError::Rejected(err.to_string()));
        }
        info!(%order_id, "IBKR order cancelled");
        Ok(())
    }
}

/// Map HTTP status to the broker error taxonomy.
async fn check(resp: Response) -> Result<Response, BrokerError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = format!("{status}: {}", body.chars().take(300).collect::<String>());
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => BrokerError::RateLimited(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BrokerError::Unavailable(format!("gateway session not authenticated ({detail})"))
        }
        s if s.is_server_error() => BrokerError::Unavailable(detail),
        _ => BrokerError::Rejected(detail),
    })
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
