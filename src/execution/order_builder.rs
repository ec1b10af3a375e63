//! Authorized signal → concrete order request.

use rust_decimal::Decimal;
use uuid::Uuid;

use super::ExecutionError;
use crate::models::{BracketOrder, OrderRequest, OrderType, Side, SingleOrder, TradeSignal};

/// What to do when a bracket is wanted but the signal lacks SL or TP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingSlTpPolicy {
    /// Fall back to a plain entry order.
    #[default]
    PlainOrder,
    /// Refuse the signal.
    Reject,
}

impl MissingSlTpPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "plain" | "plain_order" => Some(MissingSlTpPolicy::PlainOrder),
            "reject" => Some(MissingSlTpPolicy::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub account: String,
    /// Buys with SL/TP become brackets.
    pub use_brackets: bool,
    pub missing_sl_tp: MissingSlTpPolicy,
    pub price_decimals: u32,
}

impl BuilderConfig {
    pub fn new(account: impl Into<String>, use_brackets: bool) -> Self {
        Self {
            account: account.into(),
            use_brackets,
            missing_sl_tp: MissingSlTpPolicy::PlainOrder,
            price_decimals: 2,
        }
    }
}

/// Build the order for an authorized signal.
///
/// Entries are market orders during the regular session and limit orders at the
/// alert price outside it. Sells never carry bracket legs.
pub fn build(
    signal: &TradeSignal,
    validated_quantity: Decimal,
    market_open: bool,
    config: &BuilderConfig,
) -> Result<OrderRequest, ExecutionError> {
    if validated_quantity <= Decimal::ZERO {
        return Err(ExecutionError::InvalidQuantity(validated_quantity));
    }

    let price = signal.price.round_dp(config.price_decimals);
    let entry_type = if market_open {
        OrderType::Market
    } else {
        tracing::info!(
            ticker = %signal.ticker,
            event_timestamp = %signal.event_timestamp,
            "Outside regular hours, using limit order"
        );
        OrderType::Limit { price }
    };

    let client_ref = format!("edge-{}", Uuid::new_v4().simple());
    let entry = SingleOrder {
        client_ref: client_ref.clone(),
        parent_ref: None,
        oca_group: None,
        account: config.account.clone(),
        ticker: signal.ticker.clone(),
        side: signal.action,
        quantity: validated_quantity,
        order_type: entry_type,
    };

    if signal.action == Side::Sell || !config.use_brackets {
        return Ok(OrderRequest::Single(entry));
    }

    let (Some(sl_pct), Some(tp_pct)) = (signal.sl_pct, signal.tp_pct) else {
        return match config.missing_sl_tp {
            MissingSlTpPolicy::PlainOrder => {
                tracing::warn!(ticker = %signal.ticker, "SL/TP missing, placing plain order");
                Ok(OrderRequest::Single(entry))
            }
            MissingSlTpPolicy::Reject => Err(ExecutionError::MissingSlTp {
                ticker: signal.ticker.clone(),
            }),
        };
    };

    let hundred = Decimal::ONE_HUNDRED;
    let take_profit_price =
        (price * (Decimal::ONE + tp_pct / hundred)).round_dp(config.price_decimals);
    let stop_loss_price =
        (price * (Decimal::ONE - sl_pct / hundred)).round_dp(config.price_decimals);
    if stop_loss_price <= Decimal::ZERO {
        return Err(ExecutionError::InvalidPrice {
            leg: "stop_loss",
            price: stop_loss_price,
        });
    }

    let oca_group = format!("oca-{client_ref}");
    let exit = |suffix: &str, order_type: OrderType| SingleOrder {
        client_ref: format!("{client_ref}-{suffix}"),
        parent_ref: Some(client_ref.clone()),
        oca_group: Some(oca_group.clone()),
        account: config.account.clone(),
        ticker: signal.ticker.clone(),
        side: Side::Sell,
        quantity: validated_quantity,
        order_type,
    };

    Ok(OrderRequest::Bracket(BracketOrder {
        take_profit: exit("tp", OrderType::Limit { price: take_profit_price }),
        stop_loss: exit("sl", OrderType::Stop { trigger: stop_loss_price }),
        entry,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::parser::SignalParser;
    use crate::models::SlTpSource;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn signal(action: Side, sl: Option<Decimal>, tp: Option<Decimal>) -> TradeSignal {
        TradeSignal {
            ticker: "AAPL".into(),
            action,
            price: dec!(187.256),
            quantity: dec!(10),
            event_timestamp: Utc::now(),
            sl_pct: sl,
            tp_pct: tp,
            source_of_sl_tp: SlTpSource::Subject,
        }
    }

    #[test]
    fn test_end_to_end_bracket_prices() {
        let parsed = SignalParser::default()
            .parse(
                "Alert: Top Overall 15M BTCUSD nSkew v3 3%SL 5%TP",
                "Top Overall 15M: BUY Signal Activated order buy @ 100242 for 12.264199 \
                 filled on BTCUSD at 2025-11-07T12:00:00Z",
            )
            .unwrap();
        let config = BuilderConfig::new("DEMO", true);

        let order = build(&parsed, parsed.quantity, true, &config).unwrap();
        let OrderRequest::Bracket(bracket) = order else {
            panic!("expected bracket");
        };
        assert_eq!(bracket.take_profit_price(), Some(dec!(105254.1)));
        assert_eq!(bracket.stop_loss_price(), Some(dec!(97234.74)));
        assert_eq!(bracket.entry.order_type, OrderType::Market);
        assert_eq!(bracket.entry.quantity, dec!(12.264199));
        assert_eq!(bracket.take_profit.side, Side::Sell);
        assert_eq!(bracket.take_profit.parent_ref.as_deref(), Some(bracket.entry.client_ref.as_str()));
        assert_eq!(bracket.stop_loss.oca_group, bracket.take_profit.oca_group);
    }

    #[test]
    fn test_outside_hours_uses_limit_at_rounded_price() {
        let config = BuilderConfig::new("DEMO", false);
        let order = build(&signal(Side::Buy, None, None), dec!(10), false, &config).unwrap();
        assert_eq!(order.order_type(), &OrderType::Limit { price: dec!(187.26) });
        assert!(!order.is_bracket());
    }

    #[test]
    fn test_version_a_never_brackets() {
        let config = BuilderConfig::new("DEMO", false);
        let order = build(&signal(Side::Buy, Some(dec!(3)), Some(dec!(5))), dec!(10), true, &config)
            .unwrap();
        assert!(!order.is_bracket());
        assert_eq!(order.order_type(), &OrderType::Market);
    }

    #[test]
    fn test_sell_never_brackets() {
        let config = BuilderConfig::new("DEMO", true);
        let order = build(&signal(Side::Sell, Some(dec!(3)), Some(dec!(5))), dec!(4), true, &config)
            .unwrap();
        assert!(!order.is_bracket());
        assert_eq!(order.side(), Side::Sell);
        assert_eq!(order.quantity(), dec!(4));
    }

    #[test]
    fn test_missing_sl_tp_policy() {
        let mut config = BuilderConfig::new("DEMO", true);
        let order = build(&signal(Side::Buy, Some(dec!(3)), None), dec!(10), true, &config).unwrap();
        assert!(!order.is_bracket());

        config.missing_sl_tp = MissingSlTpPolicy::Reject;
        let err = build(&signal(Side::Buy, None, None), dec!(10), true, &config).unwrap_err();
        assert!(matches!(err, ExecutionError::MissingSlTp { .. }));
    }

    #[test]
    fn test_rejects_zero_quantity_and_absurd_stop() {
        let config = BuilderConfig::new("DEMO", true);
        assert!(matches!(
            build(&signal(Side::Buy, None, None), dec!(0), true, &config),
            Err(ExecutionError::InvalidQuantity(_))
        ));
        assert!(matches!(
            build(&signal(Side::Buy, Some(dec!(100)), Some(dec!(5))), dec!(1), true, &config),
            Err(ExecutionError::InvalidPrice { .. })
        ));
    }
}
