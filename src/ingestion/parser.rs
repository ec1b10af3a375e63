//! Alert text → [`TradeSignal`].
//!
//! The body carries one narrative sentence with the fill:
//!
//! ```text
//! BUY Signal Activated order buy @ 100242 for 12.264199 filled on BTCUSD at 2025-11-07T12:00:00Z
//! ```
//!
//! Stop-loss / take-profit percentages come from two places. The subject may end with
//! `3%SL 5%TP`; the body header may carry a positional parameter group such as
//! `ECP nSkew SL TP v3 (, 14, 70, -30, 5, 1)` whose 4th and 5th values are the
//! percentages. Body values win over subject values.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{Side, SlTpSource, TradeSignal};

static TRADE_SENTENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)order\s+(\w+)\s+@\s+(\S+)\s+for\s+(\S+)\s+filled\s+on\s+([A-Za-z0-9._:\-]+)\s+at\s+(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z)",
    )
    .expect("trade sentence regex")
});

static SUBJECT_SL_TP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)%\s*SL\s+(\d+(?:\.\d+)?)%\s*TP\s*$")
        .expect("subject SL/TP regex")
});

// First parenthesised group made of at least five numbers, optionally led by an empty slot.
static BODY_PARAMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\s*,?\s*((?:[+-]?\d+(?:\.\d+)?\s*,\s*){4,}[+-]?\d+(?:\.\d+)?)\s*\)")
        .expect("body parameter regex")
});

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("body does not contain an order sentence: {excerpt}")]
    NoTradeSentence { excerpt: String },

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("invalid {field} '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: Decimal },

    #[error("invalid event timestamp '{0}'")]
    InvalidTimestamp(String),
}

impl ParseError {
    /// Stable reason code for the audit trail.
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::NoTradeSentence { .. } => "no_trade_sentence",
            ParseError::UnknownAction(_) => "unknown_action",
            ParseError::InvalidNumber { .. } => "invalid_number",
            ParseError::NonPositive { .. } => "non_positive",
            ParseError::InvalidTimestamp(_) => "invalid_timestamp",
        }
    }
}

/// Which of the 4th/5th body parameters is the take-profit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyParamOrder {
    /// 4th = take-profit, 5th = stop-loss.
    #[default]
    TpSl,
    /// 4th = stop-loss, 5th = take-profit.
    SlTp,
}

impl BodyParamOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "tp_sl" | "tpsl" => Some(BodyParamOrder::TpSl),
            "sl_tp" | "sltp" => Some(BodyParamOrder::SlTp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignalParser {
    body_order: BodyParamOrder,
}

impl SignalParser {
    pub fn new(body_order: BodyParamOrder) -> Self {
        Self { body_order }
    }

    /// Parse one alert. Mandatory fields all come from the body sentence.
    pub fn parse(&self, subject: &str, body: &str) -> Result<TradeSignal, ParseError> {
        let caps = TRADE_SENTENCE
            .captures(body)
            .ok_or_else(|| ParseError::NoTradeSentence {
                excerpt: body.chars().take(200).collect(),
            })?;

        let action = Side::from_alert_str(&caps[1])
            .ok_or_else(|| ParseError::UnknownAction(caps[1].to_string()))?;
        let price = positive_decimal("price", &caps[2])?;
        let quantity = positive_decimal("quantity", &caps[3])?;
        let ticker = caps[4].to_uppercase();
        let event_timestamp = DateTime::parse_from_rfc3339(&caps[5])
            .map_err(|_| ParseError::InvalidTimestamp(caps[5].to_string()))?
            .with_timezone(&Utc);

        let (sl_pct, tp_pct, source_of_sl_tp) =
            match (self.sl_tp_from_body(body), sl_tp_from_subject(subject)) {
                (Some((sl, tp)), subject_pair) => {
                    if let Some((s_sl, s_tp)) = subject_pair {
                        tracing::info!(
                            body_sl = %sl, body_tp = %tp, subject_sl = %s_sl, subject_tp = %s_tp,
                            "SL/TP in both subject and body, using body"
                        );
                    }
                    (Some(sl), Some(tp), SlTpSource::Body)
                }
                (None, Some((sl, tp))) => (Some(sl), Some(tp), SlTpSource::Subject),
                (None, None) => {
                    tracing::warn!(%ticker, "No SL/TP found in subject or body");
                    (None, None, SlTpSource::None)
                }
            };

        let signal = TradeSignal {
            ticker,
            action,
            price,
            quantity,
            event_timestamp,
            sl_pct,
            tp_pct,
            source_of_sl_tp,
        };

        tracing::debug!(%signal, "Parsed trade signal");
        Ok(signal)
    }

    /// `(sl_pct, tp_pct)` from the body's positional parameter group.
    fn sl_tp_from_body(&self, body: &str) -> Option<(Decimal, Decimal)> {
        let caps = BODY_PARAMS.captures(body)?;
        let values: Vec<Decimal> = caps[1]
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(Decimal::from_str)
            .collect::<Result<_, _>>()
            .ok()?;

        let (fourth, fifth) = (*values.get(3)?, *values.get(4)?);
        let (tp, sl) = match self.body_order {
            BodyParamOrder::TpSl => (fourth, fifth),
            BodyParamOrder::SlTp => (fifth, fourth),
        };

        if sl <= Decimal::ZERO || tp <= Decimal::ZERO {
            tracing::warn!(%sl, %tp, "Body SL/TP parameters not positive, ignoring");
            return None;
        }
        Some((sl, tp))
    }
}

/// `(sl_pct, tp_pct)` from trailing `N%SL M%TP` subject tokens.
fn sl_tp_from_subject(subject: &str) -> Option<(Decimal, Decimal)> {
    let caps = SUBJECT_SL_TP.captures(subject.trim())?;
    let sl = Decimal::from_str(&caps[1]).ok()?;
    let tp = Decimal::from_str(&caps[2]).ok()?;
    if sl <= Decimal::ZERO || tp <= Decimal::ZERO {
        return None;
    }
    Some((sl, tp))
}

fn positive_decimal(field: &'static str, raw: &str) -> Result<Decimal, ParseError> {
    let value = Decimal::from_str(raw).map_err(|_| ParseError::InvalidNumber {
        field,
        value: raw.to_string(),
    })?;
    if value <= Decimal::ZERO {
        return Err(ParseError::NonPositive { field, value });
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
