//! Append-only trail of every trading decision.
//!
//! Each event is one JSON line in the audit file. The newest events are also kept in
//! memory for the operator API. A failing write is logged and trading continues.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::{Decision, Verdict};
use crate::models::{Side, TradeSignal};

pub const RECENT_CAPACITY: usize = 200;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Allowed,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub outcome: AuditOutcome,
    pub reason: String,
    pub message: String,
    pub ticker: Option<String>,
    pub action: Option<Side>,
    pub requested_quantity: Option<Decimal>,
    pub broker_quantity: Option<Decimal>,
    pub ledger_quantity: Option<Decimal>,
    pub validated_quantity: Option<Decimal>,
    pub order_id: Option<String>,
    pub source: String,
}

impl AuditEvent {
    /// A validator decision. Allowed decisions carry the order id once placed.
    pub fn decision(
        signal: &TradeSignal,
        decision: &Decision,
        order_id: Option<String>,
        source: &str,
    ) -> Self {
        Self {
            at: Utc::now(),
            outcome: match decision.verdict {
                Verdict::Allow => AuditOutcome::Allowed,
                Verdict::Block => AuditOutcome::Blocked,
            },
            reason: decision.reason.code().to_string(),
            message: decision.message.clone(),
            ticker: Some(signal.ticker.clone()),
            action: Some(signal.action),
            requested_quantity: Some(decision.requested_quantity),
            broker_quantity: decision.broker_quantity,
            ledger_quantity: decision.ledger_quantity,
            validated_quantity: Some(decision.validated_quantity),
            order_id,
            source: source.to_string(),
        }
    }

    /// Anything that stopped a message before or after the validator.
    pub fn failed(
        signal: Option<&TradeSignal>,
        reason: &str,
        message: impl Into<String>,
        source: &str,
    ) -> Self {
        Self {
            at: Utc::now(),
            outcome: AuditOutcome::Failed,
            reason: reason.to_string(),
            message: message.into(),
            ticker: signal.map(|s| s.ticker.clone()),
            action: signal.map(|s| s.action),
            requested_quantity: signal.map(|s| s.quantity),
            broker_quantity: None,
            ledger_quantity: None,
            validated_quantity: None,
            order_id: None,
            source: source.to_string(),
        }
    }

    pub fn with_decision_quantities(mut self, decision: &Decision) -> Self {
        self.broker_quantity = decision.broker_quantity;
        self.ledger_quantity = decision.ledger_quantity;
        self.validated_quantity = Some(decision.validated_quantity);
        self
    }
}

#[derive(Debug)]
pub struct AuditLog {
    path: Option<PathBuf>,
    recent: Mutex<VecDeque<AuditEvent>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        }
    }

    /// Memory-only trail.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        }
    }

    pub fn record(&self, event: AuditEvent) {
        match event.outcome {
            AuditOutcome::Allowed => tracing::info!(
                reason = %event.reason,
                ticker = ?event.ticker,
                order_id = ?event.order_id,
                "Audit: {}", event.message
            ),
            AuditOutcome::Blocked | AuditOutcome::Failed => tracing::warn!(
                outcome = ?event.outcome,
                reason = %event.reason,
                ticker = ?event.ticker,
                "Audit: {}", event.message
            ),
        }

        if let Err(e) = self.append(&event) {
            tracing::error!(error = %e, "Failed to write audit event");
        }

        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(event);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent.iter().rev().take(limit).cloned().collect()
    }

    fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::decide;
    use crate::models::SlTpSource;
    use rust_decimal_macros::dec;

    fn sell() -> TradeSignal {
        TradeSignal {
            ticker: "AAPL".into(),
            action: Side::Sell,
            price: dec!(190),
            quantity: dec!(5),
            event_timestamp: Utc::now(),
            sl_pct: None,
            tp_pct: None,
            source_of_sl_tp: SlTpSource::None,
        }
    }

    #[test]
    fn test_events_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("position_safety.jsonl");
        let log = AuditLog::new(&path);

        let blocked = decide(&sell(), dec!(0), dec!(10), false);
        log.record(AuditEvent::decision(&sell(), &blocked, None, "src"));
        log.record(AuditEvent::failed(None, "parse_error", "no order sentence", "src"));

        let raw = fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditEvent> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].outcome, AuditOutcome::Blocked);
        assert_eq!(lines[0].reason, "no_bot_owned_position");
        assert_eq!(lines[0].broker_quantity, Some(dec!(10)));
        assert_eq!(lines[1].outcome, AuditOutcome::Failed);
    }

    #[test]
    fn test_recent_ring_is_bounded_newest_first() {
        let log = AuditLog::in_memory();
        for i in 0..(RECENT_CAPACITY + 5) {
            log.record(AuditEvent::failed(None, "x", format!("event {i}"), ""));
        }
        let recent = log.recent(1000);
        assert_eq!(recent.len(), RECENT_CAPACITY);
        assert_eq!(recent[0].message, format!("event {}", RECENT_CAPACITY + 4));
        assert_eq!(log.recent(3).len(), 3);
    }

    #[test]
    fn test_unwritable_path_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        // The audit path is a directory, so every append fails.
        let log = AuditLog::new(dir.path());
        log.record(AuditEvent::failed(None, "x", "still recorded in memory", ""));
        assert_eq!(log.recent(10).len(), 1);
    }
}
