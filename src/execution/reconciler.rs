//! Startup (and optional per-cycle) comparison of ledger vs broker holdings.
//!
//! Divergence is reported, never corrected: the ledger is taken by shared reference.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::broker::PositionView;
use crate::ledger::{MismatchReport, PositionLedger};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub checked: Vec<String>,
    pub mismatches: Vec<MismatchReport>,
    /// Tickers whose broker position could not be read, with the error.
    pub errors: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty() && self.errors.is_empty()
    }
}

/// Check every ticker in the ledger or in `configured`.
pub async fn reconcile_all(
    ledger: &PositionLedger,
    broker: &mut PositionView,
    configured: &[String],
) -> ReconcileReport {
    let universe: BTreeSet<String> = ledger
        .tickers()
        .into_iter()
        .chain(configured.iter().map(|t| t.to_uppercase()))
        .collect();

    let mut report = ReconcileReport::default();
    for ticker in universe {
        match broker.position(&ticker).await {
            Ok(broker_quantity) => {
                if let Some(mismatch) = ledger.reconcile(broker_quantity, &ticker) {
                    warn!(
                        %ticker,
                        ledger_quantity = %mismatch.ledger_quantity,
                        broker_quantity = %mismatch.broker_quantity,
                        difference = %mismatch.difference,
                        "Position mismatch, manual review required"
                    );
                    metrics::counter!("reconcile_mismatches_total").increment(1);
                    report.mismatches.push(mismatch);
                }
            }
            Err(e) => {
                warn!(%ticker, error = %e, "Could not read broker position for reconciliation");
                report.errors.push((ticker.clone(), e.to_string()));
            }
        }
        report.checked.push(ticker);
    }

    info!(
        checked = report.checked.len(),
        mismatches = report.mismatches.len(),
        errors = report.errors.len(),
        "Reconciliation finished"
    );
    report
}
