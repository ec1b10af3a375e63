use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use super::ApiResponse;
use crate::errors::AppError;
use crate::ledger::{LedgerSnapshot, TickerSummary};
use crate::models::BotTrade;
use crate::AppState;

/// GET /api/positions: latest ledger snapshot published by the worker.
pub async fn list(State(state): State<AppState>) -> Json<ApiResponse<LedgerSnapshot>> {
    let snapshot = state.ledger.borrow().clone();
    Json(ApiResponse::ok(snapshot))
}

#[derive(Serialize)]
pub struct TickerDetail {
    pub summary: TickerSummary,
    pub open_entries: Vec<BotTrade>,
}

/// GET /api/positions/:ticker
pub async fn detail(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
) -> Result<Json<ApiResponse<TickerDetail>>, AppError> {
    let ticker = ticker.to_uppercase();
    let snapshot = state.ledger.borrow();
    let summary = snapshot
        .summary
        .iter()
        .find(|s| s.ticker == ticker)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("no ledger entries for {ticker}")))?;
    let open_entries = snapshot.open.get(&ticker).cloned().unwrap_or_default();
    Ok(Json(ApiResponse::ok(TickerDetail {
        summary,
        open_entries,
    })))
}
