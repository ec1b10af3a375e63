use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::AppState;

/// POST /api/control/stop: Pause alert processing after the current message.
pub async fn stop(State(state): State<AppState>) -> impl IntoResponse {
    state.flags.paused.store(true, Ordering::SeqCst);
    tracing::warn!("Alert worker PAUSED via control API");
    (StatusCode::OK, Json(json!({ "status": "paused" })))
}

/// POST /api/control/resume
pub async fn resume(State(state): State<AppState>) -> impl IntoResponse {
    state.flags.paused.store(false, Ordering::SeqCst);
    tracing::info!("Alert worker RESUMED via control API");
    (StatusCode::OK, Json(json!({ "status": "running" })))
}

/// POST /api/control/clear-safe-mode: Applied by the worker at its next cycle.
pub async fn clear_safe_mode(State(state): State<AppState>) -> impl IntoResponse {
    if !state.ledger.borrow().safe_mode {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "ledger is not in safe mode" })),
        );
    }
    state.flags.clear_safe_mode.store(true, Ordering::SeqCst);
    tracing::warn!("Safe-mode clear requested via control API");
    (StatusCode::ACCEPTED, Json(json!({ "status": "clear_requested" })))
}

/// GET /api/control/status
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let paused = state.flags.paused.load(Ordering::SeqCst);
    let snapshot = state.ledger.borrow().clone();
    Json(json!({
        "mode": if state.config.is_demo() { "demo" } else { "live" },
        "broker": state.config.broker_mode.as_str(),
        "trade_version": state.config.trade_version.as_str(),
        "account": state.config.account,
        "paused": paused,
        "safe_mode": snapshot.safe_mode,
        "open_tickers": snapshot.summary.iter().filter(|s| !s.open_quantity.is_zero()).count(),
        "total_trades": snapshot.total_trades,
    }))
}
