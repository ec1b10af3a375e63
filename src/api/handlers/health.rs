use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::AppState;

/// Always 200 while the process serves requests; safe mode is reported, not failed.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let safe_mode = state.ledger.borrow().safe_mode;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds();
    (
        StatusCode::OK,
        Json(json!({
            "status": if safe_mode { "degraded" } else { "healthy" },
            "safe_mode": safe_mode,
            "uptime_secs": uptime_secs,
        })),
    )
}
