use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::ApiResponse;
use crate::services::audit::{AuditEvent, RECENT_CAPACITY};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    pub limit: Option<usize>,
}

/// GET /api/audit/recent?limit=N: newest first.
pub async fn recent(
    State(state): State<AppState>,
    Query(params): Query<RecentParams>,
) -> Json<ApiResponse<Vec<AuditEvent>>> {
    let limit = params.limit.unwrap_or(50).min(RECENT_CAPACITY);
    Json(ApiResponse::ok(state.audit.recent(limit)))
}
