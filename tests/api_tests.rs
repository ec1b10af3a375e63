mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use rust_decimal_macros::dec;
use tokio::sync::watch;
use tower::ServiceExt;

use edgebot::api::router::create_router;
use edgebot::ledger::{LedgerSnapshot, PositionLedger};
use edgebot::models::{BotTrade, TradeStatus};
use edgebot::services::audit::{AuditEvent, AuditLog};
use edgebot::services::scheduler::ControlFlags;
use edgebot::AppState;

fn build_test_app(token: Option<&str>, snapshot: LedgerSnapshot) -> (axum::Router, Arc<AuditLog>) {
    let dir = tempfile::tempdir().unwrap();
    let extra: Vec<(&str, &str)> = token.map(|t| vec![("API_TOKEN", t)]).unwrap_or_default();
    let config = common::test_config(dir.path(), &extra);
    let (_tx, rx) = watch::channel(snapshot);
    let audit = Arc::new(AuditLog::in_memory());

    let state = AppState {
        config,
        metrics_handle: edgebot::metrics::init_metrics(),
        ledger: rx,
        audit: audit.clone(),
        flags: ControlFlags::default(),
        started_at: Utc::now(),
    };
    (create_router(state), audit)
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let resp = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn snapshot_with_aapl() -> LedgerSnapshot {
    let mut ledger = PositionLedger::in_memory();
    ledger
        .record_open(BotTrade::open_buy("A1", "AAPL", dec!(10), dec!(190), TradeStatus::Filled, None, None))
        .unwrap();
    ledger.snapshot()
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = build_test_app(None, LedgerSnapshot::default());
    let (status, json) = get_json(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["safe_mode"], false);
}

#[tokio::test]
async fn test_health_reports_safe_mode() {
    let snapshot = LedgerSnapshot {
        safe_mode: true,
        ..LedgerSnapshot::default()
    };
    let (app, _) = build_test_app(None, snapshot);
    let (status, json) = get_json(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "degraded");
}

#[tokio::test]
async fn test_positions_lists_snapshot() {
    let (app, _) = build_test_app(None, snapshot_with_aapl());
    let (status, json) = get_json(app, "/api/positions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["total_trades"], 1);
    assert_eq!(json["data"]["summary"][0]["ticker"], "AAPL");
}

#[tokio::test]
async fn test_position_detail_and_missing_ticker() {
    let (app, _) = build_test_app(None, snapshot_with_aapl());
    let (status, json) = get_json(app.clone(), "/api/positions/aapl").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["open_entries"][0]["order_id"], "A1");

    let (status, json) = get_json(app, "/api/positions/TSLA").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_audit_recent_newest_first() {
    let (app, audit) = build_test_app(None, LedgerSnapshot::default());
    audit.record(AuditEvent::failed(None, "parse_error", "first", "src"));
    audit.record(AuditEvent::failed(None, "parse_error", "second", "src"));

    let (status, json) = get_json(app, "/api/audit/recent?limit=1").await;
    assert_eq!(status, StatusCode::OK);
    let events = json["data"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["message"], "second");
}

#[tokio::test]
async fn test_protected_routes_require_token() {
    let (app, _) = build_test_app(Some("s3cret"), LedgerSnapshot::default());

    let (status, _) = get_json(app.clone(), "/api/positions").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/positions")
                .header("authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/positions")
                .header("authorization", "Bearer s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Health stays public.
    let (status, _) = get_json(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _) = build_test_app(None, LedgerSnapshot::default());
    let resp = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("alerts_received_total"));
}
