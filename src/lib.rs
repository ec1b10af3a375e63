pub mod api;
pub mod broker;
pub mod config;
pub mod errors;
pub mod execution;
pub mod ingestion;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod services;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::config::AppConfig;
use crate::ledger::LedgerSnapshot;
use crate::services::audit::AuditLog;
use crate::services::scheduler::ControlFlags;

/// Read side shared with the operator API. The worker owns all writes.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    pub ledger: watch::Receiver<LedgerSnapshot>,
    pub audit: Arc<AuditLog>,
    pub flags: ControlFlags,
    pub started_at: DateTime<Utc>,
}
