use std::sync::OnceLock;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus exporter and register all application metrics.
/// Returns a `PrometheusHandle` whose `render()` method produces the
/// text/plain Prometheus scrape payload. Safe to call more than once.
pub fn init_metrics() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            // Pre-register counters so they appear even before the first increment.
            counter!("alerts_received_total").absolute(0);
            counter!("alerts_parse_failed_total").absolute(0);
            counter!("decisions_allowed_total").absolute(0);
            counter!("decisions_blocked_total").absolute(0);
            counter!("orders_placed_total").absolute(0);
            counter!("orders_failed_total").absolute(0);
            counter!("reconcile_mismatches_total").absolute(0);

            gauge!("ledger_open_tickers").set(0.0);
            gauge!("ledger_safe_mode").set(0.0);

            // Histogram is lazily created on first record; force creation.
            histogram!("message_latency_seconds").record(0.0);

            handle
        })
        .clone()
}
