//! Prometheus counters for the book and order paths
//!
//! Registered once in the process-wide default registry, which the binary
//! exposes at `/metrics`.

use prometheus::{IntCounterVec, Opts};
use std::sync::OnceLock;
use tracing::warn;

pub struct Metrics {
    depth_events: IntCounterVec,
    snapshots: IntCounterVec,
    best_depth_published: IntCounterVec,
    orders: IntCounterVec,
    stop_orders: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Process-wide metrics handle
pub fn global() -> &'static Metrics {
    METRICS.get_or_init(Metrics::register)
}

fn counter(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)
        .expect("metric definitions are static and valid");
    if let Err(e) = prometheus::register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric");
    }
    counter
}

impl Metrics {
    fn register() -> Self {
        Self {
            depth_events: counter(
                "sequex_depth_events_total",
                "Depth diff events by reconciliation outcome",
                &["symbol", "outcome"],
            ),
            snapshots: counter(
                "sequex_snapshots_total",
                "Depth snapshot fetches",
                &["symbol", "result"],
            ),
            best_depth_published: counter(
                "sequex_best_depth_published_total",
                "Best bid/ask ticks published to subscribers",
                &["symbol"],
            ),
            orders: counter(
                "sequex_orders_total",
                "Order submissions",
                &["account", "kind", "result"],
            ),
            stop_orders: counter(
                "sequex_stop_orders_total",
                "Stop-market watcher transitions",
                &["account", "outcome"],
            ),
        }
    }

    pub fn depth_event(&self, symbol: &str, outcome: &str) {
        self.depth_events.with_label_values(&[symbol, outcome]).inc();
    }

    pub fn snapshot(&self, symbol: &str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.snapshots.with_label_values(&[symbol, result]).inc();
    }

    pub fn best_depth_published(&self, symbol: &str) {
        self.best_depth_published.with_label_values(&[symbol]).inc();
    }

    pub fn order(&self, account: &str, kind: &str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.orders.with_label_values(&[account, kind, result]).inc();
    }

    pub fn stop_order(&self, account: &str, outcome: &str) {
        self.stop_orders.with_label_values(&[account, outcome]).inc();
    }

    pub fn snapshot_count(&self, symbol: &str, ok: bool) -> u64 {
        let result = if ok { "ok" } else { "error" };
        self.snapshots.with_label_values(&[symbol, result]).get()
    }
}
