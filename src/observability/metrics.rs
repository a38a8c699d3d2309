//! Metrics collection and exposition.
//!
//! # Metrics
//! - `listener_reloads_total` (counter): successful reloads by mode
//! - `listener_serving_sockets` (gauge): sockets currently accepting
//! - `listener_handshake_rejections_total` (counter): aborted TLS handshakes by reason
//! - `reconcile_events_total` (counter): configuration events by outcome
//! - `acme_issuance_total` (counter): certificate orders by outcome
//!
//! Recording is a no-op until [`init_metrics`] installs the exporter.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter, serving scrapes on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_listener_reload(mode: &'static str) {
    counter!("listener_reloads_total", "mode" => mode).increment(1);
}

pub fn set_serving_sockets(count: usize) {
    gauge!("listener_serving_sockets").set(count as f64);
}

pub fn record_handshake_rejection(reason: &'static str) {
    counter!("listener_handshake_rejections_total", "reason" => reason).increment(1);
}

pub fn record_reconcile_event(outcome: &'static str) {
    counter!("reconcile_events_total", "outcome" => outcome).increment(1);
}

pub fn record_acme_issuance(outcome: &'static str) {
    counter!("acme_issuance_total", "outcome" => outcome).increment(1);
}
