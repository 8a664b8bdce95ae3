//! Prometheus metrics for the broker
//!
//! Provides observability into message handling and link health.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. If another recorder
/// is already installed the failure is logged and metrics are not rendered.
pub fn init_metrics() {
    if PROMETHEUS_HANDLE.get().is_some() {
        return;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_ok() {
                info!("Prometheus metrics initialized");
            }
        }
        Err(e) => warn!(error = %e, "Failed to install Prometheus recorder"),
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Broker metrics helper, labeled by queue
#[derive(Debug, Clone)]
pub struct BrokerMetrics {
    queue: String,
}

impl BrokerMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Record a message being published
    pub fn published(&self, delayed: bool) {
        counter!(
            "broker_messages_published_total",
            "queue" => self.queue.clone(),
            "delayed" => if delayed { "true" } else { "false" }
        )
        .increment(1);
    }

    /// Record a message being received by a worker loop
    pub fn received(&self) {
        counter!("broker_messages_received_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Record a message handled successfully
    pub fn handled(&self, duration: Duration) {
        counter!(
            "broker_messages_handled_total",
            "queue" => self.queue.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "broker_handle_duration_seconds",
            "queue" => self.queue.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a handler failure
    pub fn failed(&self, category: &str) {
        counter!(
            "broker_messages_handled_total",
            "queue" => self.queue.clone(),
            "status" => "failed"
        )
        .increment(1);

        counter!(
            "broker_handler_errors_total",
            "queue" => self.queue.clone(),
            "category" => category.to_string()
        )
        .increment(1);
    }

    /// Record a message requeued for another attempt
    pub fn requeued(&self) {
        counter!("broker_messages_requeued_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Record a message abandoned after its final attempt
    pub fn abandoned(&self) {
        counter!("broker_messages_abandoned_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Record a successful reconnect
    pub fn reconnected(&self) {
        counter!("broker_reconnects_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Update the running worker loop gauge
    pub fn active_workers(&self, count: usize) {
        gauge!("broker_active_workers", "queue" => self.queue.clone()).set(count as f64);
    }
}
