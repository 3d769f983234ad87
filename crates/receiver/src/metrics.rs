//! Prometheus metrics for the upload receiver

use prometheus::{register_int_counter, IntCounter};
use std::sync::OnceLock;

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ReceiverMetricsInner> = OnceLock::new();

struct ReceiverMetricsInner {
    uploads: IntCounter,
    upload_failures: IntCounter,
    bytes_received: IntCounter,
}

impl ReceiverMetricsInner {
    fn new() -> Self {
        Self {
            uploads: register_int_counter!(
                "upload_receiver_uploads_total",
                "Number of uploads stored successfully"
            )
            .expect("Failed to register uploads_total"),

            upload_failures: register_int_counter!(
                "upload_receiver_upload_failures_total",
                "Number of uploads rejected or failed"
            )
            .expect("Failed to register upload_failures_total"),

            bytes_received: register_int_counter!(
                "upload_receiver_bytes_received_total",
                "Bytes stored from successful uploads"
            )
            .expect("Failed to register bytes_received_total"),
        }
    }
}

/// Cheap handle to the process-wide receiver metrics
#[derive(Clone, Copy)]
pub struct ReceiverMetrics {
    inner: &'static ReceiverMetricsInner,
}

impl Default for ReceiverMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverMetrics {
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(ReceiverMetricsInner::new),
        }
    }

    pub fn record_upload(&self, bytes: usize) {
        self.inner.uploads.inc();
        self.inner.bytes_received.inc_by(bytes as u64);
    }

    pub fn record_failure(&self) {
        self.inner.upload_failures.inc();
    }

    pub fn uploads(&self) -> u64 {
        self.inner.uploads.get()
    }

    pub fn upload_failures(&self) -> u64 {
        self.inner.upload_failures.get()
    }
}
