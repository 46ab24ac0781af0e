//! Client-side metrics collection

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide client counters
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Producer metrics
    pub messages_published: AtomicU64,
    pub bytes_published: AtomicU64,
    pub publish_errors: AtomicU64,

    // Consumer metrics
    pub messages_consumed: AtomicU64,
    pub bytes_consumed: AtomicU64,
    pub messages_finished: AtomicU64,
    pub messages_requeued: AtomicU64,
    pub handler_errors: AtomicU64,

    // Connection metrics
    pub connections_created: AtomicU64,
    pub connections_failed: AtomicU64,
    pub connection_errors: AtomicU64,
}

impl ClientMetrics {
    pub fn record_publish(&self, byte_count: u64) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consume(&self, byte_count: u64) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
        self.bytes_consumed.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn record_finish(&self) {
        self.messages_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.messages_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
            bytes_consumed: self.bytes_consumed.load(Ordering::Relaxed),
            messages_finished: self.messages_finished.load(Ordering::Relaxed),
            messages_requeued: self.messages_requeued.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of counters at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub bytes_published: u64,
    pub publish_errors: u64,
    pub messages_consumed: u64,
    pub bytes_consumed: u64,
    pub messages_finished: u64,
    pub messages_requeued: u64,
    pub handler_errors: u64,
    pub connections_created: u64,
    pub connections_failed: u64,
    pub connection_errors: u64,
}

/// Global metrics instance
static GLOBAL_METRICS: once_cell::sync::Lazy<Arc<ClientMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(ClientMetrics::default()));

/// Get the global metrics instance
pub fn global_metrics() -> Arc<ClientMetrics> {
    GLOBAL_METRICS.clone()
}
