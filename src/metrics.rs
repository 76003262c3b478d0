use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for streaming delivery and heartbeat health
///
/// Thread-safe atomic counters shared by heartbeat workers and invocations.
#[derive(Default)]
pub struct StreamMetrics {
    /// Frames pushed to clients (heartbeats excluded)
    pub frames_delivered: AtomicU64,

    /// Keep-alive heartbeats sent
    pub keep_alives_sent: AtomicU64,

    /// Processing updates sent
    pub processing_updates_sent: AtomicU64,

    /// Sends that failed and dropped a connection
    pub transport_failures: AtomicU64,

    /// Invocations that fell back to a single non-streaming call
    pub streaming_fallbacks: AtomicU64,

    /// Connections evicted by the max-duration cutoff
    pub expired_connections: AtomicU64,

    /// Invocations that ended with an error frame
    pub stream_errors: AtomicU64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_keep_alive(&self) {
        self.keep_alives_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing_update(&self) {
        self.processing_updates_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.streaming_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_error(&self) {
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            keep_alives_sent: self.keep_alives_sent.load(Ordering::Relaxed),
            processing_updates_sent: self.processing_updates_sent.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            streaming_fallbacks: self.streaming_fallbacks.load(Ordering::Relaxed),
            expired_connections: self.expired_connections.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        self.frames_delivered.store(0, Ordering::Relaxed);
        self.keep_alives_sent.store(0, Ordering::Relaxed);
        self.processing_updates_sent.store(0, Ordering::Relaxed);
        self.transport_failures.store(0, Ordering::Relaxed);
        self.streaming_fallbacks.store(0, Ordering::Relaxed);
        self.expired_connections.store(0, Ordering::Relaxed);
        self.stream_errors.store(0, Ordering::Relaxed);
    }
}

/// Immutable snapshot of metrics at a point in time
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub frames_delivered: u64,
    pub keep_alives_sent: u64,
    pub processing_updates_sent: u64,
    pub transport_failures: u64,
    pub streaming_fallbacks: u64,
    pub expired_connections: u64,
    pub stream_errors: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Stream Metrics: {} frames, {} keep-alives, {} processing updates, {} transport failures, {} fallbacks, {} expired, {} errors",
            self.frames_delivered,
            self.keep_alives_sent,
            self.processing_updates_sent,
            self.transport_failures,
            self.streaming_fallbacks,
            self.expired_connections,
            self.stream_errors
        )
    }
}

lazy_static::lazy_static! {
    /// Global metrics instance
    pub static ref STREAM_METRICS: std::sync::Arc<StreamMetrics> =
        std::sync::Arc::new(StreamMetrics::new());
}
