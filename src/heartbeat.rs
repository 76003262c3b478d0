//! Keep-alive workers for long-running streamed invocations.

use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::StreamingConfig;
use crate::error::Result;
use crate::metrics::StreamMetrics;
use crate::state::{ConnectionEntry, ConnectionRegistry, ConnectionState};
use crate::transport::{FrameSender, Payload};

/// Point-in-time view of a tracked connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub conversation_id: String,
    pub message_id: String,
    pub duration: Duration,
    pub time_since_last_keep_alive: Duration,
    pub time_since_last_processing_update: Duration,
}

/// Owns the connection registry and one heartbeat worker per live connection
///
/// Each worker is an OS thread that wakes every `poll_interval` and pushes
/// `##KEEP_ALIVE##` or `##PROCESSING##` once the connection has been quiet for
/// the matching interval. The two cadences are independent, and
/// [`update_activity`](Self::update_activity) restarts both. A connection
/// streaming longer than `max_streaming_duration` is removed, and a failed send
/// drops the connection without retrying.
#[derive(Clone)]
pub struct HeartbeatManager {
    registry: ConnectionRegistry,
    sender: Arc<dyn FrameSender>,
    config: StreamingConfig,
    metrics: Arc<StreamMetrics>,
}

impl HeartbeatManager {
    pub fn new(sender: Arc<dyn FrameSender>, config: StreamingConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            sender,
            config,
            metrics: Arc::new(StreamMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<StreamMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.metrics
    }

    /// Begin heartbeating `connection_id`
    ///
    /// Calling this again for a live connection refreshes its ids and keeps the
    /// existing worker.
    pub fn start_keep_alive(
        &self,
        connection_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<()> {
        let (entry, created) = self.registry.get_or_insert_with(connection_id, || {
            ConnectionState::new(connection_id, conversation_id, message_id)
        });

        if !created {
            entry.update(|state| state.with_ids(conversation_id, message_id));
            debug!(
                connection_id = %connection_id,
                "Keep-alive already running, reusing worker"
            );
            return Ok(());
        }

        let worker = Worker {
            connection_id: connection_id.to_string(),
            entry: Arc::clone(&entry),
            registry: self.registry.clone(),
            sender: Arc::clone(&self.sender),
            config: self.config.clone(),
            metrics: Arc::clone(&self.metrics),
        };

        let spawned = thread::Builder::new()
            .name(format!("keep-alive-{}", connection_id))
            .spawn(move || worker.run());

        if let Err(e) = spawned {
            self.registry.remove_if_same(connection_id, &entry);
            return Err(e.into());
        }

        info!(
            connection_id = %connection_id,
            conversation_id = %conversation_id,
            message_id = %message_id,
            "Started keep-alive"
        );
        Ok(())
    }

    /// Record genuine traffic so the next heartbeats are pushed back
    ///
    /// Returns `false` when the connection is not tracked.
    pub fn update_activity(&self, connection_id: &str) -> bool {
        match self.registry.get(connection_id) {
            Some(entry) => {
                let now = Instant::now();
                entry.update(|state| state.with_activity(now));
                true
            }
            None => false,
        }
    }

    /// Stop heartbeating `connection_id`
    ///
    /// Safe to call after the worker already gave up on its own. Returns whether
    /// an entry was removed.
    pub fn stop_keep_alive(&self, connection_id: &str) -> bool {
        match self.registry.remove(connection_id) {
            Some(entry) => {
                let state = entry.load();
                info!(
                    connection_id = %connection_id,
                    duration_ms = state.duration(Instant::now()).as_millis() as u64,
                    "Stopped keep-alive"
                );
                true
            }
            None => {
                debug!(connection_id = %connection_id, "Keep-alive already stopped");
                false
            }
        }
    }

    pub fn get_connection_status(&self, connection_id: &str) -> Option<ConnectionStatus> {
        let state = self.registry.get(connection_id)?.load();
        let now = Instant::now();
        Some(ConnectionStatus {
            conversation_id: state.conversation_id.clone(),
            message_id: state.message_id.clone(),
            duration: state.duration(now),
            time_since_last_keep_alive: state.since_keep_alive(now),
            time_since_last_processing_update: state.since_processing_update(now),
        })
    }

    pub fn get_active_connection_count(&self) -> usize {
        self.registry.count()
    }

    /// Stop every tracked connection, returning how many were stopped
    pub fn cleanup_all(&self) -> usize {
        let ids = self.registry.ids();
        let stopped = ids
            .iter()
            .filter(|id| self.registry.remove(id).is_some())
            .count();

        if stopped > 0 {
            info!(stopped = stopped, "Cleaned up all keep-alive connections");
        }
        stopped
    }
}

/// Background loop for a single connection
struct Worker {
    connection_id: String,
    entry: Arc<ConnectionEntry>,
    registry: ConnectionRegistry,
    sender: Arc<dyn FrameSender>,
    config: StreamingConfig,
    metrics: Arc<StreamMetrics>,
}

impl Worker {
    fn run(self) {
        loop {
            thread::sleep(self.config.poll_interval);

            if self.entry.is_cancelled() {
                break;
            }

            let now = Instant::now();
            let state = self.entry.load();

            if state.duration(now) > self.config.max_streaming_duration {
                warn!(
                    connection_id = %self.connection_id,
                    max_secs = self.config.max_streaming_duration.as_secs_f64(),
                    "Max streaming duration exceeded, dropping connection"
                );
                self.metrics.record_expired();
                self.registry
                    .remove_if_same(&self.connection_id, &self.entry);
                break;
            }

            if state.since_keep_alive(now) >= self.config.keep_alive_interval {
                if !self.send(&state, &Payload::KeepAlive) {
                    break;
                }
                self.entry.update(|s| s.with_keep_alive_sent(now));
                self.metrics.record_keep_alive();
            }

            if state.since_processing_update(now) >= self.config.processing_update_interval {
                if !self.send(&state, &Payload::Processing) {
                    break;
                }
                self.entry.update(|s| s.with_processing_update_sent(now));
                self.metrics.record_processing_update();
            }
        }

        debug!(connection_id = %self.connection_id, "Keep-alive worker exited");
    }

    /// Push one heartbeat; on any failure the connection is dropped
    fn send(&self, state: &ConnectionState, payload: &Payload) -> bool {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.sender.send(
                &state.connection_id,
                &state.conversation_id,
                payload,
                &state.message_id,
            )
        }));

        let failure = match outcome {
            Ok(Ok(())) => {
                debug!(
                    connection_id = %self.connection_id,
                    heartbeat = ?payload,
                    "Sent heartbeat"
                );
                return true;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "sender panicked".to_string(),
        };

        error!(
            connection_id = %self.connection_id,
            error = %failure,
            "Heartbeat send failed, dropping connection"
        );
        self.metrics.record_transport_failure();
        self.registry
            .remove_if_same(&self.connection_id, &self.entry);
        false
    }
}
