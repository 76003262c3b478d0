use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::Agent;
use crate::config::{InvocationConfig, StreamingConfig};
use crate::dispatcher::StreamDispatcher;
use crate::error::{RelayError, Result};
use crate::heartbeat::HeartbeatManager;
use crate::metrics::StreamMetrics;
use crate::models::{StreamFrame, Usage};
use crate::tool_events::ToolEventQueue;
use crate::transport::{ConnectionTarget, FrameSender, Payload};

/// Inbound chat message from a client
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub question: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// What a finished relay delivered
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelaySummary {
    pub frames_sent: usize,
    pub usage: Option<Usage>,
    pub terminated_by_error: bool,
}

/// Pushes a dispatcher's frames to a client while keeping the connection alive
///
/// Several relays may share one connection; its keep-alive runs until the last
/// of them finishes.
#[derive(Clone)]
pub struct StreamRelay {
    heartbeat: HeartbeatManager,
    sender: Arc<dyn FrameSender>,
    metrics: Arc<StreamMetrics>,
    active: Arc<DashMap<String, usize>>,
}

impl StreamRelay {
    pub fn new(sender: Arc<dyn FrameSender>, streaming: StreamingConfig) -> Self {
        Self::with_metrics(sender, streaming, Arc::new(StreamMetrics::new()))
    }

    pub fn with_metrics(
        sender: Arc<dyn FrameSender>,
        streaming: StreamingConfig,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        let heartbeat =
            HeartbeatManager::new(Arc::clone(&sender), streaming).with_metrics(Arc::clone(&metrics));
        Self {
            heartbeat,
            sender,
            metrics,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn heartbeat(&self) -> &HeartbeatManager {
        &self.heartbeat
    }

    pub fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.metrics
    }

    /// Streaming relays currently running on `connection_id`
    pub fn active_relays(&self, connection_id: &str) -> usize {
        self.active.get(connection_id).map(|n| *n).unwrap_or(0)
    }

    /// Answer `user_message` on `target`
    ///
    /// Streaming invocations are heartbeated for their whole duration. The
    /// keep-alive is stopped when the last relay on the connection ends, even if
    /// this future is dropped early. A send failure ends the relay with that error.
    pub async fn relay(
        &self,
        agent: Arc<dyn Agent>,
        invocation: InvocationConfig,
        target: &ConnectionTarget,
        user_message: String,
        tool_events: ToolEventQueue,
    ) -> Result<RelaySummary> {
        if !invocation.streaming {
            return self.relay_once(agent, &invocation, target, &user_message).await;
        }

        let lease = self.acquire(target)?;

        let result = self
            .forward(agent, invocation, target, user_message, tool_events)
            .await;

        drop(lease);

        match &result {
            Ok(summary) => info!(
                connection_id = %target.connection_id,
                frames = summary.frames_sent,
                error = summary.terminated_by_error,
                "Relay finished"
            ),
            Err(e) => warn!(
                connection_id = %target.connection_id,
                error = %e,
                "Relay aborted"
            ),
        }
        result
    }

    async fn forward(
        &self,
        agent: Arc<dyn Agent>,
        invocation: InvocationConfig,
        target: &ConnectionTarget,
        user_message: String,
        tool_events: ToolEventQueue,
    ) -> Result<RelaySummary> {
        let mut frames = StreamDispatcher::new(invocation, tool_events)
            .with_metrics(Arc::clone(&self.metrics))
            .stream(agent, user_message);

        let mut summary = RelaySummary::default();
        while let Some(frame) = frames.next().await {
            match &frame {
                StreamFrame::Completion { usage, .. } => summary.usage = usage.clone(),
                StreamFrame::Error { .. } => summary.terminated_by_error = true,
                _ => {}
            }

            self.push(target, frame)?;
            summary.frames_sent += 1;
            self.heartbeat.update_activity(&target.connection_id);
        }
        Ok(summary)
    }

    async fn relay_once(
        &self,
        agent: Arc<dyn Agent>,
        invocation: &InvocationConfig,
        target: &ConnectionTarget,
        user_message: &str,
    ) -> Result<RelaySummary> {
        let frames = match agent.invoke(user_message).await {
            Ok(text) => vec![
                StreamFrame::Content {
                    text,
                    agent_name: invocation.use_case_name.clone(),
                    model_id: invocation.model_id.clone(),
                },
                StreamFrame::Completion {
                    agent_name: invocation.use_case_name.clone(),
                    model_id: invocation.model_id.clone(),
                    usage: None,
                },
            ],
            Err(e) => {
                self.metrics.record_stream_error();
                vec![StreamFrame::Error {
                    message: e.to_string(),
                    agent_name: invocation.use_case_name.clone(),
                    model_id: invocation.model_id.clone(),
                }]
            }
        };

        let mut summary = RelaySummary::default();
        for frame in frames {
            summary.terminated_by_error |= matches!(frame, StreamFrame::Error { .. });
            self.push(target, frame)?;
            summary.frames_sent += 1;
        }
        Ok(summary)
    }

    fn acquire(&self, target: &ConnectionTarget) -> Result<RelayLease<'_>> {
        let start = || {
            self.heartbeat.start_keep_alive(
                &target.connection_id,
                &target.conversation_id,
                &target.message_id,
            )
        };

        match self.active.entry(target.connection_id.clone()) {
            Entry::Occupied(mut entry) => {
                start()?;
                *entry.get_mut() += 1;
            }
            Entry::Vacant(entry) => {
                start()?;
                entry.insert(1);
            }
        }
        Ok(RelayLease {
            relay: self,
            connection_id: target.connection_id.clone(),
        })
    }

    /// Stop the keep-alive once no relay on the connection remains
    fn release(&self, connection_id: &str) {
        if let Entry::Occupied(mut entry) = self.active.entry(connection_id.to_string()) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                self.heartbeat.stop_keep_alive(connection_id);
                entry.remove();
            }
        }
    }

    fn push(&self, target: &ConnectionTarget, frame: StreamFrame) -> Result<()> {
        target
            .send(self.sender.as_ref(), &Payload::Frame(frame))
            .inspect(|_| self.metrics.record_frame())
            .map_err(|e| {
                self.metrics.record_transport_failure();
                match e {
                    RelayError::ConnectionGone(_) => e,
                    other => RelayError::TransportError(other.to_string()),
                }
            })
    }
}

/// One running relay's claim on its connection's keep-alive
struct RelayLease<'a> {
    relay: &'a StreamRelay,
    connection_id: String,
}

impl Drop for RelayLease<'_> {
    fn drop(&mut self) {
        self.relay.release(&self.connection_id);
    }
}
