//! Push-style delivery driven by model-pipeline lifecycle events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::{DeliveryConfig, InvocationConfig};
use crate::error::Result;
use crate::heartbeat::HeartbeatManager;
use crate::metrics::StreamMetrics;
use crate::models::{SourceDocument, StreamFrame, Usage};
use crate::transport::{ConnectionTarget, FrameSender, Payload};

/// One typed piece of a token batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }
}

/// Lifecycle events emitted by the model-invocation pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// New tokens, with the provider metadata that came with them
    TokenBatch {
        parts: Vec<ContentPart>,
        metadata: Option<Value>,
    },
    /// The pipeline finished; `outputs` is its result map
    ChainEnd {
        outputs: Value,
        metadata: Option<Value>,
    },
    /// The model call failed
    LlmError { message: String },
}

/// Create the handle a pipeline reports through and the receiver the callback consumes
pub fn pipeline_channel() -> (PipelineHandle, mpsc::UnboundedReceiver<PipelineEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PipelineHandle { tx }, rx)
}

/// Callback registration point handed to the pipeline
#[derive(Clone, Debug)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl PipelineHandle {
    pub fn on_llm_new_token(&self, parts: Vec<ContentPart>, metadata: Option<Value>) -> bool {
        self.emit(PipelineEvent::TokenBatch { parts, metadata })
    }

    pub fn on_chain_end(&self, outputs: Value, metadata: Option<Value>) -> bool {
        self.emit(PipelineEvent::ChainEnd { outputs, metadata })
    }

    pub fn on_llm_error(&self, message: impl Into<String>) -> bool {
        self.emit(PipelineEvent::LlmError {
            message: message.into(),
        })
    }

    /// Returns `false` once the callback side is gone
    pub fn emit(&self, event: PipelineEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Outcome of a finished delivery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliverySummary {
    pub has_streamed: bool,
    pub has_streamed_references: bool,
    pub streamed_rephrase_query: bool,
    pub usage: Option<Usage>,
    pub stop_reason: Option<String>,
}

/// Turns [`PipelineEvent`]s into frames on one client connection
///
/// The fallback answer, the source documents and the rephrased query are each
/// delivered at most once per invocation.
pub struct DeliveryCallback {
    target: ConnectionTarget,
    invocation: InvocationConfig,
    delivery: DeliveryConfig,
    sender: Arc<dyn FrameSender>,
    heartbeat: Option<HeartbeatManager>,
    metrics: Arc<StreamMetrics>,
    has_streamed: bool,
    has_streamed_references: bool,
    streamed_rephrase_query: bool,
    usage: Option<Usage>,
    stop_reason: Option<String>,
}

impl DeliveryCallback {
    pub fn new(
        target: ConnectionTarget,
        invocation: InvocationConfig,
        delivery: DeliveryConfig,
        sender: Arc<dyn FrameSender>,
    ) -> Self {
        Self {
            target,
            invocation,
            delivery,
            sender,
            heartbeat: None,
            metrics: Arc::new(StreamMetrics::new()),
            has_streamed: false,
            has_streamed_references: false,
            streamed_rephrase_query: false,
            usage: None,
            stop_reason: None,
        }
    }

    /// Report delivered content to `heartbeat` so idle heartbeats are postponed
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatManager) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<StreamMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn has_streamed(&self) -> bool {
        self.has_streamed
    }

    pub fn has_streamed_references(&self) -> bool {
        self.has_streamed_references
    }

    pub fn streamed_rephrase_query(&self) -> bool {
        self.streamed_rephrase_query
    }

    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    pub fn summary(&self) -> DeliverySummary {
        DeliverySummary {
            has_streamed: self.has_streamed,
            has_streamed_references: self.has_streamed_references,
            streamed_rephrase_query: self.streamed_rephrase_query,
            usage: self.usage.clone(),
            stop_reason: self.stop_reason.clone(),
        }
    }

    /// Consume pipeline events until the pipeline drops its handle
    ///
    /// Stops early with the send error once the connection is gone.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PipelineEvent>,
    ) -> Result<DeliverySummary> {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event) {
                warn!(
                    connection_id = %self.target.connection_id,
                    error = %e,
                    "Delivery stopped, connection unavailable"
                );
                return Err(e);
            }
        }
        Ok(self.summary())
    }

    pub fn handle(&mut self, event: PipelineEvent) -> Result<()> {
        match event {
            PipelineEvent::TokenBatch { parts, metadata } => {
                if let Some(metadata) = &metadata {
                    self.update_metrics(metadata);
                }
                self.on_new_token(&parts)
            }
            PipelineEvent::ChainEnd { outputs, metadata } => {
                if let Some(metadata) = &metadata {
                    self.update_metrics(metadata);
                }
                self.on_chain_end(&outputs)
            }
            PipelineEvent::LlmError { message } => self.on_llm_error(&message),
        }
    }

    /// Forward the textual parts of a token batch
    ///
    /// Tool calls surfaced here are skipped; they reach the client through the
    /// tool-event queue instead.
    pub fn on_new_token(&mut self, parts: &[ContentPart]) -> Result<()> {
        for part in parts {
            match part {
                ContentPart::Text { text } if !text.is_empty() => {
                    self.send_frame(self.content_frame(text.clone()))?;
                    self.has_streamed = true;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn on_chain_end(&mut self, outputs: &Value) -> Result<()> {
        self.deliver_fallback(outputs)?;
        self.deliver_references(outputs)?;
        self.deliver_rephrased_query(outputs)
    }

    pub fn on_llm_error(&mut self, message: &str) -> Result<()> {
        error!(
            connection_id = %self.target.connection_id,
            model_id = %self.invocation.model_id,
            error = %message,
            "Model invocation failed"
        );
        self.metrics.record_stream_error();
        self.send_frame(StreamFrame::Error {
            message: message.to_string(),
            agent_name: self.invocation.use_case_name.clone(),
            model_id: self.invocation.model_id.clone(),
        })
    }

    /// Pick up token usage and stop reason from event metadata, if present
    pub fn update_metrics(&mut self, metadata: &Value) {
        let usage = metadata
            .get("usage")
            .or_else(|| metadata.get("usage_metadata"))
            .and_then(Usage::from_value);
        if let Some(usage) = usage {
            if usage.stop_reason.is_some() {
                self.stop_reason = usage.stop_reason.clone();
            }
            self.usage = Some(usage);
        }

        let stop_reason = ["stopReason", "stop_reason"]
            .iter()
            .find_map(|key| {
                metadata
                    .get(*key)
                    .or_else(|| metadata.get("response_metadata").and_then(|r| r.get(*key)))
            })
            .and_then(Value::as_str);
        if let Some(reason) = stop_reason {
            self.stop_reason = Some(reason.to_string());
        }
    }

    fn deliver_fallback(&mut self, outputs: &Value) -> Result<()> {
        if self.has_streamed {
            return Ok(());
        }
        let Some(fallback) = self.delivery.no_docs_response.clone() else {
            return Ok(());
        };
        let Some(context) = outputs.get(&self.delivery.context_key) else {
            return Ok(());
        };

        let output = outputs
            .get(&self.delivery.output_key)
            .and_then(Value::as_str);
        let text = match (is_empty_context(context), output) {
            (true, _) => fallback,
            (false, Some(output)) => output.to_string(),
            (false, None) => return Ok(()),
        };

        debug!(
            connection_id = %self.target.connection_id,
            "Delivering non-streamed answer"
        );
        self.has_streamed = true;
        self.send_frame(self.content_frame(text))
    }

    fn deliver_references(&mut self, outputs: &Value) -> Result<()> {
        if self.has_streamed_references || !self.delivery.return_source_docs {
            return Ok(());
        }

        let documents = [
            &self.delivery.source_documents_key,
            &self.delivery.context_key,
        ]
        .into_iter()
        .filter_map(|key| outputs.get(key.as_str()).and_then(Value::as_array))
        .find(|docs| !docs.is_empty());
        let Some(documents) = documents else {
            return Ok(());
        };

        let formatted: Vec<SourceDocument> = documents
            .iter()
            .filter_map(SourceDocument::from_context_document)
            .collect();

        self.has_streamed_references = true;
        for doc in formatted {
            self.send_frame(StreamFrame::SourceDocument(doc))?;
        }
        Ok(())
    }

    fn deliver_rephrased_query(&mut self, outputs: &Value) -> Result<()> {
        if self.streamed_rephrase_query {
            return Ok(());
        }
        let Some(query) = outputs
            .get(&self.delivery.rephrased_query_key)
            .and_then(Value::as_str)
            .filter(|q| !q.is_empty())
        else {
            return Ok(());
        };

        self.streamed_rephrase_query = true;
        self.send_frame(StreamFrame::RephrasedQuery {
            text: query.to_string(),
        })
    }

    fn content_frame(&self, text: String) -> StreamFrame {
        StreamFrame::Content {
            text,
            agent_name: self.invocation.use_case_name.clone(),
            model_id: self.invocation.model_id.clone(),
        }
    }

    fn send_frame(&self, frame: StreamFrame) -> Result<()> {
        match self.target.send(self.sender.as_ref(), &Payload::Frame(frame)) {
            Ok(()) => {
                self.metrics.record_frame();
                if let Some(heartbeat) = &self.heartbeat {
                    heartbeat.update_activity(&self.target.connection_id);
                }
                Ok(())
            }
            Err(e) => {
                self.metrics.record_transport_failure();
                if let Some(heartbeat) = &self.heartbeat {
                    heartbeat.stop_keep_alive(&self.target.connection_id);
                }
                Err(e)
            }
        }
    }
}

fn is_empty_context(context: &Value) -> bool {
    match context {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::String(text) => text.trim().is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
