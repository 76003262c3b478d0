use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::models::StreamFrame;

/// Reserved token for idle-timeout heartbeats
pub const KEEP_ALIVE_TOKEN: &str = "##KEEP_ALIVE##";
/// Reserved token telling the client the model is still working
pub const PROCESSING_TOKEN: &str = "##PROCESSING##";
/// Reserved token marking the end of an answer
pub const END_CONVERSATION_TOKEN: &str = "##END_CONVERSATION##";

/// Identifies where one invocation's frames go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub connection_id: String,
    pub conversation_id: String,
    pub message_id: String,
}

impl ConnectionTarget {
    pub fn new(
        connection_id: impl Into<String>,
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
        }
    }

    pub fn send(&self, sender: &dyn FrameSender, payload: &Payload) -> Result<()> {
        sender.send(
            &self.connection_id,
            &self.conversation_id,
            payload,
            &self.message_id,
        )
    }
}

/// Everything that may be pushed down a client connection
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    KeepAlive,
    Processing,
    Frame(StreamFrame),
}

impl Payload {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Payload::KeepAlive | Payload::Processing)
    }

    /// Client-facing message for this payload
    pub fn envelope(&self, conversation_id: &str, message_id: &str) -> Value {
        let mut body = match self {
            Payload::KeepAlive => json!({ "data": KEEP_ALIVE_TOKEN }),
            Payload::Processing => json!({ "data": PROCESSING_TOKEN }),
            Payload::Frame(frame) => match frame {
                StreamFrame::Content { text, .. } => json!({ "data": text }),
                StreamFrame::ToolUse {
                    tool_name,
                    status,
                    payload,
                } => json!({
                    "toolUsage": {
                        "toolName": tool_name,
                        "status": status,
                        "payload": payload,
                    }
                }),
                StreamFrame::Completion { usage, .. } => match usage {
                    Some(usage) => json!({ "data": END_CONVERSATION_TOKEN, "usage": usage }),
                    None => json!({ "data": END_CONVERSATION_TOKEN }),
                },
                StreamFrame::Error { message, .. } => json!({ "errorMessage": message }),
                StreamFrame::SourceDocument(doc) => json!({ "sourceDocument": doc }),
                StreamFrame::RephrasedQuery { text } => json!({ "rephrased_query": text }),
            },
        };

        if let Some(obj) = body.as_object_mut() {
            obj.insert("conversationId".to_string(), json!(conversation_id));
            obj.insert("messageId".to_string(), json!(message_id));
        }
        body
    }
}

impl From<StreamFrame> for Payload {
    fn from(frame: StreamFrame) -> Self {
        Payload::Frame(frame)
    }
}

/// Pushes one complete payload to a client connection
///
/// Called from heartbeat worker threads as well as the invocation, so
/// implementations must be thread-safe. An error means the connection is gone.
pub trait FrameSender: Send + Sync {
    fn send(
        &self,
        connection_id: &str,
        conversation_id: &str,
        payload: &Payload,
        message_id: &str,
    ) -> Result<()>;
}

impl<F> FrameSender for F
where
    F: Fn(&str, &str, &Payload, &str) -> Result<()> + Send + Sync,
{
    fn send(
        &self,
        connection_id: &str,
        conversation_id: &str,
        payload: &Payload,
        message_id: &str,
    ) -> Result<()> {
        self(connection_id, conversation_id, payload, message_id)
    }
}

/// Routes payloads to the writer half of each open WebSocket
///
/// Plays the role of the gateway's post-to-connection API for the local server.
#[derive(Clone, Default)]
pub struct ConnectionRouter {
    writers: Arc<DashMap<String, mpsc::UnboundedSender<String>>>,
}

impl ConnectionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and hand back the stream of serialized messages for it
    pub fn register(&self, connection_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.writers.insert(connection_id.to_string(), tx);
        debug!(connection_id = %connection_id, "Registered connection writer");
        rx
    }

    pub fn unregister(&self, connection_id: &str) {
        if self.writers.remove(connection_id).is_some() {
            debug!(connection_id = %connection_id, "Unregistered connection writer");
        }
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }
}

impl FrameSender for ConnectionRouter {
    fn send(
        &self,
        connection_id: &str,
        conversation_id: &str,
        payload: &Payload,
        message_id: &str,
    ) -> Result<()> {
        let message = serde_json::to_string(&payload.envelope(conversation_id, message_id))?;

        let delivered = match self.writers.get(connection_id) {
            Some(writer) => writer.send(message).is_ok(),
            None => return Err(RelayError::ConnectionGone(connection_id.to_string())),
        };

        if !delivered {
            warn!(connection_id = %connection_id, "Connection writer closed, dropping route");
            self.writers.remove(connection_id);
            return Err(RelayError::ConnectionGone(connection_id.to_string()));
        }

        Ok(())
    }
}
