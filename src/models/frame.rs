use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of output delivered to the client
///
/// Serializes to a flat JSON object carrying a `type` discriminator
/// (`content`, `tool_use`, `completion`, `error`, `source_document`, `rephrased_query`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Content {
        text: String,
        agent_name: String,
        model_id: String,
    },
    ToolUse {
        tool_name: String,
        status: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
    },
    Completion {
        agent_name: String,
        model_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error {
        message: String,
        agent_name: String,
        model_id: String,
    },
    SourceDocument(SourceDocument),
    RephrasedQuery {
        text: String,
    },
}

impl StreamFrame {
    /// `Completion` and `Error` close a logical stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Completion { .. } | StreamFrame::Error { .. })
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            StreamFrame::Content { .. } => "content",
            StreamFrame::ToolUse { .. } => "tool_use",
            StreamFrame::Completion { .. } => "completion",
            StreamFrame::Error { .. } => "error",
            StreamFrame::SourceDocument(_) => "source_document",
            StreamFrame::RephrasedQuery { .. } => "rephrased_query",
        }
    }

    /// Text of a `Content` frame
    pub fn content_text(&self) -> Option<&str> {
        match self {
            StreamFrame::Content { text, .. } => Some(text),
            _ => None,
        }
    }
}

impl From<ToolEvent> for StreamFrame {
    fn from(event: ToolEvent) -> Self {
        StreamFrame::ToolUse {
            tool_name: event.tool_name,
            status: event.status,
            payload: event.payload,
        }
    }
}

/// Notification that an agent tool was invoked, produced outside the token stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    #[serde(alias = "tool", alias = "toolName")]
    pub tool_name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl ToolEvent {
    pub fn new(tool_name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            status: status.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Token accounting reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl Usage {
    /// Read a usage map in either camelCase or snake_case form
    ///
    /// Returns `None` unless at least one token count is present.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let count = |camel: &str, snake: &str| {
            obj.get(camel)
                .or_else(|| obj.get(snake))
                .and_then(Value::as_u64)
        };

        let input = count("inputTokens", "input_tokens");
        let output = count("outputTokens", "output_tokens");
        let total = count("totalTokens", "total_tokens");

        if input.is_none() && output.is_none() && total.is_none() {
            return None;
        }

        let input_tokens = input.unwrap_or(0);
        let output_tokens = output.unwrap_or(0);
        let stop_reason = obj
            .get("stopReason")
            .or_else(|| obj.get("stop_reason"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(Usage {
            input_tokens,
            output_tokens,
            total_tokens: total.unwrap_or(input_tokens.saturating_add(output_tokens)),
            stop_reason,
        })
    }
}

/// A retrieved document cited by an answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_attributes: Option<Value>,
}

impl SourceDocument {
    /// Build from a retriever document shaped `{page_content, metadata: {...}}`
    ///
    /// Plain strings become bare excerpts. Anything else yields `None`.
    pub fn from_context_document(doc: &Value) -> Option<Self> {
        match doc {
            Value::String(text) => Some(SourceDocument {
                excerpt: text.clone(),
                ..Default::default()
            }),
            Value::Object(obj) => {
                let excerpt = obj
                    .get("page_content")
                    .or_else(|| obj.get("excerpt"))
                    .and_then(Value::as_str)?
                    .to_string();
                let metadata = obj.get("metadata").and_then(Value::as_object);
                let meta_str = |key: &str| {
                    metadata
                        .and_then(|m| m.get(key))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                };

                Some(SourceDocument {
                    excerpt,
                    location: meta_str("source"),
                    score: metadata.and_then(|m| m.get("score")).and_then(|s| match s {
                        Value::Number(n) => n.as_f64(),
                        Value::String(s) => s.parse().ok(),
                        _ => None,
                    }),
                    document_title: meta_str("document_title"),
                    document_id: meta_str("document_id"),
                    additional_attributes: metadata
                        .and_then(|m| m.get("additional_attributes"))
                        .filter(|v| !v.is_null())
                        .cloned(),
                })
            }
            _ => None,
        }
    }
}
