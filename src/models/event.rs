use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::frame::Usage;

/// One event yielded by an agent's token stream
///
/// Providers disagree on shape: some hand back typed chunks, others plain maps
/// with usage nested under `event.metadata.usage` or `metadata.usage`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Chunk(MessageChunk),
    Map(Value),
}

/// Typed (attribute-style) stream event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageChunk {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub metadata: Option<ChunkMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

impl ProviderEvent {
    pub fn text(text: impl Into<String>) -> Self {
        ProviderEvent::Chunk(MessageChunk {
            data: Some(text.into()),
            metadata: None,
        })
    }

    /// Textual content carried by the event, if any
    pub fn content(&self) -> Option<&str> {
        match self {
            ProviderEvent::Chunk(chunk) => chunk.data.as_deref(),
            ProviderEvent::Map(value) => value
                .get("data")
                .or_else(|| value.get("text"))
                .and_then(Value::as_str),
        }
    }

    /// Usage carried by the event; `event.metadata.usage` is checked before `metadata.usage`
    pub fn usage(&self) -> Option<Usage> {
        match self {
            ProviderEvent::Chunk(chunk) => {
                let metadata = chunk.metadata.as_ref()?;
                let mut usage = metadata.usage.clone()?;
                if usage.stop_reason.is_none() {
                    usage.stop_reason = metadata.stop_reason.clone();
                }
                Some(usage)
            }
            ProviderEvent::Map(value) => {
                let metadata = value
                    .pointer("/event/metadata")
                    .filter(|m| m.get("usage").is_some())
                    .or_else(|| value.get("metadata"))?;
                let mut usage = Usage::from_value(metadata.get("usage")?)?;
                if usage.stop_reason.is_none() {
                    usage.stop_reason = metadata
                        .get("stopReason")
                        .or_else(|| metadata.get("stop_reason"))
                        .or_else(|| value.pointer("/event/messageStop/stopReason"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                Some(usage)
            }
        }
    }
}

impl From<Value> for ProviderEvent {
    fn from(value: Value) -> Self {
        ProviderEvent::Map(value)
    }
}

impl From<MessageChunk> for ProviderEvent {
    fn from(chunk: MessageChunk) -> Self {
        ProviderEvent::Chunk(chunk)
    }
}
