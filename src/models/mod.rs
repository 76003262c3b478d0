pub mod event;
pub mod frame;

pub use event::{ChunkMetadata, MessageChunk, ProviderEvent};
pub use frame::{SourceDocument, StreamFrame, ToolEvent, Usage};
