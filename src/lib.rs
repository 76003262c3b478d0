//! # Chat Stream Relay
//!
//! Streaming delivery and keep-alive coordination for LLM chat over WebSockets.
//!
//! ## Overview
//!
//! A model call behind a WebSocket gateway has two problems the model itself does
//! not care about: the gateway drops idle connections, and tokens arrive out of
//! step with auxiliary events (tool calls, source documents, rephrased queries).
//! This crate handles both:
//!
//! - **Dispatch** - turn an agent's async token stream into ordered, deduplicated
//!   frames, interleaving tool events and always ending with one terminal frame
//! - **Delivery** - push pipeline lifecycle events to the client, delivering the
//!   fallback answer, source documents and rephrased query at most once each
//! - **Heartbeat** - keep idle connections alive from background threads, with a
//!   hard ceiling on streaming duration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chat_stream_relay::agent::EchoAgent;
//! use chat_stream_relay::config::InvocationConfig;
//! use chat_stream_relay::dispatcher::StreamDispatcher;
//! use chat_stream_relay::tool_events::ToolEventQueue;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = StreamDispatcher::new(
//!     InvocationConfig::new("support-bot", "echo"),
//!     ToolEventQueue::new(),
//! );
//!
//! for frame in dispatcher.stream_blocking(Arc::new(EchoAgent::new()), "hello there")? {
//!     println!("{}", serde_json::to_string(&frame)?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Error types and handling
//! - [`models`] - Frames, usage and provider event shapes
//! - [`state`] - Connection state and registry
//! - [`heartbeat`] - Keep-alive workers
//! - [`callback`] - Push-style delivery of pipeline events
//! - [`dispatcher`] - Async token stream to frame sequence bridge
//! - [`transport`] - Send function contract and client envelopes
//! - [`relay`] / [`handler`] - WebSocket server wiring

pub mod agent;
pub mod callback;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod metrics;
pub mod models;
pub mod relay;
pub mod state;
pub mod tool_events;
pub mod transport;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
