//! Bridge from an agent's asynchronous token stream to a sequence of frames.

use futures::{FutureExt, Stream, StreamExt};
use std::any::Any;
use std::future::Future;
use std::iter::FusedIterator;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::config::InvocationConfig;
use crate::error::{RelayError, Result};
use crate::metrics::StreamMetrics;
use crate::models::{StreamFrame, Usage};
use crate::tool_events::ToolEventQueue;

/// Type alias for the frame sequence produced by a dispatcher
pub type FrameStream = Pin<Box<dyn Stream<Item = StreamFrame> + Send>>;

/// Drives one streamed invocation
///
/// [`stream`](Self::stream) yields tool-usage frames interleaved with
/// deduplicated content frames, then exactly one `Completion` or `Error`.
/// Failures and agent panics end the sequence with an `Error` frame instead of
/// escaping to the caller.
pub struct StreamDispatcher {
    config: InvocationConfig,
    tool_events: ToolEventQueue,
    metrics: Arc<StreamMetrics>,
}

impl StreamDispatcher {
    pub fn new(config: InvocationConfig, tool_events: ToolEventQueue) -> Self {
        Self {
            config,
            tool_events,
            metrics: Arc::new(StreamMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<StreamMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Stream the agent's answer to `user_message` as frames
    pub fn stream(self, agent: Arc<dyn Agent>, user_message: impl Into<String>) -> FrameStream {
        let StreamDispatcher {
            config,
            mut tool_events,
            metrics,
        } = self;
        let user_message = user_message.into();

        Box::pin(async_stream::stream! {
            tool_events.clear();

            info!(
                agent = %agent.name(),
                use_case = %config.use_case_name,
                model_id = %config.model_id,
                "Starting streamed invocation"
            );

            let opened = guarded(async { agent.astream(&user_message).await }).await;
            let mut events = match opened {
                Ok(events) => events,
                Err(RelayError::StreamingUnsupported(reason)) => {
                    info!(
                        agent = %agent.name(),
                        reason = %reason,
                        "Streaming unsupported, falling back to single invocation"
                    );
                    metrics.record_fallback();

                    match guarded(async { agent.invoke(&user_message).await }).await {
                        Ok(text) => {
                            yield content_frame(&config, text);
                            yield completion_frame(&config, None);
                        }
                        Err(e) => {
                            metrics.record_stream_error();
                            yield error_frame(&config, &e);
                        }
                    }
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to open token stream");
                    metrics.record_stream_error();
                    yield error_frame(&config, &e);
                    return;
                }
            };

            let mut last_text: Option<String> = None;
            let mut usage: Option<Usage> = None;

            loop {
                let event = match guarded(async { events.next().await.transpose() }).await {
                    Ok(Some(event)) => event,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Token stream failed");
                        metrics.record_stream_error();
                        yield error_frame(&config, &e);
                        return;
                    }
                };

                for tool_event in tool_events.drain() {
                    yield StreamFrame::from(tool_event);
                }

                if let Some(seen) = event.usage() {
                    usage = Some(seen);
                }

                let Some(text) = event.content() else {
                    continue;
                };
                if text.is_empty() || last_text.as_deref() == Some(text) {
                    debug!(text_len = text.len(), "Skipping empty or repeated chunk");
                    continue;
                }

                let text = text.to_string();
                last_text = Some(text.clone());
                yield content_frame(&config, text);
            }

            // Tool events raised alongside the last chunks
            for tool_event in tool_events.drain() {
                yield StreamFrame::from(tool_event);
            }

            debug!(has_usage = usage.is_some(), "Token stream finished");
            yield completion_frame(&config, usage);
        })
    }

    /// Same as [`stream`](Self::stream) but consumable as a plain iterator
    ///
    /// Must not be called from inside an async runtime.
    pub fn stream_blocking(
        self,
        agent: Arc<dyn Agent>,
        user_message: impl Into<String>,
    ) -> Result<BlockingFrames> {
        BlockingFrames::new(self.stream(agent, user_message))
    }
}

/// Pull-style view of a [`FrameStream`]
///
/// Owns a dedicated current-thread runtime created once for the whole sequence.
/// The runtime is shut down as soon as the sequence is exhausted, or when the
/// iterator is dropped early, after the stream itself.
pub struct BlockingFrames {
    stream: Option<FrameStream>,
    runtime: Option<Runtime>,
}

impl BlockingFrames {
    pub fn new(stream: FrameStream) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            stream: Some(stream),
            runtime: Some(runtime),
        })
    }

    /// Whether the sequence ran to its end and the runtime was released
    pub fn is_finished(&self) -> bool {
        self.stream.is_none() && self.runtime.is_none()
    }
}

impl Iterator for BlockingFrames {
    type Item = StreamFrame;

    fn next(&mut self) -> Option<StreamFrame> {
        let (Some(stream), Some(runtime)) = (self.stream.as_mut(), self.runtime.as_ref()) else {
            return None;
        };
        let frame = runtime.block_on(stream.next());
        if frame.is_none() {
            self.stream = None;
            self.runtime = None;
        }
        frame
    }
}

impl FusedIterator for BlockingFrames {}

fn content_frame(config: &InvocationConfig, text: String) -> StreamFrame {
    StreamFrame::Content {
        text,
        agent_name: config.use_case_name.clone(),
        model_id: config.model_id.clone(),
    }
}

fn completion_frame(config: &InvocationConfig, usage: Option<Usage>) -> StreamFrame {
    StreamFrame::Completion {
        agent_name: config.use_case_name.clone(),
        model_id: config.model_id.clone(),
        usage,
    }
}

fn error_frame(config: &InvocationConfig, error: &RelayError) -> StreamFrame {
    StreamFrame::Error {
        message: error.to_string(),
        agent_name: config.use_case_name.clone(),
        model_id: config.model_id.clone(),
    }
}

/// Await `fut`, turning a panic inside the agent into an error
async fn guarded<F, T>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(RelayError::InternalError(format!(
            "agent panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
