use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::models::ProviderEvent;

/// Type alias for the event stream produced by an agent
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent>> + Send>>;

/// Type alias for the future returned by [`Agent::astream`]
pub type StreamFuture = Pin<Box<dyn Future<Output = Result<EventStream>> + Send>>;

/// Type alias for the future returned by [`Agent::invoke`]
pub type InvokeFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// A configured model or agent that can answer a user message
pub trait Agent: Send + Sync {
    /// Open an asynchronous token stream for `user_message`
    ///
    /// Agents that cannot stream return [`RelayError::StreamingUnsupported`].
    fn astream(&self, user_message: &str) -> StreamFuture;

    /// Produce the complete answer in one call
    fn invoke(&self, user_message: &str) -> InvokeFuture;

    /// Agent name for logging
    fn name(&self) -> &str;
}

/// Replays the user's message back one word at a time
///
/// Used by the bundled server to exercise the transport without a model.
#[derive(Debug, Clone, Default)]
pub struct EchoAgent {
    delay: Duration,
}

impl EchoAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between words, to mimic a slow model
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }

    fn words(user_message: &str) -> Vec<String> {
        let mut words = Vec::new();
        for (i, word) in user_message.split_whitespace().enumerate() {
            if i == 0 {
                words.push(word.to_string());
            } else {
                words.push(format!(" {}", word));
            }
        }
        words
    }
}

impl Agent for EchoAgent {
    fn astream(&self, user_message: &str) -> StreamFuture {
        let words = Self::words(user_message);
        let delay = self.delay;

        Box::pin(async move {
            if words.is_empty() {
                return Err(RelayError::InvocationError(
                    "Nothing to echo".to_string(),
                ));
            }

            let stream = async_stream::stream! {
                for word in words {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    yield Ok::<_, RelayError>(ProviderEvent::text(word));
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }

    fn invoke(&self, user_message: &str) -> InvokeFuture {
        let answer = user_message.trim().to_string();
        Box::pin(async move { Ok(answer) })
    }

    fn name(&self) -> &str {
        "echo"
    }
}
