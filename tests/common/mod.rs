#![allow(dead_code)]

use chat_stream_relay::agent::{Agent, EventStream, InvokeFuture, StreamFuture};
use chat_stream_relay::models::{ProviderEvent, StreamFrame, ToolEvent};
use chat_stream_relay::tool_events::ToolEventSink;
use chat_stream_relay::transport::{FrameSender, Payload};
use chat_stream_relay::{RelayError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One scripted step of a fake token stream
#[derive(Clone, Debug)]
pub enum Step {
    Emit(ProviderEvent),
    Tool(ToolEvent),
    Fail(String),
    Panic(String),
}

pub fn text(t: &str) -> Step {
    Step::Emit(ProviderEvent::text(t))
}

/// Agent that replays a fixed script
#[derive(Clone, Default)]
pub struct ScriptedAgent {
    steps: Vec<Step>,
    on_open: Vec<ToolEvent>,
    sink: Option<ToolEventSink>,
    unsupported: Option<String>,
    invoke_error: Option<String>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    /// Route tool steps through `sink`, as a tool executor would
    pub fn with_tools(mut self, sink: ToolEventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Tool events raised while the stream is being opened
    pub fn with_tool_on_open(mut self, event: ToolEvent) -> Self {
        self.on_open.push(event);
        self
    }

    /// Refuse to stream; `invoke` answers with `answer`
    pub fn non_streaming(answer: &str) -> Self {
        Self {
            unsupported: Some(answer.to_string()),
            ..Default::default()
        }
    }

    pub fn with_invoke_error(mut self, message: &str) -> Self {
        self.invoke_error = Some(message.to_string());
        self
    }
}

impl Agent for ScriptedAgent {
    fn astream(&self, _user_message: &str) -> StreamFuture {
        let agent = self.clone();
        Box::pin(async move {
            if agent.unsupported.is_some() {
                return Err(RelayError::StreamingUnsupported(
                    "scripted agent".to_string(),
                ));
            }

            if let Some(sink) = &agent.sink {
                for event in &agent.on_open {
                    sink.push(event.clone());
                }
            }

            let sink = agent.sink.clone();
            let steps = agent.steps.clone();
            let stream = async_stream::stream! {
                for step in steps {
                    match step {
                        Step::Emit(event) => {
                            yield Ok::<_, RelayError>(event);
                        }
                        Step::Tool(event) => {
                            if let Some(sink) = &sink {
                                sink.push(event);
                            }
                        }
                        Step::Fail(message) => {
                            yield Err(RelayError::InvocationError(message));
                        }
                        Step::Panic(message) => panic!("{}", message),
                    }
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }

    fn invoke(&self, _user_message: &str) -> InvokeFuture {
        let answer = self.unsupported.clone().unwrap_or_default();
        let error = self.invoke_error.clone();
        Box::pin(async move {
            match error {
                Some(message) => Err(RelayError::InvocationError(message)),
                None => Ok(answer),
            }
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Sender that records every payload and can be told to start failing
#[derive(Clone, Default)]
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<(String, Payload)>>>,
    fail_after: Arc<Mutex<Option<usize>>>,
    attempts: Arc<AtomicUsize>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send after the first `n` succeed
    pub fn failing_after(n: usize) -> Self {
        let sender = Self::default();
        *sender.fail_after.lock().unwrap() = Some(n);
        sender
    }

    pub fn payloads(&self) -> Vec<Payload> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn frames(&self) -> Vec<StreamFrame> {
        self.payloads()
            .into_iter()
            .filter_map(|p| match p {
                Payload::Frame(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Payload) -> usize {
        self.payloads().iter().filter(|p| *p == wanted).count()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl FrameSender for RecordingSender {
    fn send(
        &self,
        connection_id: &str,
        _conversation_id: &str,
        payload: &Payload,
        _message_id: &str,
    ) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = *self.fail_after.lock().unwrap()
            && attempt >= limit
        {
            return Err(RelayError::TransportError("socket closed".to_string()));
        }

        self.sent
            .lock()
            .unwrap()
            .push((connection_id.to_string(), payload.clone()));
        Ok(())
    }
}

pub fn content_texts(frames: &[StreamFrame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| f.content_text().map(str::to_string))
        .collect()
}
