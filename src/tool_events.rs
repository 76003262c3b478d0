use tokio::sync::mpsc;
use tracing::debug;

use crate::models::ToolEvent;

/// Create a connected sink/queue pair for one invocation
///
/// The sink goes to whatever executes tools; the queue goes to the dispatcher,
/// which drains it between stream events.
pub fn tool_event_channel() -> (ToolEventSink, ToolEventQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ToolEventSink { tx: tx.clone() },
        ToolEventQueue { tx, rx },
    )
}

/// Producer half, cheap to clone and usable from any thread
#[derive(Clone, Debug)]
pub struct ToolEventSink {
    tx: mpsc::UnboundedSender<ToolEvent>,
}

impl ToolEventSink {
    /// Queue an event; returns `false` if the queue has been dropped
    pub fn push(&self, event: ToolEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Consumer half owned by the dispatcher
#[derive(Debug)]
pub struct ToolEventQueue {
    tx: mpsc::UnboundedSender<ToolEvent>,
    rx: mpsc::UnboundedReceiver<ToolEvent>,
}

impl ToolEventQueue {
    pub fn new() -> Self {
        tool_event_channel().1
    }

    /// Another producer handle for this queue
    pub fn sink(&self) -> ToolEventSink {
        ToolEventSink {
            tx: self.tx.clone(),
        }
    }

    /// Take every event queued so far, in arrival order
    pub fn drain(&mut self) -> Vec<ToolEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Discard stale events, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.drain().len();
        if dropped > 0 {
            debug!(dropped = dropped, "Cleared stale tool events");
        }
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for ToolEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_drain_preserves_order() {
        let (sink, mut queue) = tool_event_channel();

        sink.push(ToolEvent::new("search", "started"));
        sink.push(ToolEvent::new("search", "completed"));

        let events = queue.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, "started");
        assert_eq!(events[1].status, "completed");
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_clear() {
        let mut queue = ToolEventQueue::new();
        let sink = queue.sink();

        sink.push(ToolEvent::new("calc", "started"));
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_from_other_thread() {
        let (sink, mut queue) = tool_event_channel();

        let handle = thread::spawn(move || {
            sink.push(ToolEvent::new("calc", "started"));
        });
        handle.join().unwrap();

        assert_eq!(queue.drain(), vec![ToolEvent::new("calc", "started")]);
    }

    #[test]
    fn test_push_after_queue_dropped() {
        let (sink, queue) = tool_event_channel();
        drop(queue);
        assert!(!sink.push(ToolEvent::new("calc", "started")));
    }
}
