use arc_swap::ArcSwap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Liveness bookkeeping for one streamed invocation
///
/// Values are never mutated in place. Every update produces a new state which is
/// swapped into the owning [`ConnectionEntry`].
#[derive(Clone, Debug)]
pub struct ConnectionState {
    pub connection_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub start_time: Instant,
    pub last_keep_alive_time: Instant,
    pub last_processing_update_time: Instant,
}

impl ConnectionState {
    pub fn new(
        connection_id: impl Into<String>,
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            connection_id: connection_id.into(),
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            start_time: now,
            last_keep_alive_time: now,
            last_processing_update_time: now,
        }
    }

    /// Genuine traffic was sent; both heartbeat clocks restart
    pub fn with_activity(&self, now: Instant) -> Self {
        Self {
            last_keep_alive_time: now,
            last_processing_update_time: now,
            ..self.clone()
        }
    }

    /// Never moves the clock backwards past newer activity
    pub fn with_keep_alive_sent(&self, now: Instant) -> Self {
        Self {
            last_keep_alive_time: self.last_keep_alive_time.max(now),
            ..self.clone()
        }
    }

    pub fn with_processing_update_sent(&self, now: Instant) -> Self {
        Self {
            last_processing_update_time: self.last_processing_update_time.max(now),
            ..self.clone()
        }
    }

    pub fn with_ids(&self, conversation_id: &str, message_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            ..self.clone()
        }
    }

    pub fn duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start_time)
    }

    pub fn since_keep_alive(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_keep_alive_time)
    }

    pub fn since_processing_update(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_processing_update_time)
    }
}

/// Registry slot for one connection: the current state plus its worker's stop flag
#[derive(Debug)]
pub struct ConnectionEntry {
    state: ArcSwap<ConnectionState>,
    cancelled: AtomicBool,
}

impl ConnectionEntry {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state: ArcSwap::from_pointee(state),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Snapshot of the current state
    pub fn load(&self) -> Arc<ConnectionState> {
        self.state.load_full()
    }

    /// Replace the state with `f(current)`, retrying if another thread swapped first
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&ConnectionState) -> ConnectionState,
    {
        self.state.rcu(|current| f(current));
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Thread-safe map of connection id to connection entry
///
/// Holds no policy of its own; the heartbeat manager decides when entries come and go.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, Arc<ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<ConnectionEntry>> {
        self.connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Insert a fresh entry, replacing any previous one
    pub fn put(&self, connection_id: &str, state: ConnectionState) -> Arc<ConnectionEntry> {
        let entry = Arc::new(ConnectionEntry::new(state));
        if let Some(previous) = self
            .connections
            .insert(connection_id.to_string(), Arc::clone(&entry))
        {
            previous.cancel();
        }
        entry
    }

    /// Return the live entry for `connection_id`, creating it from `make` when absent
    ///
    /// The boolean is `true` when a new entry was created.
    pub fn get_or_insert_with<F>(&self, connection_id: &str, make: F) -> (Arc<ConnectionEntry>, bool)
    where
        F: FnOnce() -> ConnectionState,
    {
        match self.connections.entry(connection_id.to_string()) {
            Entry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
            Entry::Vacant(vacant) => {
                let entry = Arc::new(ConnectionEntry::new(make()));
                vacant.insert(Arc::clone(&entry));
                (entry, true)
            }
        }
    }

    /// Remove and cancel the entry
    pub fn remove(&self, connection_id: &str) -> Option<Arc<ConnectionEntry>> {
        self.connections.remove(connection_id).map(|(_, entry)| {
            entry.cancel();
            entry
        })
    }

    /// Remove the entry only if it is still `expected`
    ///
    /// A worker uses this so it never evicts a newer entry registered under the same id.
    pub fn remove_if_same(&self, connection_id: &str, expected: &Arc<ConnectionEntry>) -> bool {
        let removed = self
            .connections
            .remove_if(connection_id, |_, current| Arc::ptr_eq(current, expected));
        if let Some((_, entry)) = &removed {
            entry.cancel();
        }
        removed.is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}
