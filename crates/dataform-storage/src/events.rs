//! Record change notifications.
//!
//! Backends publish a [`RecordEvent`] after every successful change through an
//! [`EventBroadcaster`]. It wraps a tokio broadcast channel, so every
//! subscriber sees every event sent after it subscribed, and a subscriber
//! that falls behind by more than the buffer receives `Lagged` instead of
//! the dropped events.

use std::fmt;
use std::sync::Arc;

use dataform_core::Record;
use tokio::sync::broadcast;

/// Default buffer size for the broadcast channel.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Type of record change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordEventType {
    Added,
    Updated,
    Deleted,
}

impl RecordEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordEventType::Added => "added",
            RecordEventType::Updated => "updated",
            RecordEventType::Deleted => "deleted",
        }
    }
}

impl fmt::Display for RecordEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change observed in the record store.
///
/// Records are shared snapshots and must not be mutated by receivers.
#[derive(Debug, Clone)]
pub enum RecordEvent {
    /// A record appeared.
    Added(Arc<Record>),
    /// A record changed; `old` is the previous snapshot.
    Updated { old: Arc<Record>, new: Arc<Record> },
    /// A record was removed; carries its last known state.
    Deleted(Arc<Record>),
}

impl RecordEvent {
    pub fn event_type(&self) -> RecordEventType {
        match self {
            RecordEvent::Added(_) => RecordEventType::Added,
            RecordEvent::Updated { .. } => RecordEventType::Updated,
            RecordEvent::Deleted(_) => RecordEventType::Deleted,
        }
    }

    /// The most recent state carried by the event.
    pub fn record(&self) -> &Arc<Record> {
        match self {
            RecordEvent::Added(record) => record,
            RecordEvent::Updated { new, .. } => new,
            RecordEvent::Deleted(record) => record,
        }
    }
}

/// Broadcaster for record events.
///
/// Cheap to clone; all clones feed the same channel.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<RecordEvent>,
}

impl EventBroadcaster {
    /// Create a new broadcaster with default buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a new broadcaster with custom buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, 0 when
    /// nobody is listening.
    pub fn send(&self, event: RecordEvent) -> usize {
        self.sender.send(event).unwrap_or_default()
    }

    pub fn send_added(&self, record: Arc<Record>) -> usize {
        self.send(RecordEvent::Added(record))
    }

    pub fn send_updated(&self, old: Arc<Record>, new: Arc<Record>) -> usize {
        self.send(RecordEvent::Updated { old, new })
    }

    pub fn send_deleted(&self, record: Arc<Record>) -> usize {
        self.send(RecordEvent::Deleted(record))
    }

    /// Subscribe to events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
