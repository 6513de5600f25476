//! Event system for session notifications
//!
//! The host subscribes here to learn when a session starts streaming and
//! when (and why) it stopped.

pub mod types;

pub use types::{SessionEvent, StopReason};

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Event bus for broadcasting session events
///
/// Events are delivered to all active subscribers.
///
/// # Example
///
/// ```no_run
/// use whip_streamer::events::{EventBus, SessionEvent, StopReason};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(SessionEvent::Stopped {
///     session_id: "s1".to_string(),
///     reason: StopReason::UserRequested,
///     detail: None,
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers, the event is dropped.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls too far behind receives a `Lagged` error.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
