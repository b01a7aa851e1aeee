//! Event system for real-time state notifications
//!
//! A process-wide event bus broadcasts camera and pipeline events to the
//! WebSocket broker and any other subscriber.

pub mod types;

pub use types::{EntitySource, SystemEvent};

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Global event bus for broadcasting system events
///
/// Built on tokio's broadcast channel; events are delivered to all active
/// subscribers and silently dropped when nobody listens.
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Fire-and-forget: a send error only means there are no subscribers.
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// The receiver uses a ring buffer; a subscriber that falls too far
    /// behind receives a `Lagged` error and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SystemEvent::SnapshotSaved {
            serial: "CAM1".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SystemEvent::SnapshotSaved { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SystemEvent::DriverConnected);

        assert!(matches!(rx1.recv().await, Ok(SystemEvent::DriverConnected)));
        assert!(matches!(rx2.recv().await, Ok(SystemEvent::DriverConnected)));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        // Must not panic with nobody listening
        bus.publish(SystemEvent::DriverConnected);
    }
}
