//! Event system for call notifications
//!
//! This module provides the event bus a call session uses to tell the
//! presentation layer about membership and media changes.

pub mod types;

pub use types::{CallEvent, TimestampedEvent};

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event bus for broadcasting call events
///
/// # Example
///
/// ```no_run
/// use mesh_call::events::{CallEvent, EventBus};
/// use mesh_call::signaling::PeerId;
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(CallEvent::PeerJoined { peer_id: PeerId::from("bbb") });
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{} at {}", event.event.name(), event.at);
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<TimestampedEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub fn publish(&self, event: CallEvent) {
        let _ = self.tx.send(TimestampedEvent::now(event));
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls too far behind receives a `Lagged` error.
    pub fn subscribe(&self) -> broadcast::Receiver<TimestampedEvent> {
        self.tx.subscribe()
    }

    /// Get the current number of active subscribers
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
    use crate::signaling::PeerId;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(CallEvent::PeerJoined {
            peer_id: PeerId::from("bbb"),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.event, CallEvent::PeerJoined { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(CallEvent::PeerLeft {
            peer_id: PeerId::from("ccc"),
        });

        assert!(matches!(rx1.recv().await.unwrap().event, CallEvent::PeerLeft { .. }));
        assert!(matches!(rx2.recv().await.unwrap().event, CallEvent::PeerLeft { .. }));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(CallEvent::PeerLeft {
            peer_id: PeerId::from("ccc"),
        });
    }
}
