//! In-process signaling hub
//!
//! Every room is one `tokio::sync::broadcast` channel. Clients created with
//! [`MemoryHub::connect`] never hear their own messages.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::message::RoomId;
use super::transport::{SignalingTransport, Subscription, SubscriptionEvent};
use crate::error::{AppError, Result};

/// Per-room channel capacity
const ROOM_CHANNEL_CAPACITY: usize = 1024;

/// Sender id used by [`MemoryHub::inject`]
const EXTERNAL_SENDER: u64 = 0;

#[derive(Debug, Clone)]
struct Envelope {
    sender: u64,
    payload: String,
}

/// Shared in-process broadcast medium
#[derive(Debug)]
pub struct MemoryHub {
    rooms: Mutex<HashMap<RoomId, broadcast::Sender<Envelope>>>,
    next_client: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(EXTERNAL_SENDER + 1),
        })
    }

    /// Create a client transport attached to this hub
    pub fn connect(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            client_id: self.next_client.fetch_add(1, Ordering::Relaxed),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a raw payload from outside any client
    pub fn inject(&self, room: &RoomId, payload: impl Into<String>) {
        self.send(room, EXTERNAL_SENDER, payload.into());
    }

    /// Number of live receivers on a room
    pub fn subscriber_count(&self, room: &RoomId) -> usize {
        self.rooms
            .lock()
            .get(room)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of rooms with at least one receiver
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    fn join(&self, room: &RoomId) -> broadcast::Receiver<Envelope> {
        self.rooms
            .lock()
            .entry(room.clone())
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop the room once its last receiver is gone
    fn release(&self, room: &RoomId) {
        let mut rooms = self.rooms.lock();
        if rooms.get(room).is_some_and(|tx| tx.receiver_count() == 0) {
            rooms.remove(room);
            debug!("Memory room {} is empty, removed", room);
        }
    }

    fn send(&self, room: &RoomId, sender: u64, payload: String) {
        let rooms = self.rooms.lock();
        if let Some(tx) = rooms.get(room) {
            // No receivers is normal
            let _ = tx.send(Envelope { sender, payload });
        }
    }
}

/// Client handle on a [`MemoryHub`]
#[derive(Debug)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    client_id: u64,
    active: Mutex<HashMap<RoomId, CancellationToken>>,
}

impl MemoryTransport {
    fn ensure_active(&self, room: &RoomId) -> Result<()> {
        if self.active.lock().contains_key(room) {
            Ok(())
        } else {
            Err(AppError::ChannelNotReady(room.to_string()))
        }
    }

    /// Whether this client is subscribed to `room`
    pub fn is_subscribed(&self, room: &RoomId) -> bool {
        self.active.lock().contains_key(room)
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn subscribe(&self, room: &RoomId) -> Result<Subscription> {
        let mut room_rx = self.hub.join(room);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        if let Some(previous) = self.active.lock().insert(room.clone(), cancel.clone()) {
            previous.cancel();
        }

        let client_id = self.client_id;
        let hub = self.hub.clone();
        let room_name = room.clone();
        tokio::spawn(async move {
            let mut open = tx.send(SubscriptionEvent::Subscribed).is_ok();
            while open {
                tokio::select! {
                    _ = cancel.cancelled() => open = false,
                    msg = room_rx.recv() => match msg {
                        Ok(env) if env.sender == client_id => {}
                        Ok(env) => {
                            open = tx.send(SubscriptionEvent::Message(env.payload)).is_ok();
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Memory subscriber on {} lagged by {} messages", room_name, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => open = false,
                    },
                }
            }
            drop(room_rx);
            hub.release(&room_name);
            let _ = tx.send(SubscriptionEvent::Closed);
            debug!("Memory subscription to {} ended", room_name);
        });

        Ok(Subscription::new(room.clone(), rx))
    }

    async fn publish(&self, room: &RoomId, payload: String) -> Result<()> {
        self.publish_now(room, payload)
    }

    fn publish_now(&self, room: &RoomId, payload: String) -> Result<()> {
        self.ensure_active(room)?;
        self.hub.send(room, self.client_id, payload);
        Ok(())
    }

    async fn unsubscribe(&self, room: &RoomId) -> Result<()> {
        if let Some(cancel) = self.active.lock().remove(room) {
            cancel.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn subscribed(transport: &MemoryTransport, room: &RoomId) -> Subscription {
        let mut sub = transport.subscribe(room).await.unwrap();
        assert_eq!(sub.recv().await, Some(SubscriptionEvent::Subscribed));
        sub
    }

    #[tokio::test]
    async fn test_broadcast_without_self_echo() {
        let hub = MemoryHub::new();
        let room = RoomId::from("R1");
        let a = hub.connect();
        let b = hub.connect();

        let mut sub_a = subscribed(&a, &room).await;
        let mut sub_b = subscribed(&b, &room).await;

        a.publish(&room, "hello".into()).await.unwrap();
        a.publish(&room, "world".into()).await.unwrap();

        assert_eq!(sub_b.recv().await, Some(SubscriptionEvent::Message("hello".into())));
        assert_eq!(sub_b.recv().await, Some(SubscriptionEvent::Message("world".into())));

        b.publish(&room, "back".into()).await.unwrap();
        assert_eq!(sub_a.recv().await, Some(SubscriptionEvent::Message("back".into())));
    }

    #[tokio::test]
    async fn test_publish_requires_subscription() {
        let hub = MemoryHub::new();
        let a = hub.connect();
        let err = a.publish(&RoomId::from("R1"), "x".into()).await.unwrap_err();
        assert!(matches!(err, AppError::ChannelNotReady(_)));
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let hub = MemoryHub::new();
        let a = hub.connect();
        let b = hub.connect();
        let r1 = RoomId::from("R1");
        let r2 = RoomId::from("R2");

        let _sub_a = subscribed(&a, &r1).await;
        let mut sub_b = subscribed(&b, &r2).await;

        a.publish(&r1, "only-r1".into()).await.unwrap();
        hub.inject(&r2, "r2");
        assert_eq!(sub_b.recv().await, Some(SubscriptionEvent::Message("r2".into())));
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_and_is_idempotent() {
        let hub = MemoryHub::new();
        let a = hub.connect();
        let room = RoomId::from("R1");
        let mut sub = subscribed(&a, &room).await;

        a.unsubscribe(&room).await.unwrap();
        a.unsubscribe(&room).await.unwrap();

        assert_eq!(sub.recv().await, Some(SubscriptionEvent::Closed));
        assert!(!a.is_subscribed(&room));
        assert!(a.publish_now(&room, "late".into()).is_err());
    }

    #[tokio::test]
    async fn test_empty_rooms_are_pruned() {
        let hub = MemoryHub::new();
        let a = hub.connect();
        let b = hub.connect();
        let room = RoomId::from("R1");

        let mut sub_a = subscribed(&a, &room).await;
        let mut sub_b = subscribed(&b, &room).await;
        assert_eq!(hub.room_count(), 1);

        a.unsubscribe(&room).await.unwrap();
        assert_eq!(sub_a.recv().await, Some(SubscriptionEvent::Closed));
        assert_eq!(hub.room_count(), 1);
        assert_eq!(hub.subscriber_count(&room), 1);

        b.unsubscribe(&room).await.unwrap();
        assert_eq!(sub_b.recv().await, Some(SubscriptionEvent::Closed));
        assert_eq!(hub.room_count(), 0);

        // Injecting into an empty room does not bring it back
        hub.inject(&room, "nobody");
        assert_eq!(hub.room_count(), 0);

        let mut sub_a = subscribed(&a, &room).await;
        hub.inject(&room, "again");
        assert_eq!(sub_a.recv().await, Some(SubscriptionEvent::Message("again".into())));
    }
}
