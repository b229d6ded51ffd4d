//! Signaling transport capability
//!
//! A room-scoped publish/subscribe channel. Delivery is at-least-once;
//! messages from one sender arrive in send order, with no ordering across
//! senders.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::message::RoomId;
use crate::error::Result;

/// Event delivered on a room subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// Subscription is active; publishing is now safe
    Subscribed,
    /// Opaque payload published by another participant
    Message(String),
    /// Channel closed by the transport
    Closed,
}

/// Active subscription to a room
#[derive(Debug)]
pub struct Subscription {
    room_id: RoomId,
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
}

impl Subscription {
    pub fn new(room_id: RoomId, events: mpsc::UnboundedReceiver<SubscriptionEvent>) -> Self {
        Self { room_id, events }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Next event, `None` once the transport dropped its side
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }
}

/// Room-scoped broadcast channel
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Subscribe to a room
    ///
    /// The returned subscription yields [`SubscriptionEvent::Subscribed`]
    /// once the channel can hear replies.
    async fn subscribe(&self, room: &RoomId) -> Result<Subscription>;

    /// Publish a payload to every other subscriber of the room
    async fn publish(&self, room: &RoomId, payload: String) -> Result<()>;

    /// Best-effort publish that never waits
    ///
    /// Used on teardown paths that must not block (page hide, process exit).
    fn publish_now(&self, room: &RoomId, payload: String) -> Result<()>;

    /// Drop the room subscription. Unsubscribing twice is not an error.
    async fn unsubscribe(&self, room: &RoomId) -> Result<()>;
}
