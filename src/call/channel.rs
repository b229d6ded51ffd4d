use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::Result;
use crate::signaling::{PeerId, RoomId, SignalMessage, SignalPayload, SignalingTransport};

/// Outgoing side of one room, stamped with the local peer id
#[derive(Clone)]
pub struct RoomChannel {
    transport: Arc<dyn SignalingTransport>,
    room_id: RoomId,
    local_id: PeerId,
}

impl RoomChannel {
    pub fn new(transport: Arc<dyn SignalingTransport>, room_id: RoomId, local_id: PeerId) -> Self {
        Self {
            transport,
            room_id,
            local_id,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Publish a message to the whole room
    pub async fn broadcast(&self, payload: SignalPayload) -> Result<()> {
        self.send(SignalMessage::broadcast(&self.local_id, payload))
            .await
    }

    /// Publish a message meant for `to` only
    pub async fn unicast(&self, to: &PeerId, payload: SignalPayload) -> Result<()> {
        self.send(SignalMessage::unicast(&self.local_id, to, payload))
            .await
    }

    async fn send(&self, message: SignalMessage) -> Result<()> {
        let payload = message.encode()?;
        trace!("Publishing to {}: {}", self.room_id, payload);
        self.transport.publish(&self.room_id, payload).await
    }

    /// Best-effort leave notification that does not wait
    pub fn announce_leave_now(&self) {
        let result = SignalMessage::leave(&self.local_id)
            .encode()
            .and_then(|payload| self.transport.publish_now(&self.room_id, payload));
        if let Err(e) = result {
            debug!("Leave notification for {} not sent: {}", self.room_id, e);
        }
    }
}
