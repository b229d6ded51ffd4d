//! Call event types
//!
//! Defines the notifications the call session broadcasts to the presentation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signaling::{PeerId, RoomId};

/// Notification emitted by a call session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum CallEvent {
    /// Subscription confirmed and `join` announced
    #[serde(rename = "call.joined")]
    Joined { room_id: RoomId, peer_id: PeerId },

    /// A remote participant announced itself
    #[serde(rename = "peer.joined")]
    PeerJoined { peer_id: PeerId },

    /// A remote participant left or its connection closed
    #[serde(rename = "peer.left")]
    PeerLeft { peer_id: PeerId },

    /// A remote participant turned its camera on or off
    #[serde(rename = "peer.camera_changed")]
    PeerCameraChanged { peer_id: PeerId, camera_on: bool },

    /// Remote media arrived for a participant
    #[serde(rename = "peer.stream_added")]
    RemoteStreamAdded { peer_id: PeerId, stream_id: String },

    /// Offer/answer/candidate handling failed for one participant
    #[serde(rename = "peer.negotiation_failed")]
    NegotiationFailed { peer_id: PeerId, reason: String },

    /// Local participant left the room
    #[serde(rename = "call.left")]
    Left { room_id: RoomId },
}

impl CallEvent {
    /// Event name, as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::Joined { .. } => "call.joined",
            CallEvent::PeerJoined { .. } => "peer.joined",
            CallEvent::PeerLeft { .. } => "peer.left",
            CallEvent::PeerCameraChanged { .. } => "peer.camera_changed",
            CallEvent::RemoteStreamAdded { .. } => "peer.stream_added",
            CallEvent::NegotiationFailed { .. } => "peer.negotiation_failed",
            CallEvent::Left { .. } => "call.left",
        }
    }
}

/// Event with the time it was published
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: CallEvent,
}

impl TimestampedEvent {
    pub fn now(event: CallEvent) -> Self {
        Self {
            at: Utc::now(),
            event,
        }
    }
}
