//! Media transport capability
//!
//! The peer connection itself (codecs, ICE, encryption) is opaque. The call
//! engine only drives descriptions, candidates and senders through
//! [`PeerLink`], and hears back through [`PeerEventSink`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::IceConfig;
use crate::error::Result;
use crate::media::{LocalTrack, RemoteTrackInfo};
use crate::signaling::{IceCandidate, PeerId, SessionDescription};

/// Offer/answer signaling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingState::Stable => write!(f, "stable"),
            SignalingState::HaveLocalOffer => write!(f, "have-local-offer"),
            SignalingState::HaveRemoteOffer => write!(f, "have-remote-offer"),
            SignalingState::HaveLocalPranswer => write!(f, "have-local-pranswer"),
            SignalingState::HaveRemotePranswer => write!(f, "have-remote-pranswer"),
            SignalingState::Closed => write!(f, "closed"),
        }
    }
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Remote track arrival
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub stream_id: String,
    pub track: RemoteTrackInfo,
}

/// Asynchronous notification from a peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Remote media arrived
    Track(RemoteTrack),
    /// Local ICE candidate gathered; must be sent to the remote peer
    IceCandidate(IceCandidate),
    /// Local changes require a new offer/answer round
    NegotiationNeeded,
    /// Connection state changed
    ConnectionState(ConnectionState),
}

/// Peer event stamped with its origin
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEventEnvelope {
    pub peer_id: PeerId,
    /// Identifies the connection instance; a recreated record gets a new id
    pub link_id: u64,
    pub event: PeerEvent,
}

/// Where a peer connection reports its events
///
/// Each connection gets its own sink carrying the remote peer id explicitly,
/// so events from a torn-down connection can be recognised and dropped.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer_id: PeerId,
    link_id: u64,
    tx: mpsc::UnboundedSender<PeerEventEnvelope>,
}

impl PeerEventSink {
    pub fn new(peer_id: PeerId, link_id: u64, tx: mpsc::UnboundedSender<PeerEventEnvelope>) -> Self {
        Self {
            peer_id,
            link_id,
            tx,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Deliver an event; dropped if the session is gone
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(PeerEventEnvelope {
            peer_id: self.peer_id.clone(),
            link_id: self.link_id,
            event,
        });
    }
}

/// One opaque peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach a local track as part of stream `stream_id`
    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<()>;

    /// Swap the track on the live video sender without renegotiating
    ///
    /// Returns `false` when no video sender currently carries a track. A
    /// sender cleared with `None` cannot take a track back, so the caller
    /// has to `add_track` and renegotiate instead.
    async fn replace_video_track(&self, track: Option<&LocalTrack>, stream_id: &str) -> Result<bool>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Discard a pending local offer
    async fn rollback(&self) -> Result<()> {
        self.set_local_description(SessionDescription::rollback())
            .await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self) -> Result<()>;
}

/// Factory for peer connections
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn create(&self, ice: &IceConfig, sink: PeerEventSink) -> Result<Arc<dyn PeerLink>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_state_names() {
        assert_eq!(SignalingState::HaveLocalOffer.to_string(), "have-local-offer");
        assert_eq!(
            serde_json::to_string(&SignalingState::HaveRemoteOffer).unwrap(),
            "\"have-remote-offer\""
        );
    }

    #[tokio::test]
    async fn test_sink_stamps_origin() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = PeerEventSink::new(PeerId::from("bbb"), 7, tx);
        sink.emit(PeerEvent::NegotiationNeeded);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.peer_id, PeerId::from("bbb"));
        assert_eq!(envelope.link_id, 7);
        assert_eq!(envelope.event, PeerEvent::NegotiationNeeded);
    }
}
