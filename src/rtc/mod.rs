//! Peer connection capability and its backends
//!
//! - [`WebRtcTransport`]: real connections via the `webrtc` crate
//! - [`LoopbackTransport`]: in-memory offer/answer state machine for
//!   headless participants and tests

pub mod loopback;
pub mod transport;
pub mod webrtc_backend;

pub use loopback::{LoopbackLink, LoopbackTransport};
pub use transport::{
    ConnectionState, MediaTransport, PeerEvent, PeerEventEnvelope, PeerEventSink, PeerLink,
    RemoteTrack, SignalingState,
};
pub use webrtc_backend::{WebRtcLink, WebRtcTransport};
