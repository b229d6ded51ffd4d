//! Signaling: message protocol and room transports
//!
//! ```text
//! CallSession --SignalMessage(JSON)--> SignalingTransport --room broadcast--> peers
//!                                       |- MemoryTransport (in-process hub)
//!                                       `- WsTransport ----> relay server (/ws/:room)
//! ```

pub mod memory;
pub mod message;
pub mod relay;
pub mod transport;
pub mod ws;

pub use memory::{MemoryHub, MemoryTransport};
pub use message::{
    IceCandidate, PeerId, RoomId, SdpKind, SessionDescription, SignalMessage, SignalPayload,
};
pub use relay::{RelayFrame, RelayState, RoomInfo};
pub use transport::{SignalingTransport, Subscription, SubscriptionEvent};
pub use ws::WsTransport;
