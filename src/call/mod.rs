//! Call engine
//!
//! ```text
//!  CallHandle ──commands──▶ session actor ◀──subscription events── SignalingTransport
//!                              │    ▲
//!                 PeerTable ◀──┤    └──PeerEventEnvelope── PeerLink (per peer)
//!                              │
//!        negotiation / media_controller act on one record at a time
//! ```

pub mod channel;
pub mod media_controller;
pub mod membership;
pub mod negotiation;
pub mod peer;
pub mod session;

pub use channel::RoomChannel;
pub use media_controller::MediaController;
pub use membership::MembershipState;
pub use negotiation::{is_polite, OfferOutcome};
pub use peer::{PeerConnectionRecord, PeerTable};
pub use session::{CallHandle, CallSession, CallSessionBuilder, CallSnapshot};
