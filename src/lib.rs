//! mesh-call - full-mesh call signaling and negotiation
//!
//! Every participant in a room keeps one peer connection to every other
//! participant. Rooms are plain broadcast channels; connection setup uses
//! the perfect negotiation pattern so simultaneous offers never produce
//! duplicate connections.

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod rtc;
pub mod signaling;

pub use error::{AppError, Result};
