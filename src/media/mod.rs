//! Local media: tracks, capture sources and the local media state

pub mod source;
pub mod state;
pub mod synthetic;
pub mod track;

pub use source::{LocalMediaSource, MediaConstraints};
pub use state::LocalMediaState;
pub use synthetic::{SyntheticFailure, SyntheticMediaSource};
pub use track::{
    EndReason, LocalStream, LocalTrack, RemoteStream, RemoteTrackInfo, TrackKind, TrackSource,
};
