//! Local media source capability

use async_trait::async_trait;

use super::track::{LocalStream, LocalTrack};
use crate::config::MediaConfig;
use crate::error::Result;

/// What to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub width: u32,
    pub height: u32,
}

impl MediaConstraints {
    /// Camera only, used when re-enabling video
    pub fn video_only(config: &MediaConfig) -> Self {
        Self {
            audio: false,
            video: true,
            width: config.width,
            height: config.height,
        }
    }
}

impl From<&MediaConfig> for MediaConstraints {
    fn from(config: &MediaConfig) -> Self {
        Self {
            audio: config.audio,
            video: config.video,
            width: config.width,
            height: config.height,
        }
    }
}

/// Acquires camera, microphone and screen-capture tracks
///
/// Implementations report a refused permission as
/// [`AppError::MediaPermissionDenied`](crate::AppError::MediaPermissionDenied) and a missing
/// device as [`AppError::MediaDeviceNotFound`](crate::AppError::MediaDeviceNotFound).
#[async_trait]
pub trait LocalMediaSource: Send + Sync {
    /// Capture microphone and/or camera
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream>;

    /// Capture the screen as a single video track
    ///
    /// The returned track ends with `EndReason::CaptureEnded` when the user
    /// stops sharing from outside the application.
    async fn acquire_display_capture(&self) -> Result<LocalTrack>;
}
