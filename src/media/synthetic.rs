//! Device-free media source
//!
//! Produces tracks without touching capture hardware. Headless participants
//! use it to take part in signaling, and tests use it to script permission
//! and device failures.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use super::source::{LocalMediaSource, MediaConstraints};
use super::track::{LocalStream, LocalTrack, TrackKind, TrackSource};
use crate::error::{AppError, Result};

/// Scripted acquisition failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticFailure {
    PermissionDenied,
    NoDevice,
}

impl SyntheticFailure {
    fn to_error(self, what: &str) -> AppError {
        match self {
            SyntheticFailure::PermissionDenied => {
                AppError::MediaPermissionDenied(format!("{} access was refused", what))
            }
            SyntheticFailure::NoDevice => {
                AppError::MediaDeviceNotFound(format!("no {} device available", what))
            }
        }
    }
}

/// Synthetic camera/microphone/screen source
#[derive(Debug, Default)]
pub struct SyntheticMediaSource {
    capture_failure: Mutex<Option<SyntheticFailure>>,
    display_failure: Mutex<Option<SyntheticFailure>>,
    last_display: Mutex<Option<LocalTrack>>,
    acquisitions: AtomicUsize,
}

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make camera/microphone acquisition fail (or succeed again with `None`)
    pub fn set_capture_failure(&self, failure: Option<SyntheticFailure>) {
        *self.capture_failure.lock() = failure;
    }

    /// Make display capture fail (or succeed again with `None`)
    pub fn set_display_failure(&self, failure: Option<SyntheticFailure>) {
        *self.display_failure.lock() = failure;
    }

    /// Number of successful camera/microphone acquisitions
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Most recent display-capture track, e.g. to end it externally
    pub fn last_display_capture(&self) -> Option<LocalTrack> {
        self.last_display.lock().clone()
    }
}

#[async_trait]
impl LocalMediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream> {
        if !constraints.audio && !constraints.video {
            return Err(AppError::MediaError(
                "at least one of audio or video must be requested".into(),
            ));
        }
        if let Some(failure) = *self.capture_failure.lock() {
            let what = if constraints.video { "camera" } else { "microphone" };
            return Err(failure.to_error(what));
        }

        let mut tracks = Vec::with_capacity(2);
        if constraints.audio {
            tracks.push(LocalTrack::new(
                TrackKind::Audio,
                TrackSource::Microphone,
                "synthetic microphone",
            ));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(
                TrackKind::Video,
                TrackSource::Camera,
                format!("synthetic camera {}x{}", constraints.width, constraints.height),
            ));
        }

        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        debug!("Synthetic capture acquired {} track(s)", tracks.len());
        Ok(LocalStream::new(tracks))
    }

    async fn acquire_display_capture(&self) -> Result<LocalTrack> {
        if let Some(failure) = *self.display_failure.lock() {
            return Err(failure.to_error("display"));
        }
        let track = LocalTrack::new(TrackKind::Video, TrackSource::Screen, "synthetic screen");
        *self.last_display.lock() = Some(track.clone());
        Ok(track)
    }
}
