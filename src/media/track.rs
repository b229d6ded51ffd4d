//! Local and remote media track handles

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Where a local track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

/// Why a track ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Stopped by this process
    Stopped,
    /// Capture ended outside our control (e.g. user stopped screen sharing)
    CaptureEnded,
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<Option<EndReason>>,
}

/// Shared handle on one local media track
///
/// Clones refer to the same track: disabling or stopping through one clone
/// is visible through all of them, including every peer connection sender
/// the track is attached to.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, source: TrackSource, label: impl Into<String>) -> Self {
        let (ended, _) = watch::channel(None);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                source,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Mute/unmute without detaching the track
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Release the capture device. Stopping twice is a no-op.
    pub fn stop(&self) {
        self.finish(EndReason::Stopped);
    }

    /// Signal that capture ended externally
    pub fn end(&self) {
        self.finish(EndReason::CaptureEnded);
    }

    fn finish(&self, reason: EndReason) {
        self.inner.ended.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.borrow().is_some()
    }

    /// Resolves once the track has ended, for whatever reason
    pub async fn ended(&self) -> EndReason {
        let mut rx = self.inner.ended.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return EndReason::Stopped;
            }
        }
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for LocalTrack {}

/// Group of local tracks presented as one stream
#[derive(Debug, Clone, PartialEq)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// Same stream id with a different track set
    pub fn with_tracks(&self, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: self.id.clone(),
            tracks,
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Remote track as announced by the media transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub kind: TrackKind,
}

/// Remote participant's incoming media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrackInfo>,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: vec![],
        }
    }

    /// Add a track unless it is already present
    pub fn add_track(&mut self, track: RemoteTrackInfo) {
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_flag_is_shared() {
        let track = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let clone = track.clone();
        clone.set_enabled(false);
        assert!(!track.is_enabled());
        assert_eq!(track, clone);
    }

    #[tokio::test]
    async fn test_end_reason_first_wins() {
        let track = LocalTrack::new(TrackKind::Video, TrackSource::Screen, "screen");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };

        track.end();
        track.stop();

        assert_eq!(waiter.await.unwrap(), EndReason::CaptureEnded);
        assert_eq!(track.ended().await, EndReason::CaptureEnded);
        assert!(track.is_ended());
    }

    #[test]
    fn test_ended_pending_until_stopped() {
        let track = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let mut ended = tokio_test::task::spawn(track.ended());
        tokio_test::assert_pending!(ended.poll());

        track.stop();
        assert!(ended.is_woken());
        tokio_test::assert_ready_eq!(ended.poll(), EndReason::Stopped);
    }

    #[test]
    fn test_remote_stream_dedups_tracks() {
        let mut stream = RemoteStream::new("s1");
        let audio = RemoteTrackInfo {
            id: "a".into(),
            kind: TrackKind::Audio,
        };
        stream.add_track(audio.clone());
        stream.add_track(audio);
        assert_eq!(stream.tracks.len(), 1);
        assert!(stream.has_kind(TrackKind::Audio));
        assert!(!stream.has_kind(TrackKind::Video));
    }
}
