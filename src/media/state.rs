use super::track::{LocalStream, LocalTrack};

/// Local participant's media state
///
/// Owned by the call session and mutated only in response to toggle
/// requests. The camera track doubles as the saved track restored when a
/// screen share stops.
#[derive(Debug, Clone)]
pub struct LocalMediaState {
    pub audio_enabled: bool,
    pub camera_on: bool,
    pub screen_sharing: bool,
    pub stream: LocalStream,
    pub audio_track: Option<LocalTrack>,
    pub camera_track: Option<LocalTrack>,
    pub screen_track: Option<LocalTrack>,
}

impl LocalMediaState {
    pub fn from_stream(stream: LocalStream) -> Self {
        let audio_track = stream.audio_track().cloned();
        let camera_track = stream.video_track().cloned();
        Self {
            audio_enabled: audio_track.as_ref().map(|t| t.is_enabled()).unwrap_or(false),
            camera_on: camera_track.is_some(),
            screen_sharing: false,
            stream,
            audio_track,
            camera_track,
            screen_track: None,
        }
    }

    /// Track every outgoing video sender should carry
    pub fn active_video_track(&self) -> Option<&LocalTrack> {
        if self.screen_sharing {
            self.screen_track.as_ref()
        } else if self.camera_on {
            self.camera_track.as_ref()
        } else {
            None
        }
    }

    /// Tracks to attach to a freshly created peer connection
    pub fn outgoing_tracks(&self) -> Vec<LocalTrack> {
        self.audio_track
            .iter()
            .chain(self.active_video_track())
            .cloned()
            .collect()
    }

    /// Rebuild the published local stream from the current tracks
    ///
    /// The local preview shows the camera, never the screen capture.
    pub fn refresh_stream(&mut self) {
        let mut tracks: Vec<LocalTrack> = self.audio_track.iter().cloned().collect();
        if self.camera_on {
            tracks.extend(self.camera_track.iter().cloned());
        }
        self.stream = self.stream.with_tracks(tracks);
    }

    /// Stop every local capture
    pub fn stop_all(&mut self) {
        for track in self
            .audio_track
            .iter()
            .chain(self.camera_track.iter())
            .chain(self.screen_track.iter())
        {
            track.stop();
        }
        self.stream.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{TrackKind, TrackSource};

    fn state() -> LocalMediaState {
        LocalMediaState::from_stream(LocalStream::new(vec![
            LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic"),
            LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam"),
        ]))
    }

    #[test]
    fn test_active_video_prefers_screen() {
        let mut state = state();
        assert_eq!(state.active_video_track().unwrap().label(), "cam");

        state.screen_track = Some(LocalTrack::new(TrackKind::Video, TrackSource::Screen, "screen"));
        state.screen_sharing = true;
        assert_eq!(state.active_video_track().unwrap().label(), "screen");

        state.screen_sharing = false;
        state.camera_on = false;
        assert!(state.active_video_track().is_none());
        assert_eq!(state.outgoing_tracks().len(), 1);
    }

    #[test]
    fn test_stop_all() {
        let mut state = state();
        let camera = state.camera_track.clone().unwrap();
        state.stop_all();
        assert!(camera.is_ended());
    }
}
