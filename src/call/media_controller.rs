//! Local media toggles and their propagation to every peer connection

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::channel::RoomChannel;
use super::negotiation::make_offer;
use super::peer::PeerTable;
use crate::config::MediaConfig;
use crate::error::{AppError, Result};
use crate::media::{LocalMediaSource, LocalMediaState, LocalTrack, MediaConstraints};
use crate::signaling::{PeerId, SignalPayload};

/// Peers whose renegotiation failed during a toggle
pub type NegotiationFailures = Vec<(PeerId, AppError)>;

/// Applies microphone, camera and screen-share changes
pub struct MediaController {
    source: Arc<dyn LocalMediaSource>,
    config: MediaConfig,
    reacquire_delay: Duration,
}

impl MediaController {
    pub fn new(source: Arc<dyn LocalMediaSource>, config: MediaConfig, reacquire_delay: Duration) -> Self {
        Self {
            source,
            config,
            reacquire_delay,
        }
    }

    /// Acquire camera and microphone for a new call
    pub async fn acquire_initial(&self) -> Result<LocalMediaState> {
        let stream = self
            .source
            .acquire(&MediaConstraints::from(&self.config))
            .await?;
        info!("Acquired local media ({} tracks)", stream.tracks().len());
        Ok(LocalMediaState::from_stream(stream))
    }

    /// Flip the microphone's enabled flag; returns whether audio is now on
    ///
    /// The track stays attached, so no renegotiation is needed.
    pub fn toggle_mic(&self, media: &mut LocalMediaState) -> bool {
        media.audio_enabled = !media.audio_enabled;
        if let Some(track) = &media.audio_track {
            track.set_enabled(media.audio_enabled);
        }
        info!("Microphone {}", if media.audio_enabled { "on" } else { "muted" });
        media.audio_enabled
    }

    /// Stop the camera and tell peers to show a placeholder
    pub async fn camera_off(
        &self,
        media: &mut LocalMediaState,
        peers: &mut PeerTable,
        channel: &RoomChannel,
    ) -> NegotiationFailures {
        if let Some(track) = media.camera_track.take() {
            track.stop();
        }
        media.camera_on = false;
        media.refresh_stream();

        let failures = if media.screen_sharing {
            Vec::new()
        } else {
            route_video(media, peers, channel, false).await
        };

        publish_camera_state(channel, false).await;
        info!("Camera off");
        failures
    }

    /// Acquire a fresh camera track and renegotiate with every peer
    ///
    /// A stopped capture cannot be resumed, so the camera is re-acquired.
    /// On failure the camera stays off.
    pub async fn camera_on(
        &self,
        media: &mut LocalMediaState,
        peers: &mut PeerTable,
        channel: &RoomChannel,
    ) -> Result<NegotiationFailures> {
        if !self.reacquire_delay.is_zero() {
            tokio::time::sleep(self.reacquire_delay).await;
        }

        let stream = self
            .source
            .acquire(&MediaConstraints::video_only(&self.config))
            .await?;
        let track = stream
            .video_track()
            .cloned()
            .ok_or_else(|| AppError::MediaDeviceNotFound("no camera track returned".into()))?;

        media.camera_track = Some(track);
        media.camera_on = true;
        media.refresh_stream();

        let failures = if media.screen_sharing {
            Vec::new()
        } else {
            route_video(media, peers, channel, true).await
        };

        publish_camera_state(channel, true).await;
        info!("Camera on");
        Ok(failures)
    }

    /// Replace outgoing video with a screen capture
    ///
    /// Returns the capture track so the caller can watch for it ending.
    pub async fn start_screen_share(
        &self,
        media: &mut LocalMediaState,
        peers: &mut PeerTable,
        channel: &RoomChannel,
    ) -> Result<(LocalTrack, NegotiationFailures)> {
        let track = self.source.acquire_display_capture().await?;
        media.screen_track = Some(track.clone());
        media.screen_sharing = true;

        let failures = route_video(media, peers, channel, false).await;
        info!("Screen sharing started");
        Ok((track, failures))
    }

    /// Put the camera (or nothing, if it is off) back on every sender
    pub async fn stop_screen_share(
        &self,
        media: &mut LocalMediaState,
        peers: &mut PeerTable,
        channel: &RoomChannel,
    ) -> NegotiationFailures {
        if let Some(track) = media.screen_track.take() {
            track.stop();
        }
        media.screen_sharing = false;

        let failures = route_video(media, peers, channel, false).await;
        info!("Screen sharing stopped");
        failures
    }
}

/// Point every connection's video sender at the currently active video
///
/// Connections without a live video sender get the track added and are
/// renegotiated; with `renegotiate` set every connection is.
async fn route_video(
    media: &LocalMediaState,
    peers: &mut PeerTable,
    channel: &RoomChannel,
    renegotiate: bool,
) -> NegotiationFailures {
    let target = media.active_video_track().cloned();
    let mut failures = Vec::new();
    let mut needs_offer = HashSet::new();

    for record in peers.records_mut() {
        let replaced = record
            .link
            .replace_video_track(target.as_ref(), media.stream.id())
            .await;
        match replaced {
            Ok(true) => {
                if renegotiate {
                    needs_offer.insert(record.peer_id.clone());
                }
            }
            Ok(false) => {
                let Some(track) = &target else {
                    continue;
                };
                match record.link.add_track(track, media.stream.id()).await {
                    Ok(()) => {
                        needs_offer.insert(record.peer_id.clone());
                    }
                    Err(e) => {
                        warn!("Failed to add video track for {}: {}", record.peer_id, e);
                        failures.push((record.peer_id.clone(), e));
                    }
                }
            }
            Err(e) => {
                warn!("Failed to replace video track for {}: {}", record.peer_id, e);
                failures.push((record.peer_id.clone(), e));
            }
        }
    }

    for record in peers
        .records_mut()
        .filter(|record| needs_offer.contains(&record.peer_id))
    {
        if let Err(e) = make_offer(record, channel).await {
            warn!("Renegotiation with {} failed: {}", record.peer_id, e);
            failures.push((record.peer_id.clone(), e));
        }
    }

    failures
}

async fn publish_camera_state(channel: &RoomChannel, camera_on: bool) {
    if let Err(e) = channel
        .broadcast(SignalPayload::CameraState { camera_on })
        .await
    {
        debug!("camera-state not published: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::peer::PeerConnectionRecord;
    use crate::media::{SyntheticFailure, SyntheticMediaSource, TrackKind};
    use crate::rtc::{LoopbackLink, PeerEventSink, PeerLink};
    use crate::signaling::{MemoryHub, RoomId, SignalingTransport};
    use tokio::sync::mpsc;

    struct Fixture {
        source: Arc<SyntheticMediaSource>,
        controller: MediaController,
        media: LocalMediaState,
        peers: PeerTable,
        link: Arc<LoopbackLink>,
        channel: RoomChannel,
    }

    async fn fixture() -> Fixture {
        let source = Arc::new(SyntheticMediaSource::new());
        let controller = MediaController::new(source.clone(), MediaConfig::default(), Duration::ZERO);
        let media = controller.acquire_initial().await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = PeerId::from("bbb");
        let link = Arc::new(LoopbackLink::new(1, PeerEventSink::new(peer.clone(), 1, tx)));
        for track in media.outgoing_tracks() {
            link.add_track(&track, media.stream.id()).await.unwrap();
        }
        let mut peers = PeerTable::new();
        peers.insert(PeerConnectionRecord::new(peer, 1, link.clone()));

        let hub = MemoryHub::new();
        let transport: Arc<dyn SignalingTransport> = Arc::new(hub.connect());
        let room = RoomId::from("R1");
        transport.subscribe(&room).await.unwrap();

        Fixture {
            source,
            controller,
            media,
            peers,
            link,
            channel: RoomChannel::new(transport, room, PeerId::from("aaa")),
        }
    }

    #[tokio::test]
    async fn test_toggle_mic_flips_track() {
        let mut f = fixture().await;
        let mic = f.media.audio_track.clone().unwrap();
        assert!(!f.controller.toggle_mic(&mut f.media));
        assert!(!mic.is_enabled());
        assert!(f.controller.toggle_mic(&mut f.media));
        assert!(mic.is_enabled());
    }

    #[tokio::test]
    async fn test_camera_round_trip() {
        let mut f = fixture().await;
        let original = f.media.camera_track.clone().unwrap();

        f.controller
            .camera_off(&mut f.media, &mut f.peers, &f.channel)
            .await;
        assert!(original.is_ended());
        assert!(f.link.video_track().is_none());
        assert!(f.media.stream.video_track().is_none());

        f.controller
            .camera_on(&mut f.media, &mut f.peers, &f.channel)
            .await
            .unwrap();
        assert!(f.media.camera_on);
        assert_eq!(f.link.active_tracks(TrackKind::Video).len(), 1);
        assert_eq!(f.link.video_track(), f.media.camera_track);
        assert_ne!(f.media.camera_track.as_ref(), Some(&original));
    }

    #[tokio::test]
    async fn test_camera_on_failure_keeps_camera_off() {
        let mut f = fixture().await;
        f.controller
            .camera_off(&mut f.media, &mut f.peers, &f.channel)
            .await;

        f.source.set_capture_failure(Some(SyntheticFailure::NoDevice));
        let err = f
            .controller
            .camera_on(&mut f.media, &mut f.peers, &f.channel)
            .await
            .unwrap_err();
        assert!(err.is_media_failure());
        assert!(!f.media.camera_on);
    }

    #[tokio::test]
    async fn test_screen_share_replaces_and_restores() {
        let mut f = fixture().await;
        let camera = f.media.camera_track.clone();

        let (screen, failures) = f
            .controller
            .start_screen_share(&mut f.media, &mut f.peers, &f.channel)
            .await
            .unwrap();
        assert!(failures.is_empty());
        assert_eq!(f.link.video_track(), Some(screen.clone()));
        // Preview keeps showing the camera
        assert_eq!(f.media.stream.video_track(), camera.as_ref());

        f.controller
            .stop_screen_share(&mut f.media, &mut f.peers, &f.channel)
            .await;
        assert!(screen.is_ended());
        assert_eq!(f.link.video_track(), camera);
    }

    #[tokio::test]
    async fn test_camera_off_while_sharing_keeps_screen() {
        let mut f = fixture().await;
        let (screen, _) = f
            .controller
            .start_screen_share(&mut f.media, &mut f.peers, &f.channel)
            .await
            .unwrap();

        f.controller
            .camera_off(&mut f.media, &mut f.peers, &f.channel)
            .await;
        assert_eq!(f.link.video_track(), Some(screen));

        f.controller
            .stop_screen_share(&mut f.media, &mut f.peers, &f.channel)
            .await;
        assert!(f.link.video_track().is_none());
    }
}
