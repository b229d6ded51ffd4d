//! Media transport backed by the `webrtc` crate

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::transport::{
    ConnectionState, MediaTransport, PeerEvent, PeerEventSink, PeerLink, RemoteTrack,
    SignalingState,
};
use crate::config::IceConfig;
use crate::error::{AppError, Result};
use crate::media::{LocalTrack, RemoteTrackInfo, TrackKind};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

/// Opus capability used for every outgoing audio track
pub fn audio_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// VP8 capability used for every outgoing video track
pub fn video_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

fn ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    for stun_url in &config.stun_servers {
        servers.push(RTCIceServer {
            urls: vec![stun_url.clone()],
            ..Default::default()
        });
    }
    for turn in &config.turn_servers {
        servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }
    servers
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            return serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": desc.sdp }))
                .map_err(AppError::from)
        }
    };
    result.map_err(|e| AppError::WebRtcError(format!("Invalid SDP {}: {}", desc.kind, e)))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => {
            return Err(AppError::WebRtcError(format!(
                "Unexpected description type: {}",
                other
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

/// RTP sources shared by every connection
///
/// One local track maps to one RTP source, bound to as many peer
/// connections as there are remote participants.
#[derive(Default)]
struct RtpTrackRegistry {
    tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
    handles: Mutex<HashMap<String, LocalTrack>>,
}

impl RtpTrackRegistry {
    fn get_or_create(&self, track: &LocalTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
        let mut tracks = self.tracks.lock();
        let mut handles = self.handles.lock();

        // Drop RTP sources whose capture has stopped
        handles.retain(|id, handle| {
            let alive = !handle.is_ended();
            if !alive {
                tracks.remove(id);
            }
            alive
        });

        tracks
            .entry(track.id().to_string())
            .or_insert_with(|| {
                let codec = match track.kind() {
                    TrackKind::Audio => audio_codec_capability(),
                    TrackKind::Video => video_codec_capability(),
                };
                handles.insert(track.id().to_string(), track.clone());
                Arc::new(TrackLocalStaticSample::new(
                    codec,
                    track.id().to_string(),
                    stream_id.to_string(),
                ))
            })
            .clone()
    }
}

/// Peer connection factory using a real ICE/DTLS/SRTP stack
#[derive(Default)]
pub struct WebRtcTransport {
    registry: Arc<RtpTrackRegistry>,
}

impl WebRtcTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn create(&self, ice: &IceConfig, sink: PeerEventSink) -> Result<Arc<dyn PeerLink>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(ice),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let link = WebRtcLink {
            pc: Arc::new(pc),
            registry: self.registry.clone(),
            sink,
        };
        link.setup_event_handlers();
        info!("Created peer connection to {}", link.sink.peer_id());

        Ok(Arc::new(link))
    }
}

/// One `RTCPeerConnection`
pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    registry: Arc<RtpTrackRegistry>,
    sink: PeerEventSink,
}

impl WebRtcLink {
    fn setup_event_handlers(&self) {
        let sink = self.sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };
                    info!("Peer {} connection state: {}", sink.peer_id(), state);
                    sink.emit(PeerEvent::ConnectionState(state));
                })
            }));

        let sink = self.sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let Some(c) = candidate else {
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => {
                            debug!("ICE candidate for {}: {}", sink.peer_id(), init.candidate);
                            sink.emit(PeerEvent::IceCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                    }
                })
            }));

        let sink = self.sink.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(PeerEvent::NegotiationNeeded);
            })
        }));

        let sink = self.sink.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    let remote = RemoteTrack {
                        stream_id: track.stream_id(),
                        track: RemoteTrackInfo {
                            id: track.id(),
                            kind,
                        },
                    };
                    debug!(
                        "Remote {} track {} from {}",
                        kind,
                        remote.track.id,
                        sink.peer_id()
                    );
                    sink.emit(PeerEvent::Track(remote));
                })
            },
        ));
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<()> {
        let rtp = self.registry.get_or_create(track, stream_id);
        self.pc
            .add_track(rtp as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add {} track: {}", track.kind(), e)))?;
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<&LocalTrack>, stream_id: &str) -> Result<bool> {
        for transceiver in self.pc.get_transceivers().await {
            if transceiver.kind() != RTPCodecType::Video {
                continue;
            }
            // Senders cleared with `None` (or created for receiving only)
            // have no encoding left to bind a new track to
            let sender = transceiver.sender().await;
            if sender.track().await.is_none() {
                continue;
            }

            let replacement = track.map(|t| {
                self.registry.get_or_create(t, stream_id) as Arc<dyn TrackLocal + Send + Sync>
            });
            sender
                .replace_track(replacement)
                .await
                .map_err(|e| AppError::WebRtcError(format!("Failed to replace video track: {}", e)))?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set remote description: {}", e)))
    }

    async fn rollback(&self) -> Result<()> {
        // webrtc-rs parses the SDP of a rollback too, so reuse the pending offer
        let pending = self
            .pc
            .pending_local_description()
            .await
            .ok_or_else(|| AppError::InvalidState("no local offer to roll back".into()))?;
        self.set_local_description(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: pending.sdp,
        })
        .await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;

    #[test]
    fn test_codec_capabilities() {
        let audio = audio_codec_capability();
        assert_eq!(audio.clock_rate, 48000);
        assert_eq!(audio.channels, 2);
        assert_eq!(video_codec_capability().clock_rate, 90000);
    }

    #[test]
    fn test_ice_servers_from_config() {
        let mut config = IceConfig::default();
        config.turn_servers.push(crate::config::TurnServer {
            urls: vec!["turn:turn.example.com:3478".into()],
            username: "user".into(),
            credential: "secret".into(),
        });
        let servers = ice_servers(&config);
        assert_eq!(servers.len(), config.stun_servers.len() + 1);
        assert_eq!(servers.last().unwrap().username, "user");
        assert!(ice_servers(&IceConfig::host_only()).is_empty());
    }

    #[test]
    fn test_rollback_description() {
        let desc = to_rtc_description(SessionDescription::rollback()).unwrap();
        assert_eq!(desc.sdp_type, RTCSdpType::Rollback);
    }

    #[test]
    fn test_registry_reuses_rtp_source() {
        let registry = RtpTrackRegistry::default();
        let cam = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        let first = registry.get_or_create(&cam, "s");
        let second = registry.get_or_create(&cam, "s");
        assert!(Arc::ptr_eq(&first, &second));

        cam.stop();
        let mic = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        registry.get_or_create(&mic, "s");
        assert_eq!(registry.tracks.lock().len(), 1);
    }

    async fn real_pair() -> (Arc<dyn PeerLink>, Arc<dyn PeerLink>) {
        real_pair_on(&WebRtcTransport::new()).await
    }

    async fn real_pair_on(transport: &WebRtcTransport) -> (Arc<dyn PeerLink>, Arc<dyn PeerLink>) {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let a = transport
            .create(
                &IceConfig::host_only(),
                PeerEventSink::new(crate::signaling::PeerId::from("b"), 1, tx.clone()),
            )
            .await
            .unwrap();
        let b = transport
            .create(
                &IceConfig::host_only(),
                PeerEventSink::new(crate::signaling::PeerId::from("a"), 2, tx),
            )
            .await
            .unwrap();
        (a, b)
    }

    async fn negotiate(offerer: &Arc<dyn PeerLink>, answerer: &Arc<dyn PeerLink>) {
        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(offerer.signaling_state(), SignalingState::HaveLocalOffer);

        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();
        assert_eq!(offerer.signaling_state(), SignalingState::Stable);
        assert_eq!(answerer.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_offer_between_real_connections() {
        let (a, b) = real_pair().await;

        let mic = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        a.add_track(&mic, "stream-a").await.unwrap();
        negotiate(&a, &b).await;

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_camera_off_on_and_screen_share() {
        let (a, b) = real_pair().await;
        let mic = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let cam = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        a.add_track(&mic, "stream-a").await.unwrap();
        a.add_track(&cam, "stream-a").await.unwrap();
        negotiate(&a, &b).await;

        // Camera off clears the sender
        assert!(a.replace_video_track(None, "stream-a").await.unwrap());

        // A fresh camera cannot go on the cleared sender; it is added and
        // negotiated instead
        let cam2 = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam2");
        assert!(!a.replace_video_track(Some(&cam2), "stream-a").await.unwrap());
        a.add_track(&cam2, "stream-a").await.unwrap();
        negotiate(&a, &b).await;

        // Screen share swaps the live sender without renegotiating
        let screen = LocalTrack::new(TrackKind::Video, TrackSource::Screen, "screen");
        assert!(a.replace_video_track(Some(&screen), "stream-a").await.unwrap());
        assert!(a.replace_video_track(Some(&cam2), "stream-a").await.unwrap());

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replaced_track_keeps_stream_id() {
        let transport = WebRtcTransport::new();
        let (a, b) = real_pair_on(&transport).await;
        let cam = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        a.add_track(&cam, "stream-a").await.unwrap();
        negotiate(&a, &b).await;

        let screen = LocalTrack::new(TrackKind::Video, TrackSource::Screen, "screen");
        assert!(a.replace_video_track(Some(&screen), "stream-a").await.unwrap());
        let rtp = transport.registry.tracks.lock().get(screen.id()).cloned().unwrap();
        assert_eq!(rtp.stream_id(), "stream-a");
        assert_eq!(rtp.id(), screen.id());

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_screen_share_after_camera_off() {
        let (a, b) = real_pair().await;
        let cam = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        a.add_track(&cam, "stream-a").await.unwrap();
        negotiate(&a, &b).await;
        assert!(a.replace_video_track(None, "stream-a").await.unwrap());

        let screen = LocalTrack::new(TrackKind::Video, TrackSource::Screen, "screen");
        assert!(!a.replace_video_track(Some(&screen), "stream-a").await.unwrap());
        a.add_track(&screen, "stream-a").await.unwrap();
        negotiate(&a, &b).await;

        // Stopping the share with the camera still off clears it again
        assert!(a.replace_video_track(None, "stream-a").await.unwrap());
        assert!(!a.replace_video_track(None, "stream-a").await.unwrap());

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_camera_on_over_receive_only_transceiver() {
        let (a, b) = real_pair().await;
        let cam = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        a.add_track(&cam, "stream-a").await.unwrap();
        // b answers with its camera off
        negotiate(&a, &b).await;

        let b_cam = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "b-cam");
        assert!(!b.replace_video_track(Some(&b_cam), "stream-b").await.unwrap());
        b.add_track(&b_cam, "stream-b").await.unwrap();
        negotiate(&b, &a).await;
        assert!(b.replace_video_track(None, "stream-b").await.unwrap());

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_pending_offer() {
        let (a, _b) = real_pair().await;
        let mic = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        a.add_track(&mic, "stream-a").await.unwrap();

        assert!(a.rollback().await.is_err());

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        a.rollback().await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);

        // A new offer can be made afterwards
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);
        a.close().await.unwrap();
    }
}
