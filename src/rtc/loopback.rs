//! Deterministic in-memory media transport
//!
//! Implements the offer/answer state machine of a real peer connection over
//! a small textual pseudo-SDP:
//!
//! ```text
//! v=loopback
//! o=<link uid> <version>
//! m=<mid> <kind> <stream id|-> <track id|->
//! ```
//!
//! Applying a remote description that carries media reports remote tracks,
//! every local description yields one host candidate, and adding a track to
//! an already negotiated connection asks for renegotiation. No packets flow.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::transport::{
    ConnectionState, MediaTransport, PeerEvent, PeerEventSink, PeerLink, RemoteTrack,
    SignalingState,
};
use crate::config::IceConfig;
use crate::error::{AppError, Result};
use crate::media::{LocalTrack, RemoteTrackInfo, TrackKind};
use crate::signaling::{IceCandidate, PeerId, SdpKind, SessionDescription};

const SDP_HEADER: &str = "v=loopback";

#[derive(Debug, Clone, PartialEq, Eq)]
struct MediaLine {
    mid: String,
    kind: TrackKind,
    /// (stream id, track id) of the sending side, if it sends
    msid: Option<(String, String)>,
}

fn render_sdp(owner: u64, version: u64, lines: &[MediaLine]) -> String {
    let mut sdp = format!("{}\no={} {}\n", SDP_HEADER, owner, version);
    for line in lines {
        let (stream, track) = match &line.msid {
            Some((stream, track)) => (stream.as_str(), track.as_str()),
            None => ("-", "-"),
        };
        sdp.push_str(&format!("m={} {} {} {}\n", line.mid, line.kind, stream, track));
    }
    sdp
}

fn parse_sdp(sdp: &str) -> Result<Vec<MediaLine>> {
    let mut lines = sdp.lines();
    if lines.next() != Some(SDP_HEADER) {
        return Err(AppError::WebRtcError("not a loopback session description".into()));
    }

    let mut media = Vec::new();
    for line in lines {
        let Some(rest) = line.strip_prefix("m=") else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let [mid, kind, stream, track] = fields.as_slice() else {
            return Err(AppError::WebRtcError(format!("malformed media line: {}", line)));
        };
        let kind = match *kind {
            "audio" => TrackKind::Audio,
            "video" => TrackKind::Video,
            other => {
                return Err(AppError::WebRtcError(format!("unknown media kind: {}", other)))
            }
        };
        let msid = match (*stream, *track) {
            ("-", _) | (_, "-") => None,
            (stream, track) => Some((stream.to_string(), track.to_string())),
        };
        media.push(MediaLine {
            mid: mid.to_string(),
            kind,
            msid,
        });
    }
    Ok(media)
}

#[derive(Debug, Clone)]
struct Transceiver {
    mid: Option<String>,
    kind: TrackKind,
    msid: Option<(String, String)>,
    track: Option<LocalTrack>,
    negotiated: bool,
}

#[derive(Debug)]
struct LinkState {
    signaling: SignalingState,
    transceivers: Vec<Transceiver>,
    has_remote: bool,
    established: bool,
    reported_tracks: HashSet<String>,
    received_candidates: Vec<IceCandidate>,
    version: u64,
    candidates_sent: u64,
    offers_created: usize,
}

impl LinkState {
    fn next_mid(&self) -> String {
        let used: HashSet<&str> = self
            .transceivers
            .iter()
            .filter_map(|t| t.mid.as_deref())
            .collect();
        (0..)
            .map(|n: u32| n.to_string())
            .find(|mid| !used.contains(mid.as_str()))
            .unwrap_or_default()
    }

    fn media_lines(&self) -> Vec<MediaLine> {
        self.transceivers
            .iter()
            .filter_map(|t| {
                t.mid.as_ref().map(|mid| MediaLine {
                    mid: mid.clone(),
                    kind: t.kind,
                    msid: t.msid.clone(),
                })
            })
            .collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.signaling == SignalingState::Closed {
            Err(AppError::InvalidState("peer connection is closed".into()))
        } else {
            Ok(())
        }
    }

    fn mark_stable(&mut self) -> bool {
        self.signaling = SignalingState::Stable;
        for t in self.transceivers.iter_mut().filter(|t| t.mid.is_some()) {
            t.negotiated = true;
        }
        let first = !self.established;
        self.established = true;
        first
    }

    fn new_remote_tracks(&mut self, lines: &[MediaLine]) -> Vec<RemoteTrack> {
        let mut tracks = Vec::new();
        for line in lines {
            if let Some((stream_id, track_id)) = &line.msid {
                if self.reported_tracks.insert(track_id.clone()) {
                    tracks.push(RemoteTrack {
                        stream_id: stream_id.clone(),
                        track: RemoteTrackInfo {
                            id: track_id.clone(),
                            kind: line.kind,
                        },
                    });
                }
            }
        }
        tracks
    }
}

/// In-memory peer connection
#[derive(Debug)]
pub struct LoopbackLink {
    uid: u64,
    sink: PeerEventSink,
    state: Mutex<LinkState>,
}

impl LoopbackLink {
    pub fn new(uid: u64, sink: PeerEventSink) -> Self {
        Self {
            uid,
            sink,
            state: Mutex::new(LinkState {
                signaling: SignalingState::Stable,
                transceivers: Vec::new(),
                has_remote: false,
                established: false,
                reported_tracks: HashSet::new(),
                received_candidates: Vec::new(),
                version: 0,
                candidates_sent: 0,
                offers_created: 0,
            }),
        }
    }

    /// Remote peer this connection talks to
    pub fn peer_id(&self) -> &PeerId {
        self.sink.peer_id()
    }

    /// Track currently carried by the live video sender
    pub fn video_track(&self) -> Option<LocalTrack> {
        self.state
            .lock()
            .transceivers
            .iter()
            .find(|t| t.kind == TrackKind::Video && t.track.is_some())
            .and_then(|t| t.track.clone())
    }

    /// Tracks of `kind` currently being sent
    pub fn active_tracks(&self, kind: TrackKind) -> Vec<LocalTrack> {
        self.state
            .lock()
            .transceivers
            .iter()
            .filter(|t| t.kind == kind)
            .filter_map(|t| t.track.clone())
            .collect()
    }

    pub fn received_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().received_candidates.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    /// Remote track ids seen so far
    pub fn remote_track_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().reported_tracks.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether at least one offer/answer exchange completed
    pub fn is_established(&self) -> bool {
        self.state.lock().established
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }

    fn emit_candidate(&self, state: &mut LinkState) -> PeerEvent {
        state.candidates_sent += 1;
        let candidate = IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
            self.uid,
            50000 + state.candidates_sent
        ))
        .with_mid("0", 0);
        PeerEvent::IceCandidate(candidate)
    }

    fn emit_all(&self, events: Vec<PeerEvent>) {
        for event in events {
            trace!("Loopback link {} emits {:?}", self.uid, event);
            self.sink.emit(event);
        }
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<()> {
        let negotiation_needed = {
            let mut state = self.state.lock();
            state.ensure_open()?;

            if state
                .transceivers
                .iter()
                .any(|t| t.track.as_ref() == Some(track))
            {
                return Err(AppError::WebRtcError(format!(
                    "track {} is already attached",
                    track.id()
                )));
            }

            let msid = Some((stream_id.to_string(), track.id().to_string()));
            match state
                .transceivers
                .iter_mut()
                .find(|t| t.kind == track.kind() && t.track.is_none() && t.msid.is_none())
            {
                Some(t) => {
                    t.msid = msid;
                    t.track = Some(track.clone());
                }
                None => state.transceivers.push(Transceiver {
                    mid: None,
                    kind: track.kind(),
                    msid,
                    track: Some(track.clone()),
                    negotiated: false,
                }),
            }

            state.established && state.signaling == SignalingState::Stable
        };

        if negotiation_needed {
            self.emit_all(vec![PeerEvent::NegotiationNeeded]);
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<&LocalTrack>, stream_id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        // A cleared sender stays cleared, like a real RTP sender
        let Some(sender) = state
            .transceivers
            .iter_mut()
            .find(|t| t.kind == TrackKind::Video && t.track.is_some())
        else {
            return Ok(false);
        };
        if let Some(track) = track {
            sender.msid = Some((stream_id.to_string(), track.id().to_string()));
        }
        sender.track = track.cloned();
        Ok(true)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if !matches!(
            state.signaling,
            SignalingState::Stable | SignalingState::HaveLocalOffer
        ) {
            return Err(AppError::InvalidState(format!(
                "cannot create offer in state {}",
                state.signaling
            )));
        }

        for i in 0..state.transceivers.len() {
            if state.transceivers[i].mid.is_none() {
                let mid = state.next_mid();
                state.transceivers[i].mid = Some(mid);
            }
        }

        state.version += 1;
        state.offers_created += 1;
        let lines = state.media_lines();
        Ok(SessionDescription::offer(render_sdp(
            self.uid,
            state.version,
            &lines,
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(AppError::InvalidState(format!(
                "cannot create answer in state {}",
                state.signaling
            )));
        }

        state.version += 1;
        let lines = state.media_lines();
        Ok(SessionDescription::answer(render_sdp(
            self.uid,
            state.version,
            &lines,
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let events = {
            let mut state = self.state.lock();
            state.ensure_open()?;

            let mut events = Vec::new();
            match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    parse_sdp(&desc.sdp)?;
                    state.signaling = SignalingState::HaveLocalOffer;
                    events.push(self.emit_candidate(&mut state));
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                    parse_sdp(&desc.sdp)?;
                    let first = state.mark_stable();
                    events.push(self.emit_candidate(&mut state));
                    if first {
                        events.push(PeerEvent::ConnectionState(ConnectionState::Connected));
                    }
                    // Local tracks the remote offer had no slot for
                    if state
                        .transceivers
                        .iter()
                        .any(|t| t.mid.is_none() && t.track.is_some())
                    {
                        events.push(PeerEvent::NegotiationNeeded);
                    }
                }
                (SdpKind::Rollback, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    for t in state.transceivers.iter_mut().filter(|t| !t.negotiated) {
                        t.mid = None;
                    }
                }
                (kind, current) => {
                    return Err(AppError::InvalidState(format!(
                        "cannot apply local {} in state {}",
                        kind, current
                    )))
                }
            }
            events
        };

        self.emit_all(events);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let events = {
            let mut state = self.state.lock();
            state.ensure_open()?;

            let mut events = Vec::new();
            match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    let lines = parse_sdp(&desc.sdp)?;
                    for line in &lines {
                        if state
                            .transceivers
                            .iter()
                            .any(|t| t.mid.as_deref() == Some(line.mid.as_str()))
                        {
                            continue;
                        }
                        match state
                            .transceivers
                            .iter_mut()
                            .find(|t| t.mid.is_none() && t.kind == line.kind)
                        {
                            Some(t) => t.mid = Some(line.mid.clone()),
                            None => state.transceivers.push(Transceiver {
                                mid: Some(line.mid.clone()),
                                kind: line.kind,
                                msid: None,
                                track: None,
                                negotiated: false,
                            }),
                        }
                    }
                    state.signaling = SignalingState::HaveRemoteOffer;
                    state.has_remote = true;
                    events.extend(state.new_remote_tracks(&lines).into_iter().map(PeerEvent::Track));
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                    let lines = parse_sdp(&desc.sdp)?;
                    state.has_remote = true;
                    let first = state.mark_stable();
                    events.extend(state.new_remote_tracks(&lines).into_iter().map(PeerEvent::Track));
                    if first {
                        events.push(PeerEvent::ConnectionState(ConnectionState::Connected));
                    }
                }
                (SdpKind::Rollback, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                }
                (kind, current) => {
                    return Err(AppError::InvalidState(format!(
                        "cannot apply remote {} in state {}",
                        kind, current
                    )))
                }
            }
            events
        };

        self.emit_all(events);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if !state.has_remote {
            return Err(AppError::InvalidState(
                "ICE candidate received before any remote description".into(),
            ));
        }
        state.received_candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.signaling = SignalingState::Closed;
        for t in state.transceivers.iter_mut() {
            t.track = None;
        }
        Ok(())
    }
}

/// Factory for [`LoopbackLink`]s that keeps every link for inspection
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    links: Mutex<Vec<Arc<LoopbackLink>>>,
    next_uid: AtomicU64,
    fail_creation: AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create` calls fail
    pub fn set_fail_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::Relaxed);
    }

    /// Every link ever created, oldest first
    pub fn links(&self) -> Vec<Arc<LoopbackLink>> {
        self.links.lock().clone()
    }

    /// Every link ever created towards `peer`
    pub fn links_for(&self, peer: &PeerId) -> Vec<Arc<LoopbackLink>> {
        self.links
            .lock()
            .iter()
            .filter(|link| link.peer_id() == peer)
            .cloned()
            .collect()
    }

    /// Links towards `peer` that are not closed
    pub fn open_links_for(&self, peer: &PeerId) -> Vec<Arc<LoopbackLink>> {
        self.links_for(peer)
            .into_iter()
            .filter(|link| !link.is_closed())
            .collect()
    }

    /// The single open link towards `peer`, if any
    pub fn open_link(&self, peer: &PeerId) -> Option<Arc<LoopbackLink>> {
        self.open_links_for(peer).pop()
    }

    pub fn open_link_count(&self) -> usize {
        self.links.lock().iter().filter(|link| !link.is_closed()).count()
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    async fn create(&self, _ice: &IceConfig, sink: PeerEventSink) -> Result<Arc<dyn PeerLink>> {
        if self.fail_creation.load(Ordering::Relaxed) {
            return Err(AppError::WebRtcError(
                "Failed to create peer connection".into(),
            ));
        }
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed) + 1;
        let link = Arc::new(LoopbackLink::new(uid, sink));
        self.links.lock().push(link.clone());
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use crate::rtc::transport::PeerEventEnvelope;
    use tokio::sync::mpsc;

    fn link(uid: u64, peer: &str) -> (LoopbackLink, mpsc::UnboundedReceiver<PeerEventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LoopbackLink::new(uid, PeerEventSink::new(PeerId::from(peer), uid, tx)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerEventEnvelope>) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            events.push(envelope.event);
        }
        events
    }

    #[test]
    fn test_sdp_render_parse() {
        let lines = vec![
            MediaLine {
                mid: "0".into(),
                kind: TrackKind::Audio,
                msid: Some(("s".into(), "a".into())),
            },
            MediaLine {
                mid: "1".into(),
                kind: TrackKind::Video,
                msid: None,
            },
        ];
        assert_eq!(parse_sdp(&render_sdp(1, 1, &lines)).unwrap(), lines);
        assert!(parse_sdp("v=0\r\no=- 0 0 IN IP4 127.0.0.1").is_err());
        assert!(parse_sdp("v=loopback\nm=0 smell s t\n").is_err());
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let (a, mut a_rx) = link(1, "b");
        let (b, mut b_rx) = link(2, "a");

        let mic = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let cam = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        a.add_track(&mic, "stream-a").await.unwrap();
        a.add_track(&cam, "stream-a").await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        b.set_remote_description(offer).await.unwrap();
        assert_eq!(b.signaling_state(), SignalingState::HaveRemoteOffer);
        let b_events = drain(&mut b_rx);
        assert_eq!(
            b_events
                .iter()
                .filter(|e| matches!(e, PeerEvent::Track(_)))
                .count(),
            2
        );

        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(b.signaling_state(), SignalingState::Stable);
        assert!(a.is_established() && b.is_established());

        let a_events = drain(&mut a_rx);
        assert!(a_events
            .iter()
            .any(|e| matches!(e, PeerEvent::IceCandidate(_))));
        assert!(a_events.contains(&PeerEvent::ConnectionState(ConnectionState::Connected)));
    }

    #[tokio::test]
    async fn test_remote_offer_rejected_in_have_local_offer() {
        let (a, _a_rx) = link(1, "b");
        let (b, _b_rx) = link(2, "a");

        let offer_a = a.create_offer().await.unwrap();
        a.set_local_description(offer_a).await.unwrap();
        let offer_b = b.create_offer().await.unwrap();

        assert!(a.set_remote_description(offer_b.clone()).await.is_err());
        a.rollback().await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);
        a.set_remote_description(offer_b).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveRemoteOffer);
    }

    #[tokio::test]
    async fn test_rollback_in_stable_fails() {
        let (a, _rx) = link(1, "b");
        assert!(a.rollback().await.is_err());
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let (a, _rx) = link(1, "b");
        assert!(a.add_ice_candidate(IceCandidate::new("candidate:x")).await.is_err());
    }

    #[tokio::test]
    async fn test_cleared_video_sender_needs_new_track() {
        let (a, _rx) = link(1, "b");
        assert!(!a.replace_video_track(None, "s").await.unwrap());

        let cam = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        a.add_track(&cam, "s").await.unwrap();
        let screen = LocalTrack::new(TrackKind::Video, TrackSource::Screen, "screen");
        assert!(a.replace_video_track(Some(&screen), "s").await.unwrap());
        assert_eq!(a.video_track(), Some(screen));

        assert!(a.replace_video_track(None, "s").await.unwrap());
        assert!(a.video_track().is_none());

        // Once cleared, the sender cannot take a track back
        let cam2 = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam2");
        assert!(!a.replace_video_track(Some(&cam2), "s").await.unwrap());
        a.add_track(&cam2, "s").await.unwrap();
        assert_eq!(a.video_track(), Some(cam2));
        assert_eq!(a.active_tracks(TrackKind::Video).len(), 1);
    }

    #[tokio::test]
    async fn test_closed_link_rejects_operations() {
        let (a, _rx) = link(1, "b");
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(a.is_closed());
        assert!(a.create_offer().await.is_err());
        assert_eq!(a.signaling_state(), SignalingState::Closed);
    }
}
