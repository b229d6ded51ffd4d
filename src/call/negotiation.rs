//! Perfect negotiation
//!
//! Each peer pair breaks offer collisions without extra messages: the side
//! whose id sorts higher is *polite* and yields to an incoming offer by
//! rolling back its own; the other side ignores the colliding offer and
//! waits for its own to be answered.

use tracing::{debug, info};

use super::channel::RoomChannel;
use super::peer::PeerConnectionRecord;
use crate::error::{AppError, Result};
use crate::rtc::{PeerLink, SignalingState};
use crate::signaling::{IceCandidate, PeerId, SessionDescription, SignalPayload};

/// Whether `local` yields to colliding offers from `remote`
pub fn is_polite(local: &PeerId, remote: &PeerId) -> bool {
    local > remote
}

/// What happened to an incoming offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Answer produced and sent
    Answered,
    /// Offer collided with our own and we are impolite
    Ignored,
}

fn negotiation_error(peer_id: &PeerId, step: &str, e: AppError) -> AppError {
    AppError::Negotiation {
        peer_id: peer_id.to_string(),
        reason: format!("{}: {}", step, e),
    }
}

/// Start an offer/answer round as the offering side
///
/// Skipped (returns `Ok(false)`) when an offer is already being made or
/// the connection is mid-negotiation. `making_offer` is cleared whatever
/// the outcome.
pub async fn make_offer(record: &mut PeerConnectionRecord, channel: &RoomChannel) -> Result<bool> {
    let state = record.link.signaling_state();
    if record.making_offer || state != SignalingState::Stable {
        debug!(
            "Skipping offer to {} (making_offer={}, state={})",
            record.peer_id, record.making_offer, state
        );
        return Ok(false);
    }

    record.making_offer = true;
    let result = send_offer(record.link.as_ref(), &record.peer_id, channel).await;
    record.making_offer = false;

    result.map(|_| true)
}

async fn send_offer(link: &dyn PeerLink, peer_id: &PeerId, channel: &RoomChannel) -> Result<()> {
    let offer = link
        .create_offer()
        .await
        .map_err(|e| negotiation_error(peer_id, "create offer", e))?;
    link.set_local_description(offer.clone())
        .await
        .map_err(|e| negotiation_error(peer_id, "set local offer", e))?;

    // The connection may have moved on while we were waiting
    if link.signaling_state() != SignalingState::HaveLocalOffer {
        debug!("Offer to {} superseded before sending", peer_id);
        return Ok(());
    }

    if let Err(e) = channel
        .unicast(peer_id, SignalPayload::Offer { sdp: offer })
        .await
    {
        debug!("Offer to {} not published: {}", peer_id, e);
    }
    Ok(())
}

/// Apply a remote offer, resolving collisions by politeness
pub async fn handle_offer(
    record: &mut PeerConnectionRecord,
    offer: SessionDescription,
    channel: &RoomChannel,
) -> Result<OfferOutcome> {
    let peer_id = record.peer_id.clone();
    let polite = is_polite(channel.local_id(), &peer_id);
    let state = record.link.signaling_state();
    let collision = record.making_offer || state != SignalingState::Stable;

    if collision && !polite {
        info!("Ignoring colliding offer from {} (impolite)", peer_id);
        return Ok(OfferOutcome::Ignored);
    }

    if collision {
        info!("Offer collision with {}: rolling back (polite)", peer_id);
        if state == SignalingState::HaveLocalOffer {
            record
                .link
                .rollback()
                .await
                .map_err(|e| negotiation_error(&peer_id, "rollback", e))?;
        }
        record.making_offer = false;
    }

    record
        .link
        .set_remote_description(offer)
        .await
        .map_err(|e| negotiation_error(&peer_id, "set remote offer", e))?;
    let answer = record
        .link
        .create_answer()
        .await
        .map_err(|e| negotiation_error(&peer_id, "create answer", e))?;
    record
        .link
        .set_local_description(answer.clone())
        .await
        .map_err(|e| negotiation_error(&peer_id, "set local answer", e))?;

    if let Err(e) = channel
        .unicast(&peer_id, SignalPayload::Answer { sdp: answer })
        .await
    {
        debug!("Answer to {} not published: {}", peer_id, e);
    }
    Ok(OfferOutcome::Answered)
}

/// Apply a remote answer to our pending offer
pub async fn handle_answer(record: &mut PeerConnectionRecord, answer: SessionDescription) -> Result<()> {
    record
        .link
        .set_remote_description(answer)
        .await
        .map_err(|e| negotiation_error(&record.peer_id, "set remote answer", e))
}

pub async fn handle_ice_candidate(
    record: &mut PeerConnectionRecord,
    candidate: IceCandidate,
) -> Result<()> {
    record
        .link
        .add_ice_candidate(candidate)
        .await
        .map_err(|e| negotiation_error(&record.peer_id, "add ICE candidate", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, TrackKind, TrackSource};
    use crate::rtc::{LoopbackLink, PeerEventEnvelope, PeerEventSink};
    use crate::signaling::{MemoryHub, RoomId, SignalMessage, SignalingTransport, SubscriptionEvent};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Side {
        id: PeerId,
        record: PeerConnectionRecord,
        link: Arc<LoopbackLink>,
        channel: RoomChannel,
        sub: crate::signaling::Subscription,
        _peer_rx: mpsc::UnboundedReceiver<PeerEventEnvelope>,
    }

    async fn side(hub: &Arc<MemoryHub>, local: &str, remote: &str, uid: u64) -> Side {
        let id = PeerId::from(local);
        let remote = PeerId::from(remote);
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(LoopbackLink::new(uid, PeerEventSink::new(remote.clone(), uid, tx)));
        let mic = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        link.add_track(&mic, local).await.unwrap();

        let transport: Arc<dyn SignalingTransport> = Arc::new(hub.connect());
        let room = RoomId::from("R1");
        let mut sub = transport.subscribe(&room).await.unwrap();
        assert_eq!(sub.recv().await, Some(SubscriptionEvent::Subscribed));

        Side {
            record: PeerConnectionRecord::new(remote, uid, link.clone()),
            link,
            channel: RoomChannel::new(transport, room, id.clone()),
            id,
            sub,
            _peer_rx: rx,
        }
    }

    async fn next_message(side: &mut Side) -> SignalMessage {
        match side.sub.recv().await {
            Some(SubscriptionEvent::Message(raw)) => SignalMessage::decode(&raw).unwrap(),
            other => panic!("unexpected subscription event: {:?}", other),
        }
    }

    fn sdp_of(message: SignalMessage) -> SessionDescription {
        match message.payload {
            SignalPayload::Offer { sdp } | SignalPayload::Answer { sdp } => sdp,
            other => panic!("expected a description, got {:?}", other),
        }
    }

    #[test]
    fn test_politeness_is_antisymmetric() {
        let aaa = PeerId::from("aaa");
        let bbb = PeerId::from("bbb");
        assert!(is_polite(&bbb, &aaa));
        assert!(!is_polite(&aaa, &bbb));
    }

    #[tokio::test]
    async fn test_make_offer_skips_when_not_stable() {
        let hub = MemoryHub::new();
        let mut a = side(&hub, "aaa", "bbb", 1).await;

        assert!(make_offer(&mut a.record, &a.channel).await.unwrap());
        assert_eq!(a.link.signaling_state(), SignalingState::HaveLocalOffer);
        assert!(!a.record.making_offer);

        assert!(!make_offer(&mut a.record, &a.channel).await.unwrap());
        assert_eq!(a.link.offers_created(), 1);
    }

    struct BrokenLink;

    #[async_trait::async_trait]
    impl PeerLink for BrokenLink {
        async fn add_track(&self, _track: &LocalTrack, _stream_id: &str) -> Result<()> {
            Ok(())
        }
        async fn replace_video_track(
            &self,
            _track: Option<&LocalTrack>,
            _stream_id: &str,
        ) -> Result<bool> {
            Ok(false)
        }
        async fn create_offer(&self) -> Result<SessionDescription> {
            Err(AppError::WebRtcError("encoder unavailable".into()))
        }
        async fn create_answer(&self) -> Result<SessionDescription> {
            Err(AppError::WebRtcError("encoder unavailable".into()))
        }
        async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
            Ok(())
        }
        fn signaling_state(&self) -> SignalingState {
            SignalingState::Stable
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_making_offer_cleared_on_failure() {
        let hub = MemoryHub::new();
        let a = side(&hub, "aaa", "bbb", 1).await;
        let mut record = PeerConnectionRecord::new(PeerId::from("bbb"), 9, Arc::new(BrokenLink));

        let err = make_offer(&mut record, &a.channel).await.unwrap_err();
        assert!(matches!(err, AppError::Negotiation { .. }));
        assert!(!record.making_offer);

        // Not locked out: the next attempt runs again
        assert!(make_offer(&mut record, &a.channel).await.is_err());
    }

    #[tokio::test]
    async fn test_simultaneous_offers_resolve_to_one_session() {
        let hub = MemoryHub::new();
        let mut a = side(&hub, "aaa", "bbb", 1).await;
        let mut b = side(&hub, "bbb", "aaa", 2).await;

        // Both sides offer at once
        make_offer(&mut a.record, &a.channel).await.unwrap();
        make_offer(&mut b.record, &b.channel).await.unwrap();
        let offer_from_a = sdp_of(next_message(&mut b).await);
        let offer_from_b = sdp_of(next_message(&mut a).await);

        // "aaa" < "bbb": aaa is impolite, bbb yields
        assert_eq!(
            handle_offer(&mut a.record, offer_from_b, &a.channel).await.unwrap(),
            OfferOutcome::Ignored
        );
        assert_eq!(
            handle_offer(&mut b.record, offer_from_a, &b.channel).await.unwrap(),
            OfferOutcome::Answered
        );
        assert_eq!(b.link.signaling_state(), SignalingState::Stable);

        let answer = next_message(&mut a).await;
        assert_eq!(answer.to.as_ref(), Some(&a.id));
        handle_answer(&mut a.record, sdp_of(answer)).await.unwrap();

        assert_eq!(a.link.signaling_state(), SignalingState::Stable);
        assert!(a.link.is_established() && b.link.is_established());
        assert_eq!(a.link.remote_track_ids().len(), 1);
        assert_eq!(b.link.remote_track_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_answer_in_stable_is_an_error() {
        let hub = MemoryHub::new();
        let mut a = side(&hub, "aaa", "bbb", 1).await;
        let err = handle_answer(&mut a.record, SessionDescription::answer("v=loopback\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Negotiation { .. }));
    }

    #[tokio::test]
    async fn test_candidate_before_description_is_rejected() {
        let hub = MemoryHub::new();
        let mut a = side(&hub, "aaa", "bbb", 1).await;
        assert!(handle_ice_candidate(&mut a.record, IceCandidate::new("candidate:1"))
            .await
            .is_err());
    }
}
