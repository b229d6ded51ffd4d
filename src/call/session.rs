//! Call session
//!
//! One actor task owns everything about the local participant's call: the
//! membership state, local media, peer connection records and remote
//! streams. [`CallHandle`]s talk to it over a command queue; signaling
//! traffic, peer connection callbacks and capture notifications arrive on
//! their own queues. The actor handles one item to completion before
//! looking at the next, so no two handlers ever touch the same record at
//! the same time.

use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::channel::RoomChannel;
use super::media_controller::{MediaController, NegotiationFailures};
use super::membership::MembershipState;
use super::negotiation::{handle_answer, handle_ice_candidate, handle_offer, make_offer, OfferOutcome};
use super::peer::{PeerConnectionRecord, PeerTable};
use crate::config::{AppConfig, IceConfig, SessionConfig};
use crate::error::{AppError, Result};
use crate::events::{CallEvent, EventBus, TimestampedEvent};
use crate::media::{EndReason, LocalMediaSource, LocalMediaState, LocalStream, LocalTrack, RemoteStream};
use crate::rtc::{ConnectionState, MediaTransport, PeerEvent, PeerEventEnvelope, PeerEventSink};
use crate::signaling::{
    PeerId, RoomId, SessionDescription, SignalMessage, SignalPayload, SignalingTransport,
    Subscription, SubscriptionEvent,
};

/// Pending commands before callers start waiting
const COMMAND_QUEUE_CAPACITY: usize = 32;

/// Read-only view of a call session
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub room_id: Option<RoomId>,
    pub local_peer_id: PeerId,
    pub membership: MembershipState,
    pub joined: bool,
    /// Every peer with a connection record
    pub peer_ids: Vec<PeerId>,
    /// Remote media per peer
    pub peers: BTreeMap<PeerId, RemoteStream>,
    pub peer_camera_states: BTreeMap<PeerId, bool>,
    pub is_muted: bool,
    pub is_camera_off: bool,
    pub is_screen_sharing: bool,
    pub local_stream: Option<LocalStream>,
}

impl CallSnapshot {
    fn initial(local_peer_id: PeerId) -> Self {
        Self {
            room_id: None,
            local_peer_id,
            membership: MembershipState::Idle,
            joined: false,
            peer_ids: Vec::new(),
            peers: BTreeMap::new(),
            peer_camera_states: BTreeMap::new(),
            is_muted: false,
            is_camera_off: false,
            is_screen_sharing: false,
            local_stream: None,
        }
    }
}

enum Command {
    Join {
        room_id: RoomId,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        /// A leave message was already published by the caller
        notified: bool,
        reply: Option<oneshot::Sender<()>>,
    },
    ToggleMic {
        reply: oneshot::Sender<Result<bool>>,
    },
    ToggleCamera {
        reply: oneshot::Sender<Result<bool>>,
    },
    ToggleScreenShare {
        reply: oneshot::Sender<Result<bool>>,
    },
}

enum SessionEvent {
    /// Event from the room subscription opened as `generation`
    Subscription {
        generation: u64,
        event: SubscriptionEvent,
    },
    /// A screen capture was ended outside our control
    CaptureEnded { track_id: String },
}

/// Entry point for creating call sessions
pub struct CallSession;

impl CallSession {
    pub fn builder(
        signaling: Arc<dyn SignalingTransport>,
        media_transport: Arc<dyn MediaTransport>,
        media_source: Arc<dyn LocalMediaSource>,
    ) -> CallSessionBuilder {
        CallSessionBuilder {
            config: AppConfig::default(),
            peer_id: None,
            signaling,
            media_transport,
            media_source,
        }
    }
}

/// Builder for a call session
pub struct CallSessionBuilder {
    config: AppConfig,
    peer_id: Option<PeerId>,
    signaling: Arc<dyn SignalingTransport>,
    media_transport: Arc<dyn MediaTransport>,
    media_source: Arc<dyn LocalMediaSource>,
}

impl CallSessionBuilder {
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a fixed peer id instead of a random one
    pub fn peer_id(mut self, peer_id: impl Into<PeerId>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    /// Start the session actor on the current tokio runtime
    pub fn spawn(self) -> CallHandle {
        let local_id = self.peer_id.unwrap_or_else(PeerId::random);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::initial(local_id.clone()));
        let events = Arc::new(EventBus::new());

        let actor = SessionActor {
            local_id: local_id.clone(),
            session_config: self.config.session.clone(),
            ice: self.config.ice.clone(),
            signaling: self.signaling.clone(),
            media_transport: self.media_transport,
            controller: MediaController::new(
                self.media_source,
                self.config.media.clone(),
                Duration::from_millis(self.config.session.camera_reacquire_delay_ms),
            ),
            events: events.clone(),
            snapshot_tx,
            membership: MembershipState::Idle,
            channel: None,
            generation: 0,
            subscription_cancel: None,
            media: None,
            peers: PeerTable::new(),
            next_link_id: 0,
            event_tx,
            peer_tx,
        };
        tokio::spawn(actor.run(command_rx, event_rx, peer_rx));

        CallHandle {
            local_id,
            commands: command_tx,
            snapshot: snapshot_rx,
            events,
            signaling: self.signaling,
        }
    }
}

/// Cloneable handle on a running call session
///
/// The session stops (leaving its room) once every handle is dropped.
#[derive(Clone)]
pub struct CallHandle {
    local_id: PeerId,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    events: Arc<EventBus>,
    signaling: Arc<dyn SignalingTransport>,
}

impl CallHandle {
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_id
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| AppError::SessionClosed)?;
        rx.await.map_err(|_| AppError::SessionClosed)
    }

    /// Acquire local media and subscribe to `room_id`
    ///
    /// Returns once the subscription is requested; the session becomes
    /// joined when the transport confirms it (see [`Self::wait_joined`]).
    /// Media failures leave the session not joined.
    pub async fn join_room(&self, room_id: impl Into<RoomId>) -> Result<()> {
        let room_id = room_id.into();
        self.request(|reply| Command::Join { room_id, reply })
            .await?
    }

    /// Leave the room; calling it again, or when not in a room, is a no-op
    pub async fn leave_room(&self) -> Result<()> {
        match self
            .request(|reply| Command::Leave {
                notified: false,
                reply: Some(reply),
            })
            .await
        {
            Err(AppError::SessionClosed) => Ok(()),
            other => other,
        }
    }

    /// Returns `true` when the microphone is live afterwards
    pub async fn toggle_mic(&self) -> Result<bool> {
        self.request(|reply| Command::ToggleMic { reply }).await?
    }

    /// Returns `true` when the camera is on afterwards
    pub async fn toggle_camera(&self) -> Result<bool> {
        self.request(|reply| Command::ToggleCamera { reply }).await?
    }

    /// Returns `true` when screen sharing is active afterwards
    pub async fn toggle_screen_share(&self) -> Result<bool> {
        self.request(|reply| Command::ToggleScreenShare { reply })
            .await?
    }

    /// Best-effort leave for external lifecycle signals (process exit,
    /// connection teardown)
    ///
    /// Publishes `leave` without waiting, then asks the session to tear
    /// down in the background.
    pub fn notify_hidden(&self) {
        let (joined, room_id) = {
            let snapshot = self.snapshot.borrow();
            (snapshot.joined, snapshot.room_id.clone())
        };

        let mut notified = false;
        if let (true, Some(room_id)) = (joined, room_id) {
            let result = SignalMessage::leave(&self.local_id)
                .encode()
                .and_then(|payload| self.signaling.publish_now(&room_id, payload));
            match result {
                Ok(()) => notified = true,
                Err(e) => debug!("Leave notification for {} not sent: {}", room_id, e),
            }
        }

        if let Err(e) = self.commands.try_send(Command::Leave {
            notified,
            reply: None,
        }) {
            debug!("Could not queue leave: {}", e);
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&CallSnapshot) -> bool,
    ) -> Result<CallSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| AppError::SessionClosed)?;
        Ok(snapshot.clone())
    }

    pub async fn wait_joined(&self) -> Result<()> {
        self.wait_for(|s| s.joined).await.map(|_| ())
    }

    pub fn events(&self) -> broadcast::Receiver<TimestampedEvent> {
        self.events.subscribe()
    }
}

struct SessionActor {
    local_id: PeerId,
    session_config: SessionConfig,
    ice: IceConfig,
    signaling: Arc<dyn SignalingTransport>,
    media_transport: Arc<dyn MediaTransport>,
    controller: MediaController,
    events: Arc<EventBus>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    membership: MembershipState,
    channel: Option<RoomChannel>,
    /// Bumped per subscription; older subscription events are ignored
    generation: u64,
    subscription_cancel: Option<CancellationToken>,
    media: Option<LocalMediaState>,
    peers: PeerTable,
    next_link_id: u64,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    peer_tx: mpsc::UnboundedSender<PeerEventEnvelope>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEventEnvelope>,
    ) {
        debug!("Call session {} started", self.local_id);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = session_events.recv() => self.handle_session_event(event).await,
                Some(envelope) = peer_events.recv() => self.handle_peer_event(envelope).await,
            }
            self.publish_snapshot();
        }

        self.leave(false).await;
        self.publish_snapshot();
        debug!("Call session {} stopped", self.local_id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join { room_id, reply } => {
                let result = self.join(room_id).await;
                let _ = reply.send(result);
            }
            Command::Leave { notified, reply } => {
                self.leave(notified).await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::ToggleMic { reply } => {
                let _ = reply.send(self.toggle_mic());
            }
            Command::ToggleCamera { reply } => {
                let result = self.toggle_camera().await;
                let _ = reply.send(result);
            }
            Command::ToggleScreenShare { reply } => {
                let result = self.toggle_screen_share().await;
                let _ = reply.send(result);
            }
        }
    }

    // ---- membership ----

    async fn join(&mut self, room_id: RoomId) -> Result<()> {
        if self.membership.is_active() {
            return match &self.channel {
                Some(channel) if channel.room_id() == &room_id => Ok(()),
                _ => Err(AppError::InvalidState(format!(
                    "already {} another room",
                    self.membership
                ))),
            };
        }

        self.membership.transition(MembershipState::Joining)?;
        info!("Joining room {} as {}", room_id, self.local_id);

        let media = match self.controller.acquire_initial().await {
            Ok(media) => media,
            Err(e) => {
                warn!("Failed to acquire local media: {}", e);
                self.abort_join();
                return Err(e);
            }
        };
        self.media = Some(media);
        self.channel = Some(RoomChannel::new(
            self.signaling.clone(),
            room_id.clone(),
            self.local_id.clone(),
        ));
        self.publish_snapshot();

        let jitter = self.join_jitter();
        if !jitter.is_zero() {
            trace!("Waiting {:?} before subscribing", jitter);
            tokio::time::sleep(jitter).await;
        }

        let subscription = match self.signaling.subscribe(&room_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Failed to subscribe to {}: {}", room_id, e);
                self.abort_join();
                return Err(e);
            }
        };

        self.generation += 1;
        let cancel = CancellationToken::new();
        tokio::spawn(forward_subscription(
            subscription,
            self.generation,
            self.event_tx.clone(),
            cancel.clone(),
        ));
        self.subscription_cancel = Some(cancel);
        Ok(())
    }

    fn abort_join(&mut self) {
        if let Some(mut media) = self.media.take() {
            media.stop_all();
        }
        self.channel = None;
        if let Err(e) = self.membership.transition(MembershipState::Idle) {
            warn!("{}", e);
        }
    }

    fn join_jitter(&self) -> Duration {
        let (low, high) = self.session_config.join_jitter_ms;
        let ms = if high > low {
            rand::thread_rng().gen_range(low..=high)
        } else {
            low
        };
        Duration::from_millis(ms)
    }

    async fn on_subscribed(&mut self) {
        if self.membership != MembershipState::Joining {
            return;
        }
        if let Err(e) = self.membership.transition(MembershipState::Joined) {
            warn!("{}", e);
            return;
        }

        let delay = Duration::from_millis(self.session_config.announce_delay_ms);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(e) = channel.broadcast(SignalPayload::Join).await {
            warn!("Failed to announce join in {}: {}", channel.room_id(), e);
        }
        info!("Joined room {} as {}", channel.room_id(), self.local_id);
        self.events.publish(CallEvent::Joined {
            room_id: channel.room_id().clone(),
            peer_id: self.local_id.clone(),
        });
    }

    async fn leave(&mut self, notified: bool) {
        if !self.membership.is_active() {
            debug!("Leave ignored while {}", self.membership);
            return;
        }

        if let Some(channel) = &self.channel {
            if self.membership.is_joined() && !notified {
                channel.announce_leave_now();
            }
        }

        for record in self.peers.drain() {
            if let Err(e) = record.link.close().await {
                debug!("Closing connection to {} failed: {}", record.peer_id, e);
            }
        }
        if let Some(mut media) = self.media.take() {
            media.stop_all();
        }

        if let Some(cancel) = self.subscription_cancel.take() {
            cancel.cancel();
        }
        self.generation += 1;

        if let Some(channel) = self.channel.take() {
            if let Err(e) = self.signaling.unsubscribe(channel.room_id()).await {
                warn!("Failed to unsubscribe from {}: {}", channel.room_id(), e);
            }
            info!("Left room {}", channel.room_id());
            self.events.publish(CallEvent::Left {
                room_id: channel.room_id().clone(),
            });
        }

        if let Err(e) = self.membership.transition(MembershipState::Left) {
            warn!("{}", e);
        }
    }

    // ---- signaling ----

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Subscription { generation, event } if generation != self.generation => {
                trace!("Dropping {:?} from stale subscription #{}", event, generation);
            }
            SessionEvent::Subscription { event, .. } => match event {
                SubscriptionEvent::Subscribed => self.on_subscribed().await,
                SubscriptionEvent::Message(raw) => self.on_signal(&raw).await,
                SubscriptionEvent::Closed => {
                    if self.membership.is_active() {
                        warn!("Signaling channel closed, leaving call");
                        self.leave(true).await;
                    }
                }
            },
            SessionEvent::CaptureEnded { track_id } => self.on_capture_ended(&track_id).await,
        }
    }

    async fn on_signal(&mut self, raw: &str) {
        let message = match SignalMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed signaling payload: {}", e);
                return;
            }
        };

        if message.from == self.local_id {
            return;
        }
        if !message.is_addressed_to(&self.local_id) {
            trace!(
                "Dropping {} from {} addressed to someone else",
                message.kind(),
                message.from
            );
            return;
        }
        if !self.membership.is_joined() {
            debug!("Dropping {} from {} while {}", message.kind(), message.from, self.membership);
            return;
        }

        debug!("Received {} from {}", message.kind(), message.from);
        let from = message.from;
        match message.payload {
            SignalPayload::Join => self.on_remote_join(&from).await,
            SignalPayload::Offer { sdp } => self.on_offer(&from, sdp).await,
            SignalPayload::Answer { sdp } => {
                let Some(record) = self.peers.get_mut(&from) else {
                    debug!("Dropping answer from unknown peer {}", from);
                    return;
                };
                if let Err(e) = handle_answer(record, sdp).await {
                    self.negotiation_failed(&from, e);
                }
            }
            SignalPayload::IceCandidate { candidate } => {
                let Some(record) = self.peers.get_mut(&from) else {
                    debug!("Dropping ICE candidate from unknown peer {}", from);
                    return;
                };
                if let Err(e) = handle_ice_candidate(record, candidate).await {
                    debug!("{}", e);
                }
            }
            SignalPayload::Leave => self.remove_peer(&from, "left").await,
            SignalPayload::CameraState { camera_on } => {
                let Some(record) = self.peers.get_mut(&from) else {
                    debug!("Dropping camera-state from unknown peer {}", from);
                    return;
                };
                record.camera_on = camera_on;
                self.events.publish(CallEvent::PeerCameraChanged {
                    peer_id: from,
                    camera_on,
                });
            }
        }
    }

    /// Create the record for `peer_id` unless it already exists
    ///
    /// Returns `true` when a new record was created.
    async fn ensure_record(&mut self, peer_id: &PeerId) -> Result<bool> {
        if self.peers.contains(peer_id) {
            return Ok(false);
        }

        self.next_link_id += 1;
        let link_id = self.next_link_id;
        let sink = PeerEventSink::new(peer_id.clone(), link_id, self.peer_tx.clone());
        let link = self.media_transport.create(&self.ice, sink).await?;

        if let Some(media) = &self.media {
            for track in media.outgoing_tracks() {
                if let Err(e) = link.add_track(&track, media.stream.id()).await {
                    warn!("Failed to attach {} track for {}: {}", track.kind(), peer_id, e);
                }
            }
        }

        self.peers
            .insert(PeerConnectionRecord::new(peer_id.clone(), link_id, link));
        info!("Peer {} joined", peer_id);
        self.events.publish(CallEvent::PeerJoined {
            peer_id: peer_id.clone(),
        });
        Ok(true)
    }

    async fn on_remote_join(&mut self, peer_id: &PeerId) {
        let created = match self.ensure_record(peer_id).await {
            Ok(created) => created,
            Err(e) => {
                self.negotiation_failed(peer_id, e);
                return;
            }
        };
        self.offer_to(peer_id).await;
        if created {
            self.announce_camera_off(peer_id).await;
        }
    }

    async fn on_offer(&mut self, peer_id: &PeerId, offer: SessionDescription) {
        let created = match self.ensure_record(peer_id).await {
            Ok(created) => created,
            Err(e) => {
                self.negotiation_failed(peer_id, e);
                return;
            }
        };
        let (Some(channel), Some(record)) = (self.channel.as_ref(), self.peers.get_mut(peer_id))
        else {
            return;
        };
        match handle_offer(record, offer, channel).await {
            Ok(OfferOutcome::Answered) => debug!("Answered offer from {}", peer_id),
            Ok(OfferOutcome::Ignored) => {}
            Err(e) => self.negotiation_failed(peer_id, e),
        }
        if created {
            self.announce_camera_off(peer_id).await;
        }
    }

    /// Camera-state is only broadcast on change, so a newcomer is told directly
    async fn announce_camera_off(&self, peer_id: &PeerId) {
        let camera_off = self.media.as_ref().is_some_and(|m| !m.camera_on);
        let Some(channel) = self.channel.as_ref().filter(|_| camera_off) else {
            return;
        };
        if let Err(e) = channel
            .unicast(peer_id, SignalPayload::CameraState { camera_on: false })
            .await
        {
            debug!("Failed to send camera state to {}: {}", peer_id, e);
        }
    }

    async fn offer_to(&mut self, peer_id: &PeerId) {
        let (Some(channel), Some(record)) = (self.channel.as_ref(), self.peers.get_mut(peer_id))
        else {
            return;
        };
        if let Err(e) = make_offer(record, channel).await {
            self.negotiation_failed(peer_id, e);
        }
    }

    async fn remove_peer(&mut self, peer_id: &PeerId, reason: &str) {
        let Some(record) = self.peers.remove(peer_id) else {
            debug!("Peer {} {} but had no connection", peer_id, reason);
            return;
        };
        if let Err(e) = record.link.close().await {
            debug!("Closing connection to {} failed: {}", peer_id, e);
        }
        info!("Peer {} {}", peer_id, reason);
        self.events.publish(CallEvent::PeerLeft {
            peer_id: peer_id.clone(),
        });
    }

    fn negotiation_failed(&self, peer_id: &PeerId, e: AppError) {
        warn!("Negotiation with {} failed: {}", peer_id, e);
        self.events.publish(CallEvent::NegotiationFailed {
            peer_id: peer_id.clone(),
            reason: e.to_string(),
        });
    }

    fn report_failures(&self, failures: NegotiationFailures) {
        for (peer_id, e) in failures {
            self.events.publish(CallEvent::NegotiationFailed {
                peer_id,
                reason: e.to_string(),
            });
        }
    }

    // ---- peer connection events ----

    async fn handle_peer_event(&mut self, envelope: PeerEventEnvelope) {
        let PeerEventEnvelope {
            peer_id,
            link_id,
            event,
        } = envelope;
        if !self.peers.is_current(&peer_id, link_id) {
            trace!("Dropping event from stale connection {}#{}", peer_id, link_id);
            return;
        }

        match event {
            PeerEvent::Track(remote) => {
                if let Some(stream_id) = self.peers.add_remote_track(&peer_id, remote) {
                    info!("Remote stream {} from {}", stream_id, peer_id);
                    self.events.publish(CallEvent::RemoteStreamAdded { peer_id, stream_id });
                }
            }
            PeerEvent::IceCandidate(candidate) => {
                let Some(channel) = &self.channel else {
                    return;
                };
                if let Err(e) = channel
                    .unicast(&peer_id, SignalPayload::IceCandidate { candidate })
                    .await
                {
                    debug!("ICE candidate for {} not published: {}", peer_id, e);
                }
            }
            PeerEvent::NegotiationNeeded => self.offer_to(&peer_id).await,
            PeerEvent::ConnectionState(state) => match state {
                ConnectionState::Closed => self.remove_peer(&peer_id, "disconnected").await,
                ConnectionState::Failed | ConnectionState::Disconnected => {
                    warn!("Connection to {} {}", peer_id, state)
                }
                _ => debug!("Connection to {} {}", peer_id, state),
            },
        }
    }

    // ---- media ----

    fn toggle_mic(&mut self) -> Result<bool> {
        let media = self.media.as_mut().ok_or_else(not_in_call)?;
        Ok(self.controller.toggle_mic(media))
    }

    async fn toggle_camera(&mut self) -> Result<bool> {
        let (Some(media), Some(channel)) = (self.media.as_mut(), self.channel.as_ref()) else {
            return Err(not_in_call());
        };

        let failures = if media.camera_on {
            self.controller
                .camera_off(media, &mut self.peers, channel)
                .await
        } else {
            self.controller
                .camera_on(media, &mut self.peers, channel)
                .await?
        };
        let camera_on = media.camera_on;
        self.report_failures(failures);
        Ok(camera_on)
    }

    async fn toggle_screen_share(&mut self) -> Result<bool> {
        let (Some(media), Some(channel)) = (self.media.as_mut(), self.channel.as_ref()) else {
            return Err(not_in_call());
        };

        let failures = if media.screen_sharing {
            self.controller
                .stop_screen_share(media, &mut self.peers, channel)
                .await
        } else {
            let (track, failures) = self
                .controller
                .start_screen_share(media, &mut self.peers, channel)
                .await?;
            watch_capture_end(track, self.event_tx.clone());
            failures
        };
        let sharing = media.screen_sharing;
        self.report_failures(failures);
        Ok(sharing)
    }

    async fn on_capture_ended(&mut self, track_id: &str) {
        let (Some(media), Some(channel)) = (self.media.as_mut(), self.channel.as_ref()) else {
            return;
        };
        let current = media.screen_track.as_ref().map(|t| t.id() == track_id);
        if !media.screen_sharing || current != Some(true) {
            return;
        }

        info!("Screen capture ended, restoring camera");
        let failures = self
            .controller
            .stop_screen_share(media, &mut self.peers, channel)
            .await;
        self.report_failures(failures);
    }

    fn publish_snapshot(&self) {
        let media = self.media.as_ref();
        let snapshot = CallSnapshot {
            room_id: self.channel.as_ref().map(|c| c.room_id().clone()),
            local_peer_id: self.local_id.clone(),
            membership: self.membership,
            joined: self.membership.is_joined(),
            peer_ids: self.peers.peer_ids(),
            peers: self.peers.streams().clone(),
            peer_camera_states: self.peers.camera_states(),
            is_muted: media.map(|m| !m.audio_enabled).unwrap_or(false),
            is_camera_off: media.map(|m| !m.camera_on).unwrap_or(false),
            is_screen_sharing: media.map(|m| m.screen_sharing).unwrap_or(false),
            local_stream: media.map(|m| m.stream.clone()),
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

fn not_in_call() -> AppError {
    AppError::InvalidState("not in a call".into())
}

async fn forward_subscription(
    mut subscription: Subscription,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = subscription.recv() => {
                let event = event.unwrap_or(SubscriptionEvent::Closed);
                let closed = event == SubscriptionEvent::Closed;
                if tx.send(SessionEvent::Subscription { generation, event }).is_err() || closed {
                    break;
                }
            }
        }
    }
    trace!("Subscription #{} forwarder stopped", generation);
}

fn watch_capture_end(track: LocalTrack, tx: mpsc::UnboundedSender<SessionEvent>) {
    tokio::spawn(async move {
        if track.ended().await == EndReason::CaptureEnded {
            let _ = tx.send(SessionEvent::CaptureEnded {
                track_id: track.id().to_string(),
            });
        }
    });
}
