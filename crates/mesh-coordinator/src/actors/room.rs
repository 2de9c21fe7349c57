//! `RoomActor` - one per room the local participant is in.
//!
//! The room actor is the single serialized handler for everything that
//! touches the local call in one room: local requests, relay envelopes,
//! engine events and deadline scans. It owns the local roster view and the
//! link table, so no other task ever mutates them.
//!
//! # Mesh Rules
//!
//! - The newcomer offers to every participant in the `existingParticipants`
//!   roster. Incumbents never offer to a newcomer; they answer.
//! - One link per remote participant id. A rejoin replaces the stale link.
//! - Remote candidates are queued until the remote description is applied,
//!   then flushed once, in arrival order.
//! - An unanswered offer is retried once with a fresh link; the second
//!   timeout fails only that link.
//! - The `existingParticipants` roster is only taken from presence, addressed
//!   to us. It may predate a `leaveCall` we already saw while joining, so
//!   those participants are skipped.
//!
//! # Leave Ordering
//!
//! 1. `leaveCall` is published so presence drops the entry
//! 2. every link is closed
//! 3. local media is released

use crate::config::Config;
use crate::errors::{MeshError, CAPACITY_EXCEEDED_CODE};
use crate::link::{CandidateDisposition, Link, LinkState};
use crate::media::{EngineEvent, LocalMedia, MediaHandle, PeerEngine, TrackKind};
use crate::observability;
use crate::presence::{CallSession, Participant};
use crate::relay::{Relay, RelayEvent, Subscription};

use super::messages::{
    CallEndReason, CallPhase, CloseReason, LinkFailure, LinkSnapshot, MeshEvent, RoomMessage,
    RoomSnapshot,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use chrono::Utc;
use common::types::{ParticipantId, RoomId};
use signaling_protocol::{
    CandidatePayload, ErrorPayload, LeavePayload, LeaveReason, ParticipantDescriptor,
    SessionDescription, SignalingEnvelope, SignalingEvent,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Collaborators and shared state handed to every room actor.
#[derive(Clone)]
pub struct RoomContext {
    pub relay: Arc<dyn Relay>,
    pub media: Arc<dyn LocalMedia>,
    pub engine: Arc<dyn PeerEngine>,
    pub config: Arc<Config>,
    pub events: broadcast::Sender<MeshEvent>,
    pub metrics: Arc<ActorMetrics>,
}

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Join the call. Resolves once the roster arrived and offers went out.
    pub async fn join(&self, display_name: impl Into<String>) -> Result<RoomSnapshot, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Join {
                display_name: display_name.into(),
                respond_to: tx,
            })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave the call.
    pub async fn leave(&self) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Leave { respond_to: tx })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    /// Mute or unmute a local track.
    pub async fn set_track_enabled(&self, track: TrackKind, enabled: bool) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::SetTrackEnabled {
                track,
                enabled,
                respond_to: tx,
            })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    /// Renegotiate every connected link.
    pub async fn renegotiate(&self) -> Result<usize, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Renegotiate { respond_to: tx })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get a snapshot of the room.
    pub async fn snapshot(&self) -> Result<RoomSnapshot, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetSnapshot { respond_to: tx })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor (best-effort leave, then stop).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Whether the actor stopped accepting requests (call ended).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Join request waiting for the presence roster.
struct PendingJoin {
    respond_to: oneshot::Sender<Result<RoomSnapshot, MeshError>>,
    deadline: Instant,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: RoomId,
    local_id: ParticipantId,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    subscription: Subscription,
    relay: Arc<dyn Relay>,
    media: Arc<dyn LocalMedia>,
    engine: Arc<dyn PeerEngine>,
    config: Arc<Config>,
    events: broadcast::Sender<MeshEvent>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    /// Remote participants, keyed by stable id.
    roster: CallSession,
    /// Live links, keyed by remote id. Terminal links are removed.
    links: HashMap<ParticipantId, Link>,
    /// Remotes whose `leaveCall` arrived before our roster did.
    departed_while_joining: HashSet<ParticipantId>,
    media_handle: Option<MediaHandle>,
    phase: CallPhase,
    pending_join: Option<PendingJoin>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room actor over an existing relay subscription.
    pub fn spawn(
        subscription: Subscription,
        context: RoomContext,
        cancel_token: CancellationToken,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let room_id = subscription.room_id().clone();
        let local_id = context.relay.local_id().clone();

        let actor = Self {
            room_id: room_id.clone(),
            local_id: local_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            subscription,
            relay: context.relay,
            media: context.media,
            engine: context.engine,
            config: context.config,
            events: context.events,
            engine_tx,
            engine_rx,
            roster: CallSession::new(room_id.clone()),
            links: HashMap::new(),
            departed_while_joining: HashSet::new(),
            media_handle: None,
            phase: CallPhase::Idle,
            pending_join: None,
            metrics: context.metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, format!("{room_id}/{local_id}")),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    /// Run the actor loop until the call ends.
    #[instrument(skip_all, name = "mesh.actor.room", fields(room_id = %self.room_id, local_id = %self.local_id))]
    async fn run(mut self) {
        info!(
            target: "mesh.actor.room",
            room_id = %self.room_id,
            local_id = %self.local_id,
            "RoomActor started"
        );

        let mut deadline_check = tokio::time::interval(self.config.timer_resolution);
        deadline_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.phase != CallPhase::Ended {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "mesh.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                }

                _ = deadline_check.tick() => {
                    self.check_deadlines().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "mesh.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                        }
                    }
                }

                event = self.subscription.recv() => {
                    match event {
                        Some(RelayEvent::Envelope(envelope)) => {
                            self.handle_envelope(envelope).await;
                        }
                        Some(RelayEvent::PeerDisconnected { participant_id, .. }) => {
                            // Presence owns the debounce; the leave arrives as an envelope
                            debug!(
                                target: "mesh.actor.room",
                                room_id = %self.room_id,
                                participant_id = %participant_id,
                                "Peer transport dropped"
                            );
                        }
                        Some(RelayEvent::ConnectionLost) | None => {
                            self.handle_relay_lost().await;
                        }
                    }
                }

                Some(event) = self.engine_rx.recv() => {
                    self.handle_engine_event(event).await;
                }
            }
        }

        self.relay.unsubscribe(&self.room_id).await;

        while let Ok(message) = self.receiver.try_recv() {
            self.reject(message);
        }

        info!(
            target: "mesh.actor.room",
            room_id = %self.room_id,
            local_id = %self.local_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                display_name,
                respond_to,
            } => {
                self.handle_join(display_name, respond_to).await;
            }

            RoomMessage::Leave { respond_to } => {
                let result = self.handle_leave().await;
                let _ = respond_to.send(result);
            }

            RoomMessage::SetTrackEnabled {
                track,
                enabled,
                respond_to,
            } => {
                let result = self.set_track_enabled(track, enabled).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Renegotiate { respond_to } => {
                let result = self.renegotiate().await;
                let _ = respond_to.send(result);
            }

            RoomMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    /// Answer a request that arrived after the call ended.
    fn reject(&self, message: RoomMessage) {
        let not_in_call = || MeshError::NotInCall(self.room_id.to_string());
        match message {
            RoomMessage::Join { respond_to, .. } => {
                let _ = respond_to.send(Err(not_in_call()));
            }
            RoomMessage::Leave { respond_to }
            | RoomMessage::SetTrackEnabled { respond_to, .. } => {
                let _ = respond_to.send(Err(not_in_call()));
            }
            RoomMessage::Renegotiate { respond_to } => {
                let _ = respond_to.send(Err(not_in_call()));
            }
            RoomMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    // ------------------------------------------------------------------
    // Local requests
    // ------------------------------------------------------------------

    #[instrument(skip_all, name = "mesh.room.join", fields(room_id = %self.room_id))]
    async fn handle_join(
        &mut self,
        display_name: String,
        respond_to: oneshot::Sender<Result<RoomSnapshot, MeshError>>,
    ) {
        if self.phase != CallPhase::Idle {
            let _ = respond_to.send(Err(MeshError::AlreadyInCall(self.room_id.to_string())));
            return;
        }

        let handle = match self.media.acquire().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    target: "mesh.actor.room",
                    room_id = %self.room_id,
                    error = %e,
                    "Local media unavailable, join aborted"
                );
                self.finish(CallEndReason::JoinFailed);
                let _ = respond_to.send(Err(e.into()));
                return;
            }
        };
        self.media_handle = Some(handle);

        let descriptor = ParticipantDescriptor::new(self.local_id.clone(), display_name)
            .with_session(self.relay.local_session().clone());
        let envelope = SignalingEnvelope::broadcast(
            self.room_id.clone(),
            self.local_id.clone(),
            SignalingEvent::JoinCall(descriptor),
        );

        if let Err(e) = self.publish(envelope).await {
            warn!(
                target: "mesh.actor.room",
                room_id = %self.room_id,
                error = %e,
                "Failed to announce join"
            );
            self.release_media().await;
            self.finish(CallEndReason::JoinFailed);
            let _ = respond_to.send(Err(e));
            return;
        }

        self.phase = CallPhase::Joining;
        self.pending_join = Some(PendingJoin {
            respond_to,
            deadline: Instant::now() + self.config.negotiation_timeout,
        });

        info!(
            target: "mesh.actor.room",
            room_id = %self.room_id,
            local_id = %self.local_id,
            "Join announced, waiting for roster"
        );
    }

    #[instrument(skip_all, name = "mesh.room.leave", fields(room_id = %self.room_id))]
    async fn handle_leave(&mut self) -> Result<(), MeshError> {
        if matches!(self.phase, CallPhase::Idle | CallPhase::Ended) {
            return Err(MeshError::NotInCall(self.room_id.to_string()));
        }

        let envelope = SignalingEnvelope::broadcast(
            self.room_id.clone(),
            self.local_id.clone(),
            SignalingEvent::LeaveCall(LeavePayload::default()),
        );
        if let Err(e) = self.publish(envelope).await {
            warn!(
                target: "mesh.actor.room",
                room_id = %self.room_id,
                error = %e,
                "Failed to announce leave, tearing down locally"
            );
        }

        self.close_all_links(CloseReason::LocalLeave).await;
        self.release_media().await;
        self.roster.clear();

        if let Some(pending) = self.pending_join.take() {
            let _ = pending
                .respond_to
                .send(Err(MeshError::NotInCall(self.room_id.to_string())));
        }

        info!(
            target: "mesh.actor.room",
            room_id = %self.room_id,
            local_id = %self.local_id,
            "Left call"
        );

        self.finish(CallEndReason::Left);
        Ok(())
    }

    async fn set_track_enabled(&mut self, track: TrackKind, enabled: bool) -> Result<(), MeshError> {
        let handle = self
            .media_handle
            .ok_or_else(|| MeshError::NotInCall(self.room_id.to_string()))?;

        self.media.set_enabled(handle, track, enabled).await?;

        info!(
            target: "mesh.actor.room",
            room_id = %self.room_id,
            track = %track,
            enabled,
            "Local track toggled"
        );
        Ok(())
    }

    async fn renegotiate(&mut self) -> Result<usize, MeshError> {
        if self.phase != CallPhase::InCall {
            return Err(MeshError::NotInCall(self.room_id.to_string()));
        }

        let mut remotes: Vec<ParticipantId> = self
            .links
            .values()
            .filter(|link| link.state() == LinkState::Connected && !link.is_renegotiating())
            .map(|link| link.remote_id().clone())
            .collect();
        remotes.sort();

        let mut sent = 0;
        for remote_id in remotes {
            match self.start_renegotiation(&remote_id).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(
                        target: "mesh.link",
                        room_id = %self.room_id,
                        remote_id = %remote_id,
                        error = %e,
                        "Renegotiation offer failed"
                    );
                    self.close_link(&remote_id, CloseReason::RenegotiationFailed)
                        .await;
                }
            }
        }

        debug!(
            target: "mesh.actor.room",
            room_id = %self.room_id,
            offers = sent,
            "Renegotiation started"
        );
        Ok(sent)
    }

    async fn start_renegotiation(&mut self, remote_id: &ParticipantId) -> Result<(), MeshError> {
        let negotiation_id = Uuid::new_v4().to_string();
        let offer = self
            .engine
            .create_offer(&self.room_id, remote_id, true)
            .await?
            .with_negotiation_id(negotiation_id.clone());

        let deadline = Instant::now() + self.config.negotiation_timeout;
        self.links
            .get_mut(remote_id)
            .ok_or_else(|| MeshError::LinkNotFound(remote_id.to_string()))?
            .begin_renegotiation(negotiation_id, deadline)?;

        self.publish(SignalingEnvelope::addressed(
            self.room_id.clone(),
            self.local_id.clone(),
            remote_id.clone(),
            SignalingEvent::Offer(offer),
        ))
        .await
    }

    fn snapshot(&self) -> RoomSnapshot {
        let mut links: Vec<LinkSnapshot> = self
            .links
            .values()
            .map(|link| LinkSnapshot {
                remote_id: link.remote_id().clone(),
                state: link.state(),
                role: link.role(),
                attempt: link.attempt(),
                renegotiating: link.is_renegotiating(),
                pending_candidates: link.pending_candidate_count(),
            })
            .collect();
        links.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));

        RoomSnapshot {
            room_id: self.room_id.clone(),
            local_id: self.local_id.clone(),
            phase: self.phase,
            roster: self.roster.roster(),
            links,
        }
    }

    // ------------------------------------------------------------------
    // Inbound envelopes
    // ------------------------------------------------------------------

    async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        if envelope.sender_id == self.local_id || !envelope.is_for(&self.local_id) {
            return;
        }
        observability::record_envelope(envelope.kind().as_str(), "in");

        let SignalingEnvelope {
            sender_id,
            receiver_id,
            event,
            ..
        } = envelope;

        match event {
            SignalingEvent::JoinCall(descriptor) => {
                self.handle_remote_join(sender_id, &descriptor).await;
            }
            SignalingEvent::LeaveCall(payload) => {
                self.handle_remote_leave(&sender_id, payload.reason).await;
            }
            SignalingEvent::ExistingParticipants(roster) => {
                if self.is_presence_reply(&sender_id, receiver_id.as_ref()) {
                    self.handle_existing_participants(&roster).await;
                }
            }
            SignalingEvent::Offer(offer) => {
                if self.accepts_negotiation(&sender_id) {
                    self.handle_offer(sender_id, offer).await;
                }
            }
            SignalingEvent::Answer(answer) => {
                if self.accepts_negotiation(&sender_id) {
                    self.handle_answer(sender_id, answer).await;
                }
            }
            SignalingEvent::IceCandidate(candidate) => {
                if self.accepts_negotiation(&sender_id) {
                    self.handle_remote_candidate(sender_id, candidate).await;
                }
            }
            SignalingEvent::Error(payload) => {
                self.handle_error(&sender_id, payload).await;
            }
        }
    }

    /// Negotiation envelopes are only taken from known remotes while in a call.
    fn accepts_negotiation(&self, sender_id: &ParticipantId) -> bool {
        if !matches!(self.phase, CallPhase::Joining | CallPhase::InCall) {
            observability::record_envelope_dropped("not_in_call");
            return false;
        }
        if !self.roster.contains(sender_id) {
            debug!(
                target: "mesh.actor.room",
                room_id = %self.room_id,
                sender_id = %sender_id,
                "Dropping negotiation from unknown sender"
            );
            observability::record_envelope_dropped("unknown_sender");
            return false;
        }
        true
    }

    /// Rosters count only when presence addressed them to us.
    fn is_presence_reply(&self, sender_id: &ParticipantId, receiver_id: Option<&ParticipantId>) -> bool {
        if *sender_id == self.config.presence_id && receiver_id == Some(&self.local_id) {
            return true;
        }
        warn!(
            target: "mesh.actor.room",
            room_id = %self.room_id,
            sender_id = %sender_id,
            addressed = receiver_id.is_some(),
            "Dropping roster not sent to us by presence"
        );
        observability::record_envelope_dropped("unexpected_roster");
        false
    }

    async fn handle_remote_join(&mut self, sender_id: ParticipantId, descriptor: &ParticipantDescriptor) {
        if descriptor.id != sender_id {
            warn!(
                target: "mesh.actor.room",
                room_id = %self.room_id,
                sender_id = %sender_id,
                "joinCall descriptor does not match sender"
            );
            observability::record_envelope_dropped("unknown_sender");
            return;
        }

        if self.roster.contains(&sender_id) || self.links.contains_key(&sender_id) {
            info!(
                target: "mesh.actor.room",
                room_id = %self.room_id,
                participant_id = %sender_id,
                "Participant rejoined, replacing stale link"
            );
            self.close_link(&sender_id, CloseReason::Replaced).await;
        }

        self.departed_while_joining.remove(&sender_id);
        self.roster
            .insert(Participant::from_descriptor(descriptor, Utc::now()));

        debug!(
            target: "mesh.actor.room",
            room_id = %self.room_id,
            participant_id = %sender_id,
            roster_size = self.roster.len(),
            "Participant joined, awaiting their offer"
        );
        self.emit(MeshEvent::ParticipantJoined {
            room_id: self.room_id.clone(),
            participant_id: sender_id,
        });
    }

    async fn handle_remote_leave(&mut self, sender_id: &ParticipantId, reason: LeaveReason) {
        if self.phase == CallPhase::Joining {
            self.departed_while_joining.insert(sender_id.clone());
        }
        let removed = self.roster.remove(sender_id);
        self.close_link(sender_id, CloseReason::RemoteLeft).await;

        if removed.is_some() {
            info!(
                target: "mesh.actor.room",
                room_id = %self.room_id,
                participant_id = %sender_id,
                reason = ?reason,
                roster_size = self.roster.len(),
                "Participant left"
            );
            self.emit(MeshEvent::ParticipantLeft {
                room_id: self.room_id.clone(),
                participant_id: sender_id.clone(),
                reason,
            });
        }
    }

    #[instrument(skip_all, name = "mesh.room.roster", fields(room_id = %self.room_id))]
    async fn handle_existing_participants(&mut self, roster: &[ParticipantDescriptor]) {
        if self.phase != CallPhase::Joining {
            debug!(
                target: "mesh.actor.room",
                room_id = %self.room_id,
                phase = ?self.phase,
                "Ignoring roster outside of a join"
            );
            observability::record_envelope_dropped("not_in_call");
            return;
        }

        let now = Utc::now();
        let departed = std::mem::take(&mut self.departed_while_joining);
        let mut remotes = Vec::with_capacity(roster.len());
        for descriptor in roster.iter().filter(|d| d.id != self.local_id) {
            if departed.contains(&descriptor.id) {
                debug!(
                    target: "mesh.actor.room",
                    room_id = %self.room_id,
                    participant_id = %descriptor.id,
                    "Skipping participant that left before the roster arrived"
                );
                continue;
            }
            self.roster
                .insert(Participant::from_descriptor(descriptor, now));
            remotes.push(descriptor.id.clone());
        }

        self.phase = CallPhase::InCall;

        for remote_id in remotes {
            self.offer_to(remote_id, 1).await;
        }

        info!(
            target: "mesh.actor.room",
            room_id = %self.room_id,
            local_id = %self.local_id,
            roster_size = self.roster.len(),
            offers = self.links.len(),
            "Joined call"
        );

        if let Some(pending) = self.pending_join.take() {
            let _ = pending.respond_to.send(Ok(self.snapshot()));
        }
    }

    async fn handle_offer(&mut self, sender_id: ParticipantId, offer: SessionDescription) {
        let Some(media) = self.media_handle else {
            return;
        };

        match self.links.get(&sender_id).map(Link::state) {
            Some(LinkState::Connected) => {
                if let Err(e) = self.answer_renegotiation(&sender_id, &offer).await {
                    warn!(
                        target: "mesh.link",
                        room_id = %self.room_id,
                        remote_id = %sender_id,
                        error = %e,
                        "Failed to answer renegotiation"
                    );
                    self.close_link(&sender_id, CloseReason::RenegotiationFailed)
                        .await;
                }
                return;
            }
            Some(state) => {
                debug!(
                    target: "mesh.link",
                    room_id = %self.room_id,
                    remote_id = %sender_id,
                    state = %state,
                    "Offer for a pending link, answering theirs"
                );
                self.close_link(&sender_id, CloseReason::Replaced).await;
            }
            None => {}
        }

        if let Err(e) = self.answer_offer(&sender_id, media, &offer).await {
            self.fail_link(&sender_id, LinkFailure::Engine(e.to_string()))
                .await;
        }
    }

    async fn answer_offer(
        &mut self,
        remote_id: &ParticipantId,
        media: MediaHandle,
        offer: &SessionDescription,
    ) -> Result<(), MeshError> {
        self.engine
            .open(&self.room_id, remote_id, media, self.engine_tx.clone())
            .await?;

        let mut answer = self
            .engine
            .create_answer(&self.room_id, remote_id, offer)
            .await?;
        if let Some(id) = &offer.negotiation_id {
            answer = answer.with_negotiation_id(id.clone());
        }

        let mut link = Link::new(self.local_id.clone(), remote_id.clone());
        let flushed = link.begin_answer()?;
        self.insert_link(link);
        observability::record_link_transition(LinkState::Answering.as_str());
        self.apply_candidates(remote_id, flushed).await;

        self.publish(SignalingEnvelope::addressed(
            self.room_id.clone(),
            self.local_id.clone(),
            remote_id.clone(),
            SignalingEvent::Answer(answer),
        ))
        .await?;

        self.links
            .get_mut(remote_id)
            .ok_or_else(|| MeshError::LinkNotFound(remote_id.to_string()))?
            .answer_sent()?;
        observability::record_link_transition(LinkState::Connected.as_str());

        info!(
            target: "mesh.link",
            room_id = %self.room_id,
            remote_id = %remote_id,
            "Link connected (answerer)"
        );
        self.emit(MeshEvent::LinkConnected {
            room_id: self.room_id.clone(),
            remote_id: remote_id.clone(),
        });
        Ok(())
    }

    async fn answer_renegotiation(
        &mut self,
        remote_id: &ParticipantId,
        offer: &SessionDescription,
    ) -> Result<(), MeshError> {
        let mut answer = self
            .engine
            .create_answer(&self.room_id, remote_id, offer)
            .await?
            .renegotiating();
        if let Some(id) = &offer.negotiation_id {
            answer = answer.with_negotiation_id(id.clone());
        }

        self.publish(SignalingEnvelope::addressed(
            self.room_id.clone(),
            self.local_id.clone(),
            remote_id.clone(),
            SignalingEvent::Answer(answer),
        ))
        .await?;

        self.links
            .get_mut(remote_id)
            .ok_or_else(|| MeshError::LinkNotFound(remote_id.to_string()))?
            .accept_remote_renegotiation()?;

        debug!(
            target: "mesh.link",
            room_id = %self.room_id,
            remote_id = %remote_id,
            "Renegotiation answered"
        );
        Ok(())
    }

    async fn handle_answer(&mut self, sender_id: ParticipantId, answer: SessionDescription) {
        let Some(link) = self.links.get(&sender_id) else {
            debug!(
                target: "mesh.link",
                room_id = %self.room_id,
                remote_id = %sender_id,
                "Dropping answer without a link"
            );
            observability::record_envelope_dropped("no_link");
            return;
        };

        let initial = link.state() == LinkState::Offering;
        if !(initial || link.is_renegotiating())
            || !link.answers_current_offer(answer.negotiation_id.as_deref())
        {
            debug!(
                target: "mesh.link",
                room_id = %self.room_id,
                remote_id = %sender_id,
                state = %link.state(),
                "Dropping stale answer"
            );
            observability::record_envelope_dropped("stale_answer");
            return;
        }

        if let Err(e) = self
            .engine
            .set_remote_description(&self.room_id, &sender_id, &answer)
            .await
        {
            warn!(
                target: "mesh.link",
                room_id = %self.room_id,
                remote_id = %sender_id,
                error = %e,
                "Failed to apply remote answer"
            );
            if initial {
                self.fail_link(&sender_id, LinkFailure::Engine(e.to_string()))
                    .await;
            } else {
                self.close_link(&sender_id, CloseReason::RenegotiationFailed)
                    .await;
            }
            return;
        }

        let (flushed, negotiation_time) = match self.links.get_mut(&sender_id) {
            Some(link) => match link.apply_answer() {
                Ok(flushed) => (flushed, link.created_at().elapsed()),
                Err(e) => {
                    warn!(
                        target: "mesh.link",
                        room_id = %self.room_id,
                        remote_id = %sender_id,
                        error = %e,
                        "Answer rejected by link"
                    );
                    return;
                }
            },
            None => return,
        };

        // Queued candidates go in right after the description
        self.apply_candidates(&sender_id, flushed).await;

        if initial {
            observability::record_link_transition(LinkState::Connected.as_str());
            observability::record_negotiation_duration(negotiation_time);
            info!(
                target: "mesh.link",
                room_id = %self.room_id,
                remote_id = %sender_id,
                "Link connected (offerer)"
            );
            self.emit(MeshEvent::LinkConnected {
                room_id: self.room_id.clone(),
                remote_id: sender_id,
            });
        } else {
            debug!(
                target: "mesh.link",
                room_id = %self.room_id,
                remote_id = %sender_id,
                "Renegotiation complete"
            );
        }
    }

    async fn handle_remote_candidate(&mut self, sender_id: ParticipantId, candidate: CandidatePayload) {
        let Some(link) = self.links.get_mut(&sender_id) else {
            debug!(
                target: "mesh.link",
                room_id = %self.room_id,
                remote_id = %sender_id,
                "Dropping candidate without a link"
            );
            observability::record_envelope_dropped("no_link");
            return;
        };

        match link.accept_candidate(candidate) {
            Ok(CandidateDisposition::Apply(ready)) => {
                self.apply_candidates(&sender_id, ready).await;
            }
            Ok(CandidateDisposition::Queued) => {
                debug!(
                    target: "mesh.link",
                    room_id = %self.room_id,
                    remote_id = %sender_id,
                    queued = link.pending_candidate_count(),
                    "Candidate queued until remote description"
                );
            }
            Err(e) => {
                debug!(
                    target: "mesh.link",
                    room_id = %self.room_id,
                    remote_id = %sender_id,
                    error = %e,
                    "Candidate ignored"
                );
            }
        }
    }

    async fn handle_error(&mut self, sender_id: &ParticipantId, payload: ErrorPayload) {
        warn!(
            target: "mesh.actor.room",
            room_id = %self.room_id,
            sender_id = %sender_id,
            code = payload.code,
            message = %payload.message,
            "Error envelope received"
        );

        let refused = self.phase == CallPhase::Joining && payload.code == CAPACITY_EXCEEDED_CODE;

        self.emit(MeshEvent::RemoteError {
            room_id: self.room_id.clone(),
            code: payload.code,
            message: payload.message,
        });

        if refused {
            if let Some(pending) = self.pending_join.take() {
                // Incumbents saw our joinCall; retract it
                let _ = self
                    .publish(SignalingEnvelope::broadcast(
                        self.room_id.clone(),
                        self.local_id.clone(),
                        SignalingEvent::LeaveCall(LeavePayload::default()),
                    ))
                    .await;
                self.release_media().await;
                self.roster.clear();
                self.finish(CallEndReason::JoinFailed);
                let _ = pending
                    .respond_to
                    .send(Err(MeshError::RoomCapacityExceeded(self.room_id.to_string())));
            }
        }
    }

    // ------------------------------------------------------------------
    // Engine events, deadlines, teardown
    // ------------------------------------------------------------------

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate {
                remote_id,
                candidate,
                ..
            } => {
                if !self.links.contains_key(&remote_id) {
                    debug!(
                        target: "mesh.link",
                        room_id = %self.room_id,
                        remote_id = %remote_id,
                        "Local candidate for a closed link"
                    );
                    return;
                }
                let envelope = SignalingEnvelope::addressed(
                    self.room_id.clone(),
                    self.local_id.clone(),
                    remote_id.clone(),
                    SignalingEvent::IceCandidate(candidate),
                );
                if let Err(e) = self.publish(envelope).await {
                    warn!(
                        target: "mesh.link",
                        room_id = %self.room_id,
                        remote_id = %remote_id,
                        error = %e,
                        "Failed to send local candidate"
                    );
                }
            }

            EngineEvent::ConnectionFailed {
                remote_id, reason, ..
            } => {
                if self.links.contains_key(&remote_id) {
                    self.fail_link(&remote_id, LinkFailure::Engine(reason))
                        .await;
                }
            }
        }
    }

    async fn check_deadlines(&mut self) {
        let now = Instant::now();

        if self
            .pending_join
            .as_ref()
            .is_some_and(|pending| now >= pending.deadline)
        {
            self.fail_pending_join().await;
            return;
        }

        let mut expired: Vec<(ParticipantId, LinkState, bool, u32)> = self
            .links
            .values()
            .filter(|link| link.deadline_expired(now))
            .map(|link| {
                (
                    link.remote_id().clone(),
                    link.state(),
                    link.is_renegotiating(),
                    link.attempt(),
                )
            })
            .collect();
        expired.sort_by(|a, b| a.0.cmp(&b.0));

        for (remote_id, state, renegotiating, attempt) in expired {
            if state == LinkState::Offering {
                if attempt < self.config.max_negotiation_attempts() {
                    warn!(
                        target: "mesh.link",
                        room_id = %self.room_id,
                        remote_id = %remote_id,
                        attempt,
                        "Negotiation timed out, re-offering"
                    );
                    observability::record_negotiation_timeout("retried");
                    self.close_link(&remote_id, CloseReason::RetryScheduled)
                        .await;
                    self.offer_to(remote_id, attempt + 1).await;
                } else {
                    observability::record_negotiation_timeout("failed");
                    self.fail_link(&remote_id, LinkFailure::NegotiationTimeout)
                        .await;
                }
            } else if renegotiating {
                observability::record_negotiation_timeout("renegotiation");
                self.close_link(&remote_id, CloseReason::RenegotiationFailed)
                    .await;
            }
        }
    }

    async fn fail_pending_join(&mut self) {
        let Some(pending) = self.pending_join.take() else {
            return;
        };

        warn!(
            target: "mesh.actor.room",
            room_id = %self.room_id,
            "Presence did not answer the join in time"
        );

        // Presence may still admit us; make sure it drops the entry
        let envelope = SignalingEnvelope::broadcast(
            self.room_id.clone(),
            self.local_id.clone(),
            SignalingEvent::LeaveCall(LeavePayload::default()),
        );
        let _ = self.publish(envelope).await;

        self.release_media().await;
        self.roster.clear();
        self.finish(CallEndReason::JoinFailed);
        let _ = pending
            .respond_to
            .send(Err(MeshError::JoinTimeout(self.room_id.to_string())));
    }

    async fn handle_relay_lost(&mut self) {
        if self.phase == CallPhase::Ended {
            return;
        }

        warn!(
            target: "mesh.actor.room",
            room_id = %self.room_id,
            local_id = %self.local_id,
            links = self.links.len(),
            "Relay connection lost, tearing down call"
        );

        self.close_all_links(CloseReason::RelayDisconnected).await;
        self.release_media().await;
        self.roster.clear();

        if let Some(pending) = self.pending_join.take() {
            let _ = pending.respond_to.send(Err(MeshError::RelayDisconnected));
        }

        self.finish(CallEndReason::RelayDisconnected);
    }

    async fn graceful_shutdown(&mut self) {
        if matches!(self.phase, CallPhase::Joining | CallPhase::InCall) {
            let envelope = SignalingEnvelope::broadcast(
                self.room_id.clone(),
                self.local_id.clone(),
                SignalingEvent::LeaveCall(LeavePayload::default()),
            );
            let _ = self.publish(envelope).await;
            self.close_all_links(CloseReason::Shutdown).await;
            self.release_media().await;
            self.roster.clear();
        }

        if let Some(pending) = self.pending_join.take() {
            let _ = pending.respond_to.send(Err(MeshError::Draining));
        }

        if self.phase != CallPhase::Ended {
            self.finish(CallEndReason::Shutdown);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Open a fresh link to `remote_id` and send the offer.
    async fn offer_to(&mut self, remote_id: ParticipantId, attempt: u32) {
        let Some(media) = self.media_handle else {
            return;
        };

        if let Err(e) = self.send_offer(&remote_id, media, attempt).await {
            warn!(
                target: "mesh.link",
                room_id = %self.room_id,
                remote_id = %remote_id,
                attempt,
                error = %e,
                "Failed to send offer"
            );
            self.fail_link(&remote_id, LinkFailure::Engine(e.to_string()))
                .await;
        }
    }

    async fn send_offer(
        &mut self,
        remote_id: &ParticipantId,
        media: MediaHandle,
        attempt: u32,
    ) -> Result<(), MeshError> {
        self.engine
            .open(&self.room_id, remote_id, media, self.engine_tx.clone())
            .await?;

        let negotiation_id = Uuid::new_v4().to_string();
        let offer = self
            .engine
            .create_offer(&self.room_id, remote_id, false)
            .await?
            .with_negotiation_id(negotiation_id.clone());

        let mut link = Link::new(self.local_id.clone(), remote_id.clone());
        link.begin_offer(
            negotiation_id,
            attempt,
            Instant::now() + self.config.negotiation_timeout,
        )?;
        self.insert_link(link);
        observability::record_link_transition(LinkState::Offering.as_str());

        self.publish(SignalingEnvelope::addressed(
            self.room_id.clone(),
            self.local_id.clone(),
            remote_id.clone(),
            SignalingEvent::Offer(offer),
        ))
        .await?;

        debug!(
            target: "mesh.link",
            room_id = %self.room_id,
            remote_id = %remote_id,
            attempt,
            "Offer sent"
        );
        Ok(())
    }

    async fn apply_candidates(&self, remote_id: &ParticipantId, candidates: Vec<CandidatePayload>) {
        for candidate in candidates {
            if let Err(e) = self
                .engine
                .add_candidate(&self.room_id, remote_id, &candidate)
                .await
            {
                warn!(
                    target: "mesh.link",
                    room_id = %self.room_id,
                    remote_id = %remote_id,
                    error = %e,
                    "Failed to apply remote candidate"
                );
            }
        }
    }

    async fn publish(&self, envelope: SignalingEnvelope) -> Result<(), MeshError> {
        let event = envelope.kind().as_str();
        self.relay.publish(&self.room_id, envelope).await?;
        observability::record_envelope(event, "out");
        Ok(())
    }

    fn insert_link(&mut self, link: Link) {
        if self
            .links
            .insert(link.remote_id().clone(), link)
            .is_none()
        {
            self.metrics.link_opened();
        }
    }

    fn take_link(&mut self, remote_id: &ParticipantId) -> Option<Link> {
        let link = self.links.remove(remote_id);
        if link.is_some() {
            self.metrics.link_closed();
        }
        link
    }

    async fn close_link(&mut self, remote_id: &ParticipantId, reason: CloseReason) {
        let Some(mut link) = self.take_link(remote_id) else {
            return;
        };
        let discarded = link.close();
        self.engine.close(&self.room_id, remote_id).await;
        observability::record_link_transition(LinkState::Closed.as_str());

        debug!(
            target: "mesh.link",
            room_id = %self.room_id,
            remote_id = %remote_id,
            reason = ?reason,
            discarded_candidates = discarded,
            "Link closed"
        );
        self.emit(MeshEvent::LinkClosed {
            room_id: self.room_id.clone(),
            remote_id: remote_id.clone(),
            reason,
        });
    }

    async fn fail_link(&mut self, remote_id: &ParticipantId, failure: LinkFailure) {
        if let Some(mut link) = self.take_link(remote_id) {
            link.fail();
        }
        self.engine.close(&self.room_id, remote_id).await;
        observability::record_link_transition(LinkState::Failed.as_str());

        warn!(
            target: "mesh.link",
            room_id = %self.room_id,
            remote_id = %remote_id,
            failure = ?failure,
            "Link failed"
        );
        self.emit(MeshEvent::LinkFailed {
            room_id: self.room_id.clone(),
            remote_id: remote_id.clone(),
            failure,
        });
    }

    async fn close_all_links(&mut self, reason: CloseReason) {
        let mut remotes: Vec<ParticipantId> = self.links.keys().cloned().collect();
        remotes.sort();
        for remote_id in remotes {
            self.close_link(&remote_id, reason).await;
        }
    }

    async fn release_media(&mut self) {
        if let Some(handle) = self.media_handle.take() {
            self.media.release(handle).await;
            debug!(
                target: "mesh.media",
                room_id = %self.room_id,
                handle = handle.id(),
                "Local media released"
            );
        }
    }

    /// Mark the call over. Stops accepting requests before any reply goes
    /// out so the controller never hands out an ended room.
    fn finish(&mut self, reason: CallEndReason) {
        self.phase = CallPhase::Ended;
        self.receiver.close();
        info!(
            target: "mesh.actor.room",
            room_id = %self.room_id,
            reason = ?reason,
            "Call ended"
        );
        self.emit(MeshEvent::CallEnded {
            room_id: self.room_id.clone(),
            reason,
        });
    }

    fn emit(&self, event: MeshEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
