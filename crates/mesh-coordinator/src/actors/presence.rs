//! Presence actors - the authoritative roster for each served room.
//!
//! `PresenceService` supervises one `PresenceActor` per room. The service
//! owns a single relay identity (`presence`) and subscribes it to every room
//! it serves.
//!
//! # Presence Rules
//!
//! - A `joinCall` admits the sender and answers with an addressed
//!   `existingParticipants` carrying the roster as it was before the join.
//! - Rosters are ordered by admission time; admission times strictly
//!   increase within a room.
//! - A dropped transport session only removes the participant after the
//!   disconnect debounce, and a rejoin within the debounce cancels it.
//! - On expiry presence publishes `leaveCall` on behalf of the departed
//!   participant so every remaining member tears its link down.

use crate::config::Config;
use crate::errors::{MeshError, CAPACITY_EXCEEDED_CODE};
use crate::observability;
use crate::presence::CallSession;
use crate::relay::{Relay, RelayEvent, Subscription};

use super::messages::{PresenceMessage, PresenceRoomMessage, PresenceRoomState, PresenceStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::{ParticipantId, RoomId, SessionId};
use signaling_protocol::{
    ErrorPayload, LeavePayload, LeaveReason, ParticipantDescriptor, SignalingEnvelope,
    SignalingEvent,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the service mailbox.
const PRESENCE_CHANNEL_BUFFER: usize = 1000;

/// Default channel buffer size for a per-room presence mailbox.
const PRESENCE_ROOM_CHANNEL_BUFFER: usize = 500;

/// Handle to the `PresenceService`.
#[derive(Clone)]
pub struct PresenceServiceHandle {
    sender: mpsc::Sender<PresenceMessage>,
    cancel_token: CancellationToken,
}

impl PresenceServiceHandle {
    /// Spawn the service. `relay` is the presence identity's client.
    #[must_use]
    pub fn new(config: Arc<Config>, relay: Arc<dyn Relay>, metrics: Arc<ActorMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(PRESENCE_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = PresenceService::new(receiver, cancel_token.clone(), config, relay, metrics);
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Start serving presence for `room_id`. Opening a served room is a no-op.
    pub async fn open_room(&self, room_id: RoomId) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PresenceMessage::OpenRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    /// Stop serving presence for `room_id`.
    pub async fn close_room(&self, room_id: RoomId) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PresenceMessage::CloseRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    /// Report a dropped transport session learned outside the relay.
    pub async fn handle_relay_disconnect(
        &self,
        participant_id: ParticipantId,
        session_id: SessionId,
    ) -> Result<(), MeshError> {
        self.sender
            .send(PresenceMessage::RelayDisconnected {
                participant_id,
                session_id,
            })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))
    }

    /// Handle to the per-room actor.
    pub async fn room(&self, room_id: RoomId) -> Result<PresenceRoomHandle, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PresenceMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    /// Roster and pending disconnects of one room.
    pub async fn room_state(&self, room_id: RoomId) -> Result<PresenceRoomState, MeshError> {
        self.room(room_id).await?.get_state().await
    }

    /// Rooms whose roster contains `participant_id`, sorted.
    pub async fn rooms_of(&self, participant_id: ParticipantId) -> Result<Vec<RoomId>, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PresenceMessage::RoomsOf {
                participant_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_status(&self) -> Result<PresenceStatus, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PresenceMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop every presence actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct ManagedRoom {
    handle: PresenceRoomHandle,
    task_handle: JoinHandle<()>,
}

/// Supervisor for the per-room presence actors.
pub struct PresenceService {
    identity: ParticipantId,
    receiver: mpsc::Receiver<PresenceMessage>,
    cancel_token: CancellationToken,
    config: Arc<Config>,
    relay: Arc<dyn Relay>,
    rooms: HashMap<RoomId, ManagedRoom>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl PresenceService {
    fn new(
        receiver: mpsc::Receiver<PresenceMessage>,
        cancel_token: CancellationToken,
        config: Arc<Config>,
        relay: Arc<dyn Relay>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let identity = relay.local_id().clone();
        let mailbox = MailboxMonitor::new(ActorType::Presence, identity.as_str());

        Self {
            identity,
            receiver,
            cancel_token,
            config,
            relay,
            rooms: HashMap::new(),
            metrics,
            mailbox,
        }
    }

    #[instrument(skip_all, name = "mesh.actor.presence", fields(identity = %self.identity))]
    async fn run(mut self) {
        info!(
            target: "mesh.actor.presence",
            identity = %self.identity,
            "PresenceService started"
        );

        loop {
            self.check_room_health();

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "mesh.actor.presence",
                        identity = %self.identity,
                        "PresenceService received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
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
                                target: "mesh.actor.presence",
                                identity = %self.identity,
                                "PresenceService channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "mesh.actor.presence",
            identity = %self.identity,
            messages_processed = self.mailbox.messages_processed(),
            "PresenceService stopped"
        );
    }

    async fn handle_message(&mut self, message: PresenceMessage) {
        match message {
            PresenceMessage::OpenRoom {
                room_id,
                respond_to,
            } => {
                let result = self.open_room(room_id).await;
                let _ = respond_to.send(result);
            }

            PresenceMessage::CloseRoom {
                room_id,
                respond_to,
            } => {
                let result = self.close_room(&room_id);
                let _ = respond_to.send(result);
            }

            PresenceMessage::RelayDisconnected {
                participant_id,
                session_id,
            } => {
                for managed in self.rooms.values() {
                    if let Err(e) = managed
                        .handle
                        .peer_disconnected(participant_id.clone(), session_id.clone())
                        .await
                    {
                        debug!(
                            target: "mesh.actor.presence",
                            room_id = %managed.handle.room_id(),
                            error = %e,
                            "Presence room unavailable for disconnect notice"
                        );
                    }
                }
            }

            PresenceMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let result = self
                    .rooms
                    .get(&room_id)
                    .map(|managed| managed.handle.clone())
                    .ok_or_else(|| MeshError::RoomNotFound(room_id.to_string()));
                let _ = respond_to.send(result);
            }

            PresenceMessage::RoomsOf {
                participant_id,
                respond_to,
            } => {
                let rooms = self.rooms_of(&participant_id).await;
                let _ = respond_to.send(rooms);
            }

            PresenceMessage::GetStatus { respond_to } => {
                let mut rooms: Vec<RoomId> = self.rooms.keys().cloned().collect();
                rooms.sort();
                let _ = respond_to.send(PresenceStatus {
                    rooms,
                    participant_count: self.metrics.presence_participant_count(),
                    mailbox_depth: self.mailbox.current_depth(),
                });
            }
        }
    }

    async fn open_room(&mut self, room_id: RoomId) -> Result<(), MeshError> {
        if self
            .rooms
            .get(&room_id)
            .is_some_and(|managed| !managed.task_handle.is_finished())
        {
            return Ok(());
        }

        let subscription = self.relay.subscribe(&room_id).await?;
        let (handle, task_handle) = PresenceActor::spawn(
            subscription,
            Arc::clone(&self.relay),
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
            self.cancel_token.child_token(),
        );
        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle,
                task_handle,
            },
        );

        info!(
            target: "mesh.actor.presence",
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Presence room opened"
        );
        Ok(())
    }

    fn close_room(&mut self, room_id: &RoomId) -> Result<(), MeshError> {
        let managed = self
            .rooms
            .remove(room_id)
            .ok_or_else(|| MeshError::RoomNotFound(room_id.to_string()))?;

        managed.handle.cancel();

        let room_id_owned = room_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "mesh.actor.presence",
                        room_id = %room_id_owned,
                        "Presence room task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "mesh.actor.presence",
                        room_id = %room_id_owned,
                        error = ?e,
                        "Presence room task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "mesh.actor.presence",
                        room_id = %room_id_owned,
                        "Presence room task cleanup timed out"
                    );
                }
            }
        });

        info!(
            target: "mesh.actor.presence",
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Presence room closed"
        );
        Ok(())
    }

    async fn rooms_of(&self, participant_id: &ParticipantId) -> Vec<RoomId> {
        let mut rooms = Vec::new();
        for (room_id, managed) in &self.rooms {
            match managed.handle.get_state().await {
                Ok(state) if state.roster.iter().any(|p| &p.id == participant_id) => {
                    rooms.push(room_id.clone());
                }
                Ok(_) => {}
                Err(_) => {
                    warn!(
                        target: "mesh.actor.presence",
                        room_id = %room_id,
                        "Failed to query presence room state"
                    );
                }
            }
        }
        rooms.sort();
        rooms
    }

    /// Drop rooms whose actor exited, recording panics.
    fn check_room_health(&mut self) {
        let finished: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };
            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                match managed.task_handle.await {
                    Ok(()) => {
                        warn!(
                            target: "mesh.actor.presence",
                            room_id = %room_id,
                            "Presence room exited unexpectedly"
                        );
                    }
                    Err(join_error) if join_error.is_panic() => {
                        metrics.record_panic(ActorType::Presence);
                        error!(
                            target: "mesh.actor.presence",
                            room_id = %room_id,
                            "Presence room panicked"
                        );
                    }
                    Err(_) => {}
                }
            });
        }
    }

    async fn graceful_shutdown(&mut self) {
        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(Duration::from_secs(30), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "mesh.actor.presence",
                        room_id = %room_id,
                        "Presence room completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "mesh.actor.presence",
                        room_id = %room_id,
                        error = ?e,
                        "Presence room panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "mesh.actor.presence",
                        room_id = %room_id,
                        "Presence room shutdown timed out"
                    );
                }
            }
        }
    }
}

/// Handle to one room's `PresenceActor`.
#[derive(Clone, Debug)]
pub struct PresenceRoomHandle {
    sender: mpsc::Sender<PresenceRoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
}

impl PresenceRoomHandle {
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Start the disconnect debounce for a participant's session.
    pub async fn peer_disconnected(
        &self,
        participant_id: ParticipantId,
        session_id: SessionId,
    ) -> Result<(), MeshError> {
        self.sender
            .send(PresenceRoomMessage::PeerDisconnected {
                participant_id,
                session_id,
            })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))
    }

    pub async fn get_state(&self) -> Result<PresenceRoomState, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PresenceRoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// Running disconnect debounce.
struct PendingDisconnect {
    session_id: SessionId,
    deadline: Instant,
}

/// Roster keeper for one room.
pub struct PresenceActor {
    room_id: RoomId,
    identity: ParticipantId,
    receiver: mpsc::Receiver<PresenceRoomMessage>,
    cancel_token: CancellationToken,
    subscription: Subscription,
    relay: Arc<dyn Relay>,
    config: Arc<Config>,
    /// Present while the room has members.
    session: Option<CallSession>,
    pending_disconnects: HashMap<ParticipantId, PendingDisconnect>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl PresenceActor {
    pub fn spawn(
        subscription: Subscription,
        relay: Arc<dyn Relay>,
        config: Arc<Config>,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> (PresenceRoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(PRESENCE_ROOM_CHANNEL_BUFFER);
        let room_id = subscription.room_id().clone();

        let actor = Self {
            room_id: room_id.clone(),
            identity: relay.local_id().clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            subscription,
            relay,
            config,
            session: None,
            pending_disconnects: HashMap::new(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Presence, room_id.as_str()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = PresenceRoomHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "mesh.actor.presence", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        debug!(
            target: "mesh.actor.presence",
            room_id = %self.room_id,
            "PresenceActor started"
        );

        let mut debounce_check = tokio::time::interval(self.config.timer_resolution);
        debounce_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    break;
                }

                _ = debounce_check.tick() => {
                    self.expire_disconnects().await;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        break;
                    };
                    self.mailbox.record_enqueue();
                    self.handle_message(message);
                    self.mailbox.record_dequeue();
                    self.metrics.record_message_processed();
                }

                event = self.subscription.recv() => {
                    match event {
                        Some(RelayEvent::Envelope(envelope)) => {
                            self.handle_envelope(envelope).await;
                        }
                        Some(RelayEvent::PeerDisconnected { participant_id, session_id }) => {
                            self.start_debounce(participant_id, &session_id);
                        }
                        Some(RelayEvent::ConnectionLost) | None => {
                            error!(
                                target: "mesh.actor.presence",
                                room_id = %self.room_id,
                                "Presence lost its relay connection"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.relay.unsubscribe(&self.room_id).await;
        if let Some(session) = self.session.take() {
            for _ in 0..session.len() {
                self.metrics.participant_removed();
            }
        }

        debug!(
            target: "mesh.actor.presence",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "PresenceActor stopped"
        );
    }

    fn handle_message(&mut self, message: PresenceRoomMessage) {
        match message {
            PresenceRoomMessage::PeerDisconnected {
                participant_id,
                session_id,
            } => {
                self.start_debounce(participant_id, &session_id);
            }

            PresenceRoomMessage::GetState { respond_to } => {
                let mut pending_disconnects: Vec<ParticipantId> =
                    self.pending_disconnects.keys().cloned().collect();
                pending_disconnects.sort();
                let _ = respond_to.send(PresenceRoomState {
                    room_id: self.room_id.clone(),
                    roster: self
                        .session
                        .as_ref()
                        .map(CallSession::roster)
                        .unwrap_or_default(),
                    pending_disconnects,
                });
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        if envelope.sender_id == self.identity {
            return;
        }

        match envelope.event {
            SignalingEvent::JoinCall(descriptor) => {
                observability::record_envelope("joinCall", "in");
                self.handle_join(envelope.sender_id, descriptor).await;
            }
            SignalingEvent::LeaveCall(payload) => {
                observability::record_envelope("leaveCall", "in");
                self.handle_leave(&envelope.sender_id, payload.reason);
            }
            // Negotiation is peer to peer
            _ => {}
        }
    }

    async fn handle_join(&mut self, sender_id: ParticipantId, descriptor: ParticipantDescriptor) {
        if descriptor.id != sender_id {
            warn!(
                target: "mesh.actor.presence",
                room_id = %self.room_id,
                sender_id = %sender_id,
                "joinCall descriptor does not match sender"
            );
            observability::record_envelope_dropped("unknown_sender");
            return;
        }

        let room_id = self.room_id.clone();
        let session = self
            .session
            .get_or_insert_with(|| CallSession::new(room_id));

        if !session.contains(&sender_id) && session.len() >= self.config.max_room_participants {
            warn!(
                target: "mesh.actor.presence",
                room_id = %self.room_id,
                participant_id = %sender_id,
                capacity = self.config.max_room_participants,
                "Room is full, join refused"
            );
            if session.is_empty() {
                self.session = None;
            }
            let refusal = SignalingEnvelope::addressed(
                self.room_id.clone(),
                self.identity.clone(),
                sender_id,
                SignalingEvent::Error(ErrorPayload {
                    code: CAPACITY_EXCEEDED_CODE,
                    message: "room is full".to_string(),
                }),
            );
            self.publish(refusal).await;
            return;
        }

        if self.pending_disconnects.remove(&sender_id).is_some() {
            info!(
                target: "mesh.actor.presence",
                room_id = %self.room_id,
                participant_id = %sender_id,
                "Rejoin within debounce, disconnect cancelled"
            );
        }

        let outcome = session.admit(
            sender_id.clone(),
            descriptor.display_name,
            descriptor.session_id,
        );
        if outcome.replaced.is_none() {
            self.metrics.participant_admitted();
        }
        let roster_size = session.len();

        info!(
            target: "mesh.actor.presence",
            room_id = %self.room_id,
            participant_id = %sender_id,
            rejoin = outcome.replaced.is_some(),
            roster_size,
            "Participant admitted"
        );

        let roster = outcome
            .previous_roster
            .iter()
            .map(|participant| participant.to_descriptor())
            .collect();
        let reply = SignalingEnvelope::addressed(
            self.room_id.clone(),
            self.identity.clone(),
            sender_id,
            SignalingEvent::ExistingParticipants(roster),
        );
        self.publish(reply).await;
    }

    fn handle_leave(&mut self, sender_id: &ParticipantId, reason: LeaveReason) {
        self.pending_disconnects.remove(sender_id);

        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.remove(sender_id).is_none() {
            return;
        }
        self.metrics.participant_removed();

        info!(
            target: "mesh.actor.presence",
            room_id = %self.room_id,
            participant_id = %sender_id,
            reason = ?reason,
            roster_size = session.len(),
            "Participant left"
        );

        if session.is_empty() {
            self.session = None;
        }
    }

    fn start_debounce(&mut self, participant_id: ParticipantId, session_id: &SessionId) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if !session.contains(&participant_id) || self.pending_disconnects.contains_key(&participant_id)
        {
            return;
        }
        // A drop of an older session must not evict a newer one
        if session
            .session_of(&participant_id)
            .is_some_and(|current| current != session_id)
        {
            debug!(
                target: "mesh.actor.presence",
                room_id = %self.room_id,
                participant_id = %participant_id,
                "Ignoring disconnect of a superseded session"
            );
            return;
        }

        debug!(
            target: "mesh.actor.presence",
            room_id = %self.room_id,
            participant_id = %participant_id,
            debounce_ms = u64::try_from(self.config.disconnect_debounce.as_millis()).unwrap_or(u64::MAX),
            "Disconnect debounce started"
        );
        self.pending_disconnects.insert(
            participant_id,
            PendingDisconnect {
                session_id: session_id.clone(),
                deadline: Instant::now() + self.config.disconnect_debounce,
            },
        );
    }

    async fn expire_disconnects(&mut self) {
        let now = Instant::now();
        let mut expired: Vec<ParticipantId> = self
            .pending_disconnects
            .iter()
            .filter(|(_, pending)| now >= pending.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        for participant_id in expired {
            let Some(pending) = self.pending_disconnects.remove(&participant_id) else {
                continue;
            };
            let Some(session) = self.session.as_mut() else {
                continue;
            };
            if session.remove(&participant_id).is_none() {
                continue;
            }
            self.metrics.participant_removed();
            if session.is_empty() {
                self.session = None;
            }

            info!(
                target: "mesh.actor.presence",
                room_id = %self.room_id,
                participant_id = %participant_id,
                session_id = %pending.session_id,
                "Disconnect debounce expired, participant removed"
            );

            let leave = SignalingEnvelope::broadcast(
                self.room_id.clone(),
                participant_id,
                SignalingEvent::LeaveCall(LeavePayload {
                    reason: LeaveReason::Disconnected,
                }),
            );
            self.publish(leave).await;
        }
    }

    async fn publish(&self, envelope: SignalingEnvelope) {
        let event = envelope.kind().as_str();
        match self.relay.publish(&self.room_id, envelope).await {
            Ok(()) => observability::record_envelope(event, "out"),
            Err(e) => {
                warn!(
                    target: "mesh.actor.presence",
                    room_id = %self.room_id,
                    event,
                    error = %e,
                    "Presence publish failed"
                );
            }
        }
    }
}
