//! `MeshController` - supervisor for one local participant's rooms.
//!
//! The controller is the top-level actor for a local participant:
//!
//! - One per local participant (one relay identity)
//! - Supervises one `RoomActor` per joined room
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! Joins and leaves are driven through the room handle outside the
//! controller loop, so a slow negotiation in one room never blocks another.
//!
//! # Graceful Shutdown
//!
//! 1. Sets `accepting_new = false`
//! 2. Cancels the root `CancellationToken` (propagates to all rooms)
//! 3. Each room publishes `leaveCall`, closes its links and releases media
//! 4. Waits for the room tasks up to the shutdown deadline

use crate::config::Config;
use crate::errors::MeshError;
use crate::media::{LocalMedia, PeerEngine, TrackKind};
use crate::relay::Relay;

use super::messages::{ControllerMessage, ControllerStatus, MeshEvent, RoomSnapshot};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomContext};

use common::types::{ParticipantId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 1000;

/// Capacity of the mesh event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long a room task gets to finish when the controller stops.
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Handle to the `MeshController`.
///
/// This is the public interface of the coordinator for one local
/// participant. All methods are async and return results via oneshot
/// channels.
#[derive(Clone)]
pub struct MeshControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
    events: broadcast::Sender<MeshEvent>,
    participant_id: ParticipantId,
}

impl MeshControllerHandle {
    /// Create a new `MeshController` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    ///
    /// # Arguments
    ///
    /// * `config` - Timeouts and limits
    /// * `relay` - Relay client carrying the local identity
    /// * `media` - Local capture stream
    /// * `engine` - Peer-connection driver
    /// * `metrics` - Shared actor metrics
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        relay: Arc<dyn Relay>,
        media: Arc<dyn LocalMedia>,
        engine: Arc<dyn PeerEngine>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();
        let participant_id = relay.local_id().clone();

        let actor = MeshController::new(
            receiver,
            cancel_token.clone(),
            RoomContext {
                relay,
                media,
                engine,
                config,
                events: events.clone(),
                metrics: Arc::clone(&metrics),
            },
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            events,
            participant_id,
        }
    }

    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Subscribe to connection-level events from every room.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Join `room_id`.
    ///
    /// Resolves once presence answered and offers went out to every
    /// existing participant. Links connect asynchronously afterwards.
    pub async fn join_room(
        &self,
        room_id: RoomId,
        display_name: impl Into<String>,
    ) -> Result<RoomSnapshot, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::OpenRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        let room = rx
            .await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))??;

        room.join(display_name).await
    }

    /// Leave `room_id`.
    pub async fn leave_room(&self, room_id: RoomId) -> Result<(), MeshError> {
        self.room(room_id).await?.leave().await
    }

    /// Point-in-time view of a joined room.
    pub async fn room_snapshot(&self, room_id: RoomId) -> Result<RoomSnapshot, MeshError> {
        self.room(room_id).await?.snapshot().await
    }

    /// Mute or unmute a local track in `room_id`. Links are untouched.
    pub async fn set_track_enabled(
        &self,
        room_id: RoomId,
        track: TrackKind,
        enabled: bool,
    ) -> Result<(), MeshError> {
        self.room(room_id)
            .await?
            .set_track_enabled(track, enabled)
            .await
    }

    /// Renegotiate every connected link in `room_id`.
    pub async fn renegotiate(&self, room_id: RoomId) -> Result<usize, MeshError> {
        self.room(room_id).await?.renegotiate().await
    }

    /// Use `relay` for rooms joined from now on (after a relay loss).
    pub async fn replace_relay(&self, relay: Arc<dyn Relay>) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::ReplaceRelay {
                relay,
                respond_to: tx,
            })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get the current controller status.
    pub async fn get_status(&self) -> Result<ControllerStatus, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }

    /// Leave every room and stop. Rooms get `deadline` to finish.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn room(&self, room_id: RoomId) -> Result<RoomActorHandle, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }
}

/// Internal state for a supervised room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
}

impl ManagedRoom {
    /// Whether the room still takes requests.
    fn is_live(&self) -> bool {
        !self.task_handle.is_finished() && !self.handle.is_closed()
    }
}

/// The `MeshController` implementation.
pub struct MeshController {
    participant_id: ParticipantId,
    receiver: mpsc::Receiver<ControllerMessage>,
    cancel_token: CancellationToken,
    /// Collaborators handed to every new room.
    context: RoomContext,
    rooms: HashMap<RoomId, ManagedRoom>,
    accepting_new: bool,
    shutdown_deadline: Duration,
    mailbox: MailboxMonitor,
}

impl MeshController {
    fn new(
        receiver: mpsc::Receiver<ControllerMessage>,
        cancel_token: CancellationToken,
        context: RoomContext,
    ) -> Self {
        let participant_id = context.relay.local_id().clone();
        let mailbox = MailboxMonitor::new(ActorType::Controller, participant_id.as_str());

        Self {
            participant_id,
            receiver,
            cancel_token,
            context,
            rooms: HashMap::new(),
            accepting_new: true,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            mailbox,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "mesh.actor.controller", fields(participant_id = %self.participant_id))]
    async fn run(mut self) {
        info!(
            target: "mesh.actor.controller",
            participant_id = %self.participant_id,
            "MeshController started"
        );

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "mesh.actor.controller",
                        participant_id = %self.participant_id,
                        "MeshController received cancellation signal"
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
                            self.context.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "mesh.actor.controller",
                                participant_id = %self.participant_id,
                                "MeshController channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "mesh.actor.controller",
            participant_id = %self.participant_id,
            messages_processed = self.mailbox.messages_processed(),
            "MeshController stopped"
        );
    }

    async fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::OpenRoom {
                room_id,
                respond_to,
            } => {
                let result = self.open_room(room_id).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let result = self
                    .rooms
                    .get(&room_id)
                    .filter(|managed| managed.is_live())
                    .map(|managed| managed.handle.clone())
                    .ok_or_else(|| MeshError::NotInCall(room_id.to_string()));
                let _ = respond_to.send(result);
            }

            ControllerMessage::ReplaceRelay { relay, respond_to } => {
                let result = self.replace_relay(relay);
                let _ = respond_to.send(result);
            }

            ControllerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            ControllerMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                let result = self.initiate_shutdown(deadline);
                let _ = respond_to.send(result);
            }
        }
    }

    /// Spawn a room actor for `room_id`.
    async fn open_room(&mut self, room_id: RoomId) -> Result<RoomActorHandle, MeshError> {
        if !self.accepting_new {
            return Err(MeshError::Draining);
        }

        if let Some(existing) = self.rooms.get(&room_id) {
            if existing.is_live() {
                return Err(MeshError::AlreadyInCall(room_id.to_string()));
            }
        }
        if let Some(ended) = self.rooms.remove(&room_id) {
            self.retire_room(&room_id, ended).await;
        }

        let subscription = self.context.relay.subscribe(&room_id).await?;
        let (handle, task_handle) = RoomActor::spawn(
            subscription,
            self.context.clone(),
            self.cancel_token.child_token(),
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
            },
        );
        self.context.metrics.room_joined();

        debug!(
            target: "mesh.actor.controller",
            participant_id = %self.participant_id,
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Room actor spawned"
        );

        Ok(handle)
    }

    /// Wait for an ended room's task so its unsubscribe cannot race the
    /// subscription of its replacement.
    async fn retire_room(&self, room_id: &RoomId, managed: ManagedRoom) {
        self.context.metrics.room_left();
        managed.handle.cancel();

        match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
            Ok(Ok(())) => {
                debug!(
                    target: "mesh.actor.controller",
                    participant_id = %self.participant_id,
                    room_id = %room_id,
                    "Ended room actor retired"
                );
            }
            Ok(Err(e)) => {
                warn!(
                    target: "mesh.actor.controller",
                    participant_id = %self.participant_id,
                    room_id = %room_id,
                    error = ?e,
                    "Room actor task panicked during removal"
                );
            }
            Err(_) => {
                warn!(
                    target: "mesh.actor.controller",
                    participant_id = %self.participant_id,
                    room_id = %room_id,
                    "Room actor task cleanup timed out"
                );
            }
        }
    }

    fn replace_relay(&mut self, relay: Arc<dyn Relay>) -> Result<(), MeshError> {
        if relay.local_id() != &self.participant_id {
            return Err(MeshError::Internal(format!(
                "relay identity {} does not match {}",
                relay.local_id(),
                self.participant_id
            )));
        }

        info!(
            target: "mesh.actor.controller",
            participant_id = %self.participant_id,
            session_id = %relay.local_session(),
            "Relay client replaced"
        );
        self.context.relay = relay;
        Ok(())
    }

    fn get_status(&self) -> ControllerStatus {
        let mut rooms: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.is_live())
            .map(|(room_id, _)| room_id.clone())
            .collect();
        rooms.sort();

        ControllerStatus {
            participant_id: self.participant_id.clone(),
            rooms,
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    fn initiate_shutdown(&mut self, deadline: Duration) -> Result<(), MeshError> {
        info!(
            target: "mesh.actor.controller",
            participant_id = %self.participant_id,
            room_count = self.rooms.len(),
            "Initiating graceful shutdown"
        );

        self.accepting_new = false;
        self.shutdown_deadline = deadline;
        // Propagates to every room
        self.cancel_token.cancel();

        Ok(())
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "mesh.actor.controller",
            participant_id = %self.participant_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        let deadline = self.shutdown_deadline;
        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "mesh.actor.controller",
                        participant_id = %self.participant_id,
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "mesh.actor.controller",
                        participant_id = %self.participant_id,
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "mesh.actor.controller",
                        participant_id = %self.participant_id,
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.context.metrics.room_left();
        }

        info!(
            target: "mesh.actor.controller",
            participant_id = %self.participant_id,
            "Graceful shutdown complete"
        );
    }

    /// Drop rooms whose actor task finished.
    async fn check_room_health(&mut self) {
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

            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "mesh.actor.controller",
                        participant_id = %self.participant_id,
                        room_id = %room_id,
                        "Room actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "mesh.actor.controller",
                            participant_id = %self.participant_id,
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.context.metrics.record_panic(ActorType::Room);
                    }
                }
            }

            self.context.metrics.room_left();
        }
    }
}
