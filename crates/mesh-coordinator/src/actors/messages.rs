//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use crate::errors::MeshError;
use crate::link::{LinkRole, LinkState};
use crate::media::TrackKind;
use crate::presence::Participant;
use crate::relay::Relay;

use super::presence::PresenceRoomHandle;
use super::room::RoomActorHandle;

use common::types::{ParticipantId, RoomId, SessionId};
use signaling_protocol::LeaveReason;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to `MeshController`.
pub enum ControllerMessage {
    /// Spawn a room actor for `room_id`. The join itself is driven by the
    /// caller through the returned handle.
    OpenRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<RoomActorHandle, MeshError>>,
    },

    /// Look up the live room actor for `room_id`.
    GetRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<RoomActorHandle, MeshError>>,
    },

    /// Swap the relay client used for rooms opened from now on.
    ReplaceRelay {
        relay: Arc<dyn Relay>,
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },

    /// Get controller status.
    GetStatus {
        respond_to: oneshot::Sender<ControllerStatus>,
    },

    /// Leave every room and stop.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },
}

impl std::fmt::Debug for ControllerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerMessage::OpenRoom { room_id, .. } => {
                f.debug_struct("OpenRoom").field("room_id", room_id).finish()
            }
            ControllerMessage::GetRoom { room_id, .. } => {
                f.debug_struct("GetRoom").field("room_id", room_id).finish()
            }
            ControllerMessage::ReplaceRelay { relay, .. } => f
                .debug_struct("ReplaceRelay")
                .field("session_id", relay.local_session())
                .finish(),
            ControllerMessage::GetStatus { .. } => f.write_str("GetStatus"),
            ControllerMessage::Shutdown { deadline, .. } => f
                .debug_struct("Shutdown")
                .field("deadline", deadline)
                .finish(),
        }
    }
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// Join the call. Answered once presence returned the roster and the
    /// offers to existing participants went out.
    Join {
        display_name: String,
        respond_to: oneshot::Sender<Result<RoomSnapshot, MeshError>>,
    },

    /// Leave the call.
    Leave {
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },

    /// Flip a local track. Links are not touched.
    SetTrackEnabled {
        track: TrackKind,
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },

    /// Renegotiate every connected link. Returns the number of offers sent.
    Renegotiate {
        respond_to: oneshot::Sender<Result<usize, MeshError>>,
    },

    /// Get a point-in-time view of the room.
    GetSnapshot {
        respond_to: oneshot::Sender<RoomSnapshot>,
    },
}

/// Messages sent to `PresenceService`.
pub enum PresenceMessage {
    /// Start serving presence for `room_id`.
    OpenRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },

    /// Stop serving presence for `room_id`.
    CloseRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },

    /// Out-of-band notice that a transport session dropped.
    RelayDisconnected {
        participant_id: ParticipantId,
        session_id: SessionId,
    },

    /// Look up the per-room presence actor.
    GetRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<PresenceRoomHandle, MeshError>>,
    },

    /// Rooms whose roster contains `participant_id`.
    RoomsOf {
        participant_id: ParticipantId,
        respond_to: oneshot::Sender<Vec<RoomId>>,
    },

    /// Get service status.
    GetStatus {
        respond_to: oneshot::Sender<PresenceStatus>,
    },
}

impl std::fmt::Debug for PresenceMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceMessage::OpenRoom { room_id, .. } => {
                f.debug_struct("OpenRoom").field("room_id", room_id).finish()
            }
            PresenceMessage::CloseRoom { room_id, .. } => {
                f.debug_struct("CloseRoom").field("room_id", room_id).finish()
            }
            PresenceMessage::RelayDisconnected {
                participant_id,
                session_id,
            } => f
                .debug_struct("RelayDisconnected")
                .field("participant_id", participant_id)
                .field("session_id", session_id)
                .finish(),
            PresenceMessage::GetRoom { room_id, .. } => {
                f.debug_struct("GetRoom").field("room_id", room_id).finish()
            }
            PresenceMessage::RoomsOf { participant_id, .. } => f
                .debug_struct("RoomsOf")
                .field("participant_id", participant_id)
                .finish(),
            PresenceMessage::GetStatus { .. } => f.write_str("GetStatus"),
        }
    }
}

/// Messages sent to a per-room `PresenceActor`.
#[derive(Debug)]
pub enum PresenceRoomMessage {
    /// A transport session dropped; start the debounce if it matches.
    PeerDisconnected {
        participant_id: ParticipantId,
        session_id: SessionId,
    },

    /// Get the roster and pending disconnects.
    GetState {
        respond_to: oneshot::Sender<PresenceRoomState>,
    },
}

/// Local call phase in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Room actor spawned, join not requested yet.
    Idle,
    /// `joinCall` sent, waiting for the roster.
    Joining,
    /// In the call.
    InCall,
    /// Left, failed or lost the relay. The actor is stopping.
    Ended,
}

/// One link as reported by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub remote_id: ParticipantId,
    pub state: LinkState,
    pub role: Option<LinkRole>,
    pub attempt: u32,
    pub renegotiating: bool,
    pub pending_candidates: usize,
}

/// Point-in-time view of a local room.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub local_id: ParticipantId,
    pub phase: CallPhase,
    /// Remote participants known locally, oldest first.
    pub roster: Vec<Participant>,
    /// Live links, sorted by remote id.
    pub links: Vec<LinkSnapshot>,
}

impl RoomSnapshot {
    /// Link to `remote_id`, if any.
    #[must_use]
    pub fn link(&self, remote_id: &ParticipantId) -> Option<&LinkSnapshot> {
        self.links.iter().find(|link| &link.remote_id == remote_id)
    }

    /// Number of links in `Connected`.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.links
            .iter()
            .filter(|link| link.state == LinkState::Connected)
            .count()
    }

    /// Whether every remote in the roster has a connected link.
    #[must_use]
    pub fn is_fully_meshed(&self) -> bool {
        self.roster.iter().all(|participant| {
            self.link(&participant.id)
                .is_some_and(|link| link.state == LinkState::Connected)
        })
    }
}

/// Controller status.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub participant_id: ParticipantId,
    /// Rooms with a live room actor, sorted.
    pub rooms: Vec<RoomId>,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Per-room presence state.
#[derive(Debug, Clone)]
pub struct PresenceRoomState {
    pub room_id: RoomId,
    /// Admitted participants, oldest first.
    pub roster: Vec<Participant>,
    /// Participants whose disconnect debounce is running.
    pub pending_disconnects: Vec<ParticipantId>,
}

/// Presence service status.
#[derive(Debug, Clone)]
pub struct PresenceStatus {
    pub rooms: Vec<RoomId>,
    pub participant_count: usize,
    pub mailbox_depth: usize,
}

/// Why a link was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote left (explicitly or after a disconnect).
    RemoteLeft,
    /// The local participant left.
    LocalLeave,
    /// The remote rejoined; the stale link was replaced.
    Replaced,
    /// Negotiation timed out and a fresh offer follows.
    RetryScheduled,
    /// A renegotiation was not answered in time.
    RenegotiationFailed,
    /// The local relay connection was lost.
    RelayDisconnected,
    /// Local shutdown.
    Shutdown,
}

/// Why a link gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFailure {
    /// No answer after every attempt.
    NegotiationTimeout,
    /// The peer-connection driver failed.
    Engine(String),
}

/// Why the local call in a room ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEndReason {
    Left,
    RelayDisconnected,
    JoinFailed,
    Shutdown,
}

/// Observable mesh changes, published on a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    ParticipantJoined {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    ParticipantLeft {
        room_id: RoomId,
        participant_id: ParticipantId,
        reason: LeaveReason,
    },
    LinkConnected {
        room_id: RoomId,
        remote_id: ParticipantId,
    },
    LinkClosed {
        room_id: RoomId,
        remote_id: ParticipantId,
        reason: CloseReason,
    },
    LinkFailed {
        room_id: RoomId,
        remote_id: ParticipantId,
        failure: LinkFailure,
    },
    CallEnded {
        room_id: RoomId,
        reason: CallEndReason,
    },
    /// An `error` envelope addressed to the local participant.
    RemoteError {
        room_id: RoomId,
        code: i32,
        message: String,
    },
}

impl MeshEvent {
    /// Room the event belongs to.
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        match self {
            MeshEvent::ParticipantJoined { room_id, .. }
            | MeshEvent::ParticipantLeft { room_id, .. }
            | MeshEvent::LinkConnected { room_id, .. }
            | MeshEvent::LinkClosed { room_id, .. }
            | MeshEvent::LinkFailed { room_id, .. }
            | MeshEvent::CallEnded { room_id, .. }
            | MeshEvent::RemoteError { room_id, .. } => room_id,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn participant(id: &str) -> Participant {
        Participant {
            id: ParticipantId::new(id),
            display_name: id.to_string(),
            joined_at: Utc::now(),
            session_id: None,
        }
    }

    fn link(remote: &str, state: LinkState) -> LinkSnapshot {
        LinkSnapshot {
            remote_id: ParticipantId::new(remote),
            state,
            role: Some(LinkRole::Offerer),
            attempt: 1,
            renegotiating: false,
            pending_candidates: 0,
        }
    }

    #[test]
    fn test_snapshot_mesh_completeness() {
        let mut snapshot = RoomSnapshot {
            room_id: RoomId::new("room-1"),
            local_id: ParticipantId::new("carol"),
            phase: CallPhase::InCall,
            roster: vec![participant("alice"), participant("bob")],
            links: vec![
                link("alice", LinkState::Connected),
                link("bob", LinkState::Offering),
            ],
        };
        assert_eq!(snapshot.connected_count(), 1);
        assert!(!snapshot.is_fully_meshed());

        snapshot.links = vec![
            link("alice", LinkState::Connected),
            link("bob", LinkState::Connected),
        ];
        assert!(snapshot.is_fully_meshed());
        assert!(snapshot.link(&ParticipantId::new("dave")).is_none());
    }

    #[test]
    fn test_event_room_id() {
        let event = MeshEvent::CallEnded {
            room_id: RoomId::new("room-9"),
            reason: CallEndReason::Left,
        };
        assert_eq!(event.room_id().as_str(), "room-9");
    }
}
