//! Room-scoped publish/subscribe relay.
//!
//! The relay is an injected collaborator: the coordinator only needs
//! per-room FIFO delivery and a signal when the transport is lost.
//! [`RelayBus`] is the in-process implementation used by the binary and the
//! integration tests; each test builds its own bus.

mod bus;

pub use bus::{BusClient, RelayBus};

use async_trait::async_trait;
use common::types::{ParticipantId, RoomId, SessionId};
use signaling_protocol::SignalingEnvelope;
use thiserror::Error;
use tokio::sync::mpsc;

/// Relay failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The transport session is gone; a new session is required.
    #[error("relay connection lost")]
    Disconnected,

    /// Envelope room does not match the publish target.
    #[error("envelope for room {envelope} published to room {target}")]
    RoomMismatch { target: RoomId, envelope: RoomId },

    /// Envelope failed wire validation.
    #[error("envelope rejected: {0}")]
    Rejected(String),
}

/// Something the relay delivers to a room subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// An envelope published to the room.
    Envelope(SignalingEnvelope),
    /// This subscriber's own transport was lost. Always the last event.
    ConnectionLost,
    /// Another member's transport session dropped.
    PeerDisconnected {
        participant_id: ParticipantId,
        session_id: SessionId,
    },
}

/// Stream of events for one room, in relay order.
#[derive(Debug)]
pub struct Subscription {
    room_id: RoomId,
    receiver: mpsc::UnboundedReceiver<RelayEvent>,
}

impl Subscription {
    #[must_use]
    pub fn new(room_id: RoomId, receiver: mpsc::UnboundedReceiver<RelayEvent>) -> Self {
        Self { room_id, receiver }
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Next event, or `None` once the relay dropped the subscription.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking receive (tests).
    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Relay client bound to one identity and one transport session.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Identity this client publishes as.
    fn local_id(&self) -> &ParticipantId;

    /// Current transport session.
    fn local_session(&self) -> &SessionId;

    /// Start receiving events for `room_id`.
    async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription, RelayError>;

    /// Stop receiving events for `room_id`. No-op if not subscribed.
    async fn unsubscribe(&self, room_id: &RoomId);

    /// Publish an envelope to every other subscriber of `room_id`
    /// (addressed envelopes reach only their receiver).
    async fn publish(&self, room_id: &RoomId, envelope: SignalingEnvelope)
        -> Result<(), RelayError>;
}
