//! Local media and peer-connection collaborators.
//!
//! [`LocalMedia`] owns the capture stream; [`PeerEngine`] drives one peer
//! connection per link (session descriptions and candidates). Both are opaque
//! to the coordinator, which only sequences calls into them.

mod loopback;

pub use loopback::{LoopbackEngine, LoopbackMedia};

use async_trait::async_trait;
use common::types::{ParticipantId, RoomId};
use signaling_protocol::{CandidatePayload, SessionDescription};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Track selector for mute toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle to an acquired local stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaHandle(u64);

impl MediaHandle {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.0
    }
}

/// Local media failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// Capture device missing, busy or denied.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Handle was released or never issued.
    #[error("unknown media handle")]
    UnknownHandle,
}

/// The local capture stream.
#[async_trait]
pub trait LocalMedia: Send + Sync {
    /// Acquire the stream. No retry is attempted on failure.
    async fn acquire(&self) -> Result<MediaHandle, MediaError>;

    /// Release a previously acquired stream. Releasing twice is a no-op.
    async fn release(&self, handle: MediaHandle);

    /// Flip one track on or off. Never touches peer connections.
    async fn set_enabled(
        &self,
        handle: MediaHandle,
        track: TrackKind,
        enabled: bool,
    ) -> Result<(), MediaError>;
}

/// Peer-connection driver failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// No peer connection is open for the remote.
    #[error("no peer connection for {0}")]
    UnknownPeer(ParticipantId),

    /// The driver could not produce or apply a description.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Candidate could not be applied.
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
}

/// Asynchronous output of the peer-connection driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A local candidate to trickle to the remote.
    LocalCandidate {
        room_id: RoomId,
        remote_id: ParticipantId,
        candidate: CandidatePayload,
    },
    /// The connection failed after negotiation.
    ConnectionFailed {
        room_id: RoomId,
        remote_id: ParticipantId,
        reason: String,
    },
}

/// Sink handed to the driver when a peer connection is opened.
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Driver for the peer connections of one local participant.
///
/// Calls for one `(room, remote)` pair are always made in negotiation order
/// by the owning room actor.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Open a peer connection to `remote_id` carrying `media`.
    async fn open(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        media: MediaHandle,
        events: EngineEventSender,
    ) -> Result<(), EngineError>;

    /// Produce a local offer.
    async fn create_offer(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        renegotiation: bool,
    ) -> Result<SessionDescription, EngineError>;

    /// Apply a remote offer and produce the answer.
    async fn create_answer(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, EngineError>;

    /// Apply a remote answer.
    async fn set_remote_description(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        answer: &SessionDescription,
    ) -> Result<(), EngineError>;

    /// Apply a remote candidate. Only called after a remote description.
    async fn add_candidate(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        candidate: &CandidatePayload,
    ) -> Result<(), EngineError>;

    /// Tear down the peer connection. Idempotent.
    async fn close(&self, room_id: &RoomId, remote_id: &ParticipantId);
}
