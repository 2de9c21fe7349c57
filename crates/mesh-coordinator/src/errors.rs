//! Mesh coordinator error types.
//!
//! Errors map to the bounded `code` carried in `error` envelopes. Internal
//! details are logged locally but never placed on the wire.

use crate::link::LinkError;
use crate::media::{EngineError, MediaError};
use crate::relay::RelayError;
use common::types::ParticipantId;
use signaling_protocol::CodecError;
use thiserror::Error;

/// Wire code presence sends when it refuses a join.
pub const CAPACITY_EXCEEDED_CODE: i32 = 7;

/// Mesh coordinator error type.
///
/// Maps to wire error codes:
/// - `RelayDisconnected`: `RELAY_DISCONNECTED` (1)
/// - `NegotiationTimeout`, `JoinTimeout`: `TIMEOUT` (2)
/// - `DeviceUnavailable`: `DEVICE_UNAVAILABLE` (3)
/// - `NotInCall`, `RoomNotFound`, `LinkNotFound`: `NOT_FOUND` (4)
/// - `AlreadyInCall`: `CONFLICT` (5)
/// - Codec, Relay, Engine, Link, Internal: `INTERNAL_ERROR` (6)
/// - `RoomCapacityExceeded`, `Draining`: `CAPACITY_EXCEEDED` (7)
#[derive(Debug, Error)]
pub enum MeshError {
    /// Relay transport lost. Fatal to every call on that relay.
    #[error("Relay disconnected")]
    RelayDisconnected,

    /// Negotiation with a peer did not complete after all attempts.
    #[error("Negotiation with {remote} timed out")]
    NegotiationTimeout { remote: ParticipantId },

    /// Presence never answered the join.
    #[error("Join timed out: {0}")]
    JoinTimeout(String),

    /// Local media could not be acquired. Fatal to joining.
    #[error("Local media unavailable: {0}")]
    DeviceUnavailable(String),

    /// Operation requires an active call in the room.
    #[error("Not in call: {0}")]
    NotInCall(String),

    /// Local participant already joined (or is joining) the room.
    #[error("Already in call: {0}")]
    AlreadyInCall(String),

    /// Room is not known to this component.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// No link exists for the peer.
    #[error("Link not found: {0}")]
    LinkNotFound(String),

    /// Presence refused the join.
    #[error("Room at capacity: {0}")]
    RoomCapacityExceeded(String),

    /// Component is shutting down.
    #[error("Coordinator is draining")]
    Draining,

    /// Envelope failed validation.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Relay rejected an operation.
    #[error("Relay error: {0}")]
    Relay(RelayError),

    /// Peer-connection driver failure.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Illegal link transition.
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Internal error (channel failures, task loss).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<MediaError> for MeshError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::DeviceUnavailable(reason) => MeshError::DeviceUnavailable(reason),
            other => MeshError::Internal(other.to_string()),
        }
    }
}

impl From<RelayError> for MeshError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Disconnected => MeshError::RelayDisconnected,
            other => MeshError::Relay(other),
        }
    }
}

impl MeshError {
    /// Returns the wire error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            MeshError::RelayDisconnected => 1,
            MeshError::NegotiationTimeout { .. } | MeshError::JoinTimeout(_) => 2,
            MeshError::DeviceUnavailable(_) => 3,
            MeshError::NotInCall(_) | MeshError::RoomNotFound(_) | MeshError::LinkNotFound(_) => 4,
            MeshError::AlreadyInCall(_) => 5,
            MeshError::Codec(_)
            | MeshError::Relay(_)
            | MeshError::Engine(_)
            | MeshError::Link(_)
            | MeshError::Internal(_) => 6,
            MeshError::RoomCapacityExceeded(_) | MeshError::Draining => CAPACITY_EXCEEDED_CODE,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            MeshError::RelayDisconnected => "Connection to the relay was lost".to_string(),
            MeshError::NegotiationTimeout { .. } => {
                "Could not establish a connection with a participant".to_string()
            }
            MeshError::JoinTimeout(_) => "The call did not respond, please retry".to_string(),
            MeshError::DeviceUnavailable(_) => {
                "Camera or microphone is not available".to_string()
            }
            MeshError::NotInCall(_) => "Not in a call".to_string(),
            MeshError::AlreadyInCall(_) => "Already in this call".to_string(),
            MeshError::RoomNotFound(_) => "Room not found".to_string(),
            MeshError::LinkNotFound(_) => "Participant connection not found".to_string(),
            MeshError::RoomCapacityExceeded(_) => "Call is full".to_string(),
            MeshError::Draining => "Shutting down, please rejoin".to_string(),
            MeshError::Codec(_)
            | MeshError::Relay(_)
            | MeshError::Engine(_)
            | MeshError::Link(_)
            | MeshError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Whether the error ends the local call in the room.
    #[must_use]
    pub fn is_fatal_to_call(&self) -> bool {
        matches!(
            self,
            MeshError::RelayDisconnected | MeshError::DeviceUnavailable(_)
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(MeshError::RelayDisconnected.error_code(), 1);
        assert_eq!(
            MeshError::NegotiationTimeout {
                remote: ParticipantId::new("bob")
            }
            .error_code(),
            2
        );
        assert_eq!(
            MeshError::DeviceUnavailable("no camera".to_string()).error_code(),
            3
        );
        assert_eq!(MeshError::NotInCall("r".to_string()).error_code(), 4);
        assert_eq!(MeshError::RoomNotFound("r".to_string()).error_code(), 4);
        assert_eq!(MeshError::AlreadyInCall("r".to_string()).error_code(), 5);
        assert_eq!(MeshError::Internal("x".to_string()).error_code(), 6);
        assert_eq!(
            MeshError::RoomCapacityExceeded("r".to_string()).error_code(),
            7
        );
        assert_eq!(MeshError::Draining.error_code(), 7);
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = MeshError::Internal("channel send failed: closed".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = MeshError::DeviceUnavailable("/dev/video0 busy".to_string());
        assert!(!err.client_message().contains("/dev/video0"));
    }

    #[test]
    fn test_media_error_conversion() {
        let err: MeshError = MediaError::DeviceUnavailable("busy".to_string()).into();
        assert!(matches!(err, MeshError::DeviceUnavailable(ref r) if r == "busy"));
        assert!(err.is_fatal_to_call());

        let err: MeshError = MediaError::UnknownHandle.into();
        assert!(matches!(err, MeshError::Internal(_)));
        assert!(!err.is_fatal_to_call());
    }

    #[test]
    fn test_relay_error_conversion() {
        let err: MeshError = RelayError::Disconnected.into();
        assert!(matches!(err, MeshError::RelayDisconnected));
        assert_eq!(err.error_code(), 1);

        let err: MeshError = RelayError::Rejected("bad".to_string()).into();
        assert_eq!(err.error_code(), 6);
        assert_eq!(MeshError::JoinTimeout("room-1".to_string()).error_code(), 2);
    }
}
