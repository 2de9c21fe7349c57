//! Signaling envelope types.
//!
//! Wire form (JSON, camelCase keys):
//!
//! ```text
//! {
//!   "event": "joinCall" | "leaveCall" | "offer" | "answer" | "iceCandidate"
//!            | "existingParticipants" | "error",
//!   "roomId": string,
//!   "senderId": string,
//!   "receiverId": string?,   // required for offer/answer/iceCandidate/existingParticipants/error
//!   "payload": object        // shape depends on event
//! }
//! ```
//!
//! In memory the `event`/`payload` pair is a single [`SignalingEvent`] so
//! handlers match exhaustively instead of branching on a string tag.

use chrono::{DateTime, Utc};
use common::types::{ParticipantId, RoomId, SessionId};
use serde::{Deserialize, Serialize};

/// Event discriminator as carried in the `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// A participant announces itself to the room.
    JoinCall,
    /// A participant left (explicitly or after a relay disconnect).
    LeaveCall,
    /// Session description offer.
    Offer,
    /// Session description answer.
    Answer,
    /// Trickled connectivity candidate.
    IceCandidate,
    /// Roster snapshot delivered to a joiner.
    ExistingParticipants,
    /// Informational error for a single participant.
    Error,
}

impl EventKind {
    /// Returns the wire name, also used as a bounded metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::JoinCall => "joinCall",
            EventKind::LeaveCall => "leaveCall",
            EventKind::Offer => "offer",
            EventKind::Answer => "answer",
            EventKind::IceCandidate => "iceCandidate",
            EventKind::ExistingParticipants => "existingParticipants",
            EventKind::Error => "error",
        }
    }

    /// Events that must name a receiver.
    #[must_use]
    pub const fn requires_receiver(&self) -> bool {
        matches!(
            self,
            EventKind::Offer
                | EventKind::Answer
                | EventKind::IceCandidate
                | EventKind::ExistingParticipants
                | EventKind::Error
        )
    }

    /// Events that must never name a receiver.
    #[must_use]
    pub const fn forbids_receiver(&self) -> bool {
        matches!(self, EventKind::JoinCall | EventKind::LeaveCall)
    }
}

/// A participant as described on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDescriptor {
    /// Stable participant identity.
    pub id: ParticipantId,
    /// Human-readable name.
    pub display_name: String,
    /// When presence admitted the participant. Absent on a join request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
    /// Transport session the participant joined from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl ParticipantDescriptor {
    /// Descriptor for a join request (no admission time yet).
    #[must_use]
    pub fn new(id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            joined_at: None,
            session_id: None,
        }
    }

    /// Attach the transport session.
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// Why a participant left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LeaveReason {
    /// Participant chose to leave.
    #[default]
    Voluntary,
    /// Relay disconnect debounce expired.
    Disconnected,
    /// Removed by presence (e.g. service shutdown).
    Removed,
}

/// Payload of `leaveCall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    /// Reason for leaving.
    #[serde(default)]
    pub reason: LeaveReason,
}

/// Payload of `offer` and `answer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    /// Opaque session description produced by the media engine.
    pub sdp: String,
    /// Set when the description renegotiates an already connected link.
    #[serde(default)]
    pub renegotiation: bool,
    /// Chosen by the offerer and echoed in the answer so a late answer to a
    /// cancelled offer can be told apart from the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negotiation_id: Option<String>,
}

impl SessionDescription {
    /// Description for an initial negotiation.
    #[must_use]
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            renegotiation: false,
            negotiation_id: None,
        }
    }

    /// Tag the description with the negotiation it belongs to.
    #[must_use]
    pub fn with_negotiation_id(mut self, id: impl Into<String>) -> Self {
        self.negotiation_id = Some(id.into());
        self
    }

    /// Mark the description as a renegotiation of a connected link.
    #[must_use]
    pub fn renegotiating(mut self) -> Self {
        self.renegotiation = true;
        self
    }
}

/// Payload of `iceCandidate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    /// Candidate line.
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl CandidatePayload {
    /// Candidate without media line hints.
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Bounded error code (see the coordinator's error mapping).
    pub code: i32,
    /// Client-safe message.
    pub message: String,
}

/// Event plus its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    JoinCall(ParticipantDescriptor),
    LeaveCall(LeavePayload),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(CandidatePayload),
    ExistingParticipants(Vec<ParticipantDescriptor>),
    Error(ErrorPayload),
}

impl SignalingEvent {
    /// Discriminator of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            SignalingEvent::JoinCall(_) => EventKind::JoinCall,
            SignalingEvent::LeaveCall(_) => EventKind::LeaveCall,
            SignalingEvent::Offer(_) => EventKind::Offer,
            SignalingEvent::Answer(_) => EventKind::Answer,
            SignalingEvent::IceCandidate(_) => EventKind::IceCandidate,
            SignalingEvent::ExistingParticipants(_) => EventKind::ExistingParticipants,
            SignalingEvent::Error(_) => EventKind::Error,
        }
    }
}

/// A signaling envelope. Immutable once published.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingEnvelope {
    /// Room the envelope belongs to.
    pub room_id: RoomId,
    /// Participant (or service identity) that produced it.
    pub sender_id: ParticipantId,
    /// Addressee; `None` for broadcasts.
    pub receiver_id: Option<ParticipantId>,
    /// Event and payload.
    pub event: SignalingEvent,
}

impl SignalingEnvelope {
    /// Envelope delivered to every room member.
    #[must_use]
    pub fn broadcast(room_id: RoomId, sender_id: ParticipantId, event: SignalingEvent) -> Self {
        Self {
            room_id,
            sender_id,
            receiver_id: None,
            event,
        }
    }

    /// Envelope addressed to a single participant.
    #[must_use]
    pub fn addressed(
        room_id: RoomId,
        sender_id: ParticipantId,
        receiver_id: ParticipantId,
        event: SignalingEvent,
    ) -> Self {
        Self {
            room_id,
            sender_id,
            receiver_id: Some(receiver_id),
            event,
        }
    }

    /// Discriminator of the carried event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.event.kind()
    }

    /// Whether `participant` should process this envelope.
    #[must_use]
    pub fn is_for(&self, participant: &ParticipantId) -> bool {
        self.receiver_id
            .as_ref()
            .map_or(true, |receiver| receiver == participant)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(EventKind::JoinCall.as_str(), "joinCall");
        assert_eq!(EventKind::IceCandidate.as_str(), "iceCandidate");
        assert_eq!(
            serde_json::to_string(&EventKind::ExistingParticipants).unwrap(),
            "\"existingParticipants\""
        );
    }

    #[test]
    fn test_receiver_rules() {
        assert!(EventKind::Offer.requires_receiver());
        assert!(EventKind::Error.requires_receiver());
        assert!(EventKind::JoinCall.forbids_receiver());
        assert!(EventKind::ExistingParticipants.requires_receiver());
        assert!(!EventKind::ExistingParticipants.forbids_receiver());
    }

    #[test]
    fn test_is_for() {
        let alice = ParticipantId::new("alice");
        let bob = ParticipantId::new("bob");
        let room = RoomId::new("room");

        let broadcast = SignalingEnvelope::broadcast(
            room.clone(),
            alice.clone(),
            SignalingEvent::LeaveCall(LeavePayload::default()),
        );
        assert!(broadcast.is_for(&bob));

        let addressed = SignalingEnvelope::addressed(
            room,
            alice.clone(),
            bob.clone(),
            SignalingEvent::Offer(SessionDescription::new("v=0")),
        );
        assert!(addressed.is_for(&bob));
        assert!(!addressed.is_for(&alice));
    }
}
