//! Pre-configured test data fixtures for mesh testing.
//!
//! Provides builders for participants, descriptors and raw envelopes so
//! tests can act as a remote client directly on the relay.

use common::types::{ParticipantId, RoomId, SessionId};
use signaling_protocol::{
    CandidatePayload, LeavePayload, LeaveReason, ParticipantDescriptor, SessionDescription,
    SignalingEnvelope, SignalingEvent,
};
use uuid::Uuid;

/// Test participant fixture.
#[derive(Debug, Clone)]
pub struct TestParticipant {
    /// Participant ID.
    pub id: ParticipantId,
    /// Display name.
    pub display_name: String,
    /// Transport session, when pinned.
    pub session_id: Option<SessionId>,
}

impl TestParticipant {
    /// Create a new test participant with the given ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: format!("Test {id}"),
            id: ParticipantId::new(id),
            session_id: None,
        }
    }

    /// Create a test participant with a random ID.
    #[must_use]
    pub fn random() -> Self {
        Self::new(format!("participant-{}", Uuid::new_v4()))
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Pin the transport session carried in the descriptor.
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Descriptor as carried by `joinCall`.
    #[must_use]
    pub fn descriptor(&self) -> ParticipantDescriptor {
        let descriptor = ParticipantDescriptor::new(self.id.clone(), self.display_name.clone());
        match &self.session_id {
            Some(session_id) => descriptor.with_session(session_id.clone()),
            None => descriptor,
        }
    }

    /// Broadcast `joinCall` from this participant.
    #[must_use]
    pub fn join_envelope(&self, room_id: &RoomId) -> SignalingEnvelope {
        SignalingEnvelope::broadcast(
            room_id.clone(),
            self.id.clone(),
            SignalingEvent::JoinCall(self.descriptor()),
        )
    }

    /// Broadcast `leaveCall` from this participant.
    #[must_use]
    pub fn leave_envelope(&self, room_id: &RoomId, reason: LeaveReason) -> SignalingEnvelope {
        SignalingEnvelope::broadcast(
            room_id.clone(),
            self.id.clone(),
            SignalingEvent::LeaveCall(LeavePayload { reason }),
        )
    }

    /// Offer from this participant to `to`.
    #[must_use]
    pub fn offer_to(
        &self,
        room_id: &RoomId,
        to: &ParticipantId,
        negotiation_id: &str,
    ) -> SignalingEnvelope {
        SignalingEnvelope::addressed(
            room_id.clone(),
            self.id.clone(),
            to.clone(),
            SignalingEvent::Offer(
                SessionDescription::new(format!("v=0\r\no={} offer\r\n", self.id))
                    .with_negotiation_id(negotiation_id),
            ),
        )
    }

    /// Answer from this participant to `to`, echoing `negotiation_id`.
    #[must_use]
    pub fn answer_to(
        &self,
        room_id: &RoomId,
        to: &ParticipantId,
        negotiation_id: Option<&str>,
    ) -> SignalingEnvelope {
        let answer = SessionDescription::new(format!("v=0\r\no={} answer\r\n", self.id));
        SignalingEnvelope::addressed(
            room_id.clone(),
            self.id.clone(),
            to.clone(),
            SignalingEvent::Answer(match negotiation_id {
                Some(id) => answer.with_negotiation_id(id),
                None => answer,
            }),
        )
    }

    /// Candidate from this participant to `to`.
    #[must_use]
    pub fn candidate_to(
        &self,
        room_id: &RoomId,
        to: &ParticipantId,
        candidate: &str,
    ) -> SignalingEnvelope {
        SignalingEnvelope::addressed(
            room_id.clone(),
            self.id.clone(),
            to.clone(),
            SignalingEvent::IceCandidate(CandidatePayload::new(candidate)),
        )
    }
}

/// Room ID unique to one test.
#[must_use]
pub fn unique_room(prefix: &str) -> RoomId {
    RoomId::new(format!("{prefix}-{}", Uuid::new_v4()))
}
