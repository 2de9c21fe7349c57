//! JSON codec for signaling envelopes.
//!
//! Decoding is strict about addressing: `offer`, `answer`, `iceCandidate`,
//! `existingParticipants` and `error` must carry a `receiverId`; `joinCall`
//! and `leaveCall` must not.
//! Encoding runs the same validation so a malformed envelope is never
//! published.

use crate::envelope::{EventKind, SignalingEnvelope, SignalingEvent};
use common::types::{ParticipantId, RoomId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Input is not a well-formed envelope
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// A required identifier is empty
    #[error("Empty field: {0}")]
    EmptyField(&'static str),

    /// Addressed event without a receiver
    #[error("Missing receiver for {0:?}")]
    MissingReceiver(EventKind),

    /// Broadcast event with a receiver
    #[error("Unexpected receiver for {0:?}")]
    UnexpectedReceiver(EventKind),

    /// Payload does not match the event
    #[error("Invalid payload for {event:?}: {reason}")]
    InvalidPayload { event: EventKind, reason: String },
}

/// Envelope as laid out on the wire.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    event: EventKind,
    room_id: RoomId,
    sender_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    receiver_id: Option<ParticipantId>,
    #[serde(default)]
    payload: Value,
}

/// Check the addressing and identifier rules for an envelope.
///
/// # Errors
///
/// Returns the first rule the envelope violates.
pub fn validate(envelope: &SignalingEnvelope) -> Result<(), CodecError> {
    if envelope.room_id.is_empty() {
        return Err(CodecError::EmptyField("roomId"));
    }
    if envelope.sender_id.is_empty() {
        return Err(CodecError::EmptyField("senderId"));
    }

    let kind = envelope.kind();
    match &envelope.receiver_id {
        None if kind.requires_receiver() => Err(CodecError::MissingReceiver(kind)),
        Some(_) if kind.forbids_receiver() => Err(CodecError::UnexpectedReceiver(kind)),
        Some(receiver) if receiver.is_empty() => Err(CodecError::EmptyField("receiverId")),
        _ => Ok(()),
    }
}

/// Encode an envelope to its JSON wire form.
///
/// # Errors
///
/// Returns an error if the envelope violates the addressing rules or a payload
/// fails to serialize.
pub fn encode_envelope(envelope: &SignalingEnvelope) -> Result<String, CodecError> {
    validate(envelope)?;

    let kind = envelope.kind();
    let payload = match &envelope.event {
        SignalingEvent::JoinCall(p) => to_payload(kind, p)?,
        SignalingEvent::LeaveCall(p) => to_payload(kind, p)?,
        SignalingEvent::Offer(p) | SignalingEvent::Answer(p) => to_payload(kind, p)?,
        SignalingEvent::IceCandidate(p) => to_payload(kind, p)?,
        SignalingEvent::ExistingParticipants(p) => to_payload(kind, p)?,
        SignalingEvent::Error(p) => to_payload(kind, p)?,
    };

    let wire = WireEnvelope {
        event: kind,
        room_id: envelope.room_id.clone(),
        sender_id: envelope.sender_id.clone(),
        receiver_id: envelope.receiver_id.clone(),
        payload,
    };

    serde_json::to_string(&wire).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Decode an envelope from its JSON wire form.
///
/// # Errors
///
/// Returns an error if the input is not JSON, the payload does not match the
/// event, or the addressing rules are violated.
pub fn decode_envelope(data: &str) -> Result<SignalingEnvelope, CodecError> {
    let wire: WireEnvelope =
        serde_json::from_str(data).map_err(|e| CodecError::Malformed(e.to_string()))?;
    from_wire(wire)
}

/// Decode an envelope from raw bytes (UTF-8 JSON).
///
/// # Errors
///
/// Same as [`decode_envelope`].
pub fn decode_envelope_bytes(data: &[u8]) -> Result<SignalingEnvelope, CodecError> {
    let wire: WireEnvelope =
        serde_json::from_slice(data).map_err(|e| CodecError::Malformed(e.to_string()))?;
    from_wire(wire)
}

fn from_wire(wire: WireEnvelope) -> Result<SignalingEnvelope, CodecError> {
    let kind = wire.event;
    let event = match kind {
        EventKind::JoinCall => SignalingEvent::JoinCall(from_payload(kind, wire.payload)?),
        // leaveCall may omit the payload entirely
        EventKind::LeaveCall => SignalingEvent::LeaveCall(from_payload(
            kind,
            null_as_empty_object(wire.payload),
        )?),
        EventKind::Offer => SignalingEvent::Offer(from_payload(kind, wire.payload)?),
        EventKind::Answer => SignalingEvent::Answer(from_payload(kind, wire.payload)?),
        EventKind::IceCandidate => {
            SignalingEvent::IceCandidate(from_payload(kind, wire.payload)?)
        }
        EventKind::ExistingParticipants => {
            SignalingEvent::ExistingParticipants(from_payload(kind, wire.payload)?)
        }
        EventKind::Error => SignalingEvent::Error(from_payload(kind, wire.payload)?),
    };

    let envelope = SignalingEnvelope {
        room_id: wire.room_id,
        sender_id: wire.sender_id,
        receiver_id: wire.receiver_id,
        event,
    };
    validate(&envelope)?;
    Ok(envelope)
}

fn to_payload<T: Serialize>(event: EventKind, payload: &T) -> Result<Value, CodecError> {
    serde_json::to_value(payload).map_err(|e| CodecError::InvalidPayload {
        event,
        reason: e.to_string(),
    })
}

fn from_payload<T: DeserializeOwned>(event: EventKind, payload: Value) -> Result<T, CodecError> {
    serde_json::from_value(payload).map_err(|e| CodecError::InvalidPayload {
        event,
        reason: e.to_string(),
    })
}

fn null_as_empty_object(value: Value) -> Value {
    if value.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        value
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::envelope::{
        CandidatePayload, LeavePayload, LeaveReason, ParticipantDescriptor, SessionDescription,
    };

    fn room() -> RoomId {
        RoomId::new("room-1")
    }

    #[test]
    fn test_offer_wire_shape() {
        let envelope = SignalingEnvelope::addressed(
            room(),
            ParticipantId::new("bob"),
            ParticipantId::new("alice"),
            SignalingEvent::Offer(SessionDescription::new("v=0 offer")),
        );

        let json = encode_envelope(&envelope).unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["event"], "offer");
        assert_eq!(value["roomId"], "room-1");
        assert_eq!(value["senderId"], "bob");
        assert_eq!(value["receiverId"], "alice");
        assert_eq!(value["payload"]["sdp"], "v=0 offer");
        assert_eq!(value["payload"]["renegotiation"], false);

        assert_eq!(decode_envelope(&json).unwrap(), envelope);
    }

    #[test]
    fn test_broadcast_omits_receiver() {
        let envelope = SignalingEnvelope::broadcast(
            room(),
            ParticipantId::new("carol"),
            SignalingEvent::JoinCall(ParticipantDescriptor::new(
                ParticipantId::new("carol"),
                "Carol",
            )),
        );

        let json = encode_envelope(&envelope).unwrap();
        assert!(!json.contains("receiverId"));
        assert!(json.contains("\"displayName\":\"Carol\""));
    }

    #[test]
    fn test_decode_leave_without_payload() {
        let json = r#"{"event":"leaveCall","roomId":"r","senderId":"bob"}"#;
        let envelope = decode_envelope(json).unwrap();
        assert_eq!(
            envelope.event,
            SignalingEvent::LeaveCall(LeavePayload {
                reason: LeaveReason::Voluntary
            })
        );
    }

    #[test]
    fn test_decode_existing_participants_roster() {
        let json = r#"{
            "event": "existingParticipants",
            "roomId": "r",
            "senderId": "presence",
            "receiverId": "carol",
            "payload": [
                {"id": "alice", "displayName": "Alice", "joinedAt": "2024-01-01T00:00:00Z"},
                {"id": "bob", "displayName": "Bob"}
            ]
        }"#;

        let envelope = decode_envelope(json).unwrap();
        let SignalingEvent::ExistingParticipants(roster) = envelope.event else {
            unreachable!("expected an existingParticipants payload");
        };
        assert_eq!(roster.len(), 2);
        assert!(roster
            .iter()
            .any(|p| p.id.as_str() == "alice" && p.joined_at.is_some()));
    }

    #[test]
    fn test_addressed_event_requires_receiver() {
        let json = r#"{"event":"iceCandidate","roomId":"r","senderId":"bob","payload":{"candidate":"c"}}"#;
        assert!(matches!(
            decode_envelope(json),
            Err(CodecError::MissingReceiver(EventKind::IceCandidate))
        ));
    }

    #[test]
    fn test_roster_must_be_addressed() {
        let json = r#"{"event":"existingParticipants","roomId":"r","senderId":"presence","payload":[]}"#;
        assert!(matches!(
            decode_envelope(json),
            Err(CodecError::MissingReceiver(EventKind::ExistingParticipants))
        ));
    }

    #[test]
    fn test_broadcast_event_rejects_receiver() {
        let envelope = SignalingEnvelope {
            room_id: room(),
            sender_id: ParticipantId::new("bob"),
            receiver_id: Some(ParticipantId::new("alice")),
            event: SignalingEvent::LeaveCall(LeavePayload::default()),
        };
        assert!(matches!(
            encode_envelope(&envelope),
            Err(CodecError::UnexpectedReceiver(EventKind::LeaveCall))
        ));
    }

    #[test]
    fn test_empty_sender_rejected() {
        let envelope = SignalingEnvelope::addressed(
            room(),
            ParticipantId::new(""),
            ParticipantId::new("alice"),
            SignalingEvent::IceCandidate(CandidatePayload::new("c")),
        );
        assert!(matches!(
            validate(&envelope),
            Err(CodecError::EmptyField("senderId"))
        ));
    }

    #[test]
    fn test_payload_mismatch_is_reported() {
        let json = r#"{"event":"offer","roomId":"r","senderId":"a","receiverId":"b","payload":[1,2]}"#;
        assert!(matches!(
            decode_envelope(json),
            Err(CodecError::InvalidPayload {
                event: EventKind::Offer,
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_event_is_malformed() {
        let json = r#"{"event":"draw","roomId":"r","senderId":"a"}"#;
        assert!(matches!(decode_envelope(json), Err(CodecError::Malformed(_))));
        assert!(matches!(
            decode_envelope_bytes(b"\xff\xfe"),
            Err(CodecError::Malformed(_))
        ));
    }
}
