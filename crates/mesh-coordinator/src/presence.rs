//! Call rosters.
//!
//! A [`CallSession`] is the roster of one room: who is "in the call". It is
//! plain data with no I/O; the presence actor owns the authoritative copy and
//! each local room actor keeps its own view built from `existingParticipants`,
//! `joinCall` and `leaveCall` envelopes.
//!
//! Entries are keyed by `ParticipantId`. A join for an id already present
//! replaces the stale entry, so a participant that reconnects under a new
//! transport session never appears twice.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::types::{ParticipantId, RoomId, SessionId};
use signaling_protocol::ParticipantDescriptor;
use std::collections::HashMap;

/// A call participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    /// Transport session the participant joined from, if known.
    pub session_id: Option<SessionId>,
}

impl Participant {
    /// Build from a wire descriptor, using `fallback_joined_at` when the
    /// descriptor carries no admission time.
    #[must_use]
    pub fn from_descriptor(
        descriptor: &ParticipantDescriptor,
        fallback_joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: descriptor.id.clone(),
            display_name: descriptor.display_name.clone(),
            joined_at: descriptor.joined_at.unwrap_or(fallback_joined_at),
            session_id: descriptor.session_id.clone(),
        }
    }

    #[must_use]
    pub fn to_descriptor(&self) -> ParticipantDescriptor {
        ParticipantDescriptor {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            joined_at: Some(self.joined_at),
            session_id: self.session_id.clone(),
        }
    }
}

/// Result of admitting a participant.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// The admitted entry, with its assigned `joined_at`.
    pub participant: Participant,
    /// Roster as it was before the join, excluding the joiner, oldest first.
    pub previous_roster: Vec<Participant>,
    /// Stale entry with the same id that the join replaced.
    pub replaced: Option<Participant>,
}

/// Roster of one room.
#[derive(Debug, Clone)]
pub struct CallSession {
    room_id: RoomId,
    participants: HashMap<ParticipantId, Participant>,
    last_joined_at: Option<DateTime<Utc>>,
}

impl CallSession {
    #[must_use]
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            participants: HashMap::new(),
            last_joined_at: None,
        }
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Admit `participant`, stamping a `joined_at` that is strictly later
    /// than every earlier admission in this room.
    pub fn admit(
        &mut self,
        id: ParticipantId,
        display_name: impl Into<String>,
        session_id: Option<SessionId>,
    ) -> JoinOutcome {
        let joined_at = self.next_joined_at(Utc::now());
        self.insert(Participant {
            id,
            display_name: display_name.into(),
            joined_at,
            session_id,
        })
    }

    /// Insert an entry whose `joined_at` was assigned elsewhere.
    pub fn insert(&mut self, participant: Participant) -> JoinOutcome {
        let replaced = self.participants.remove(&participant.id);
        let previous_roster = self.roster();

        if self
            .last_joined_at
            .map_or(true, |last| participant.joined_at > last)
        {
            self.last_joined_at = Some(participant.joined_at);
        }
        self.participants
            .insert(participant.id.clone(), participant.clone());

        JoinOutcome {
            participant,
            previous_roster,
            replaced,
        }
    }

    /// Remove an entry. Removing an absent id is a no-op.
    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        self.participants.remove(id)
    }

    /// Current roster, oldest first.
    #[must_use]
    pub fn roster(&self) -> Vec<Participant> {
        let mut roster: Vec<Participant> = self.participants.values().cloned().collect();
        roster.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        roster
    }

    #[must_use]
    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    /// Session the participant joined from.
    #[must_use]
    pub fn session_of(&self, id: &ParticipantId) -> Option<&SessionId> {
        self.participants
            .get(id)
            .and_then(|participant| participant.session_id.as_ref())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }

    fn next_joined_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_joined_at {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn session() -> CallSession {
        CallSession::new(RoomId::new("room-1"))
    }

    fn ids(roster: &[Participant]) -> Vec<&str> {
        roster.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_join_returns_roster_before_join() {
        let mut session = session();

        let a = session.admit(ParticipantId::new("alice"), "Alice", None);
        assert!(a.previous_roster.is_empty());
        assert!(a.replaced.is_none());

        let b = session.admit(ParticipantId::new("bob"), "Bob", None);
        assert_eq!(ids(&b.previous_roster), vec!["alice"]);

        let c = session.admit(ParticipantId::new("carol"), "Carol", None);
        assert_eq!(ids(&c.previous_roster), vec!["alice", "bob"]);
        assert_eq!(session.len(), 3);
    }

    #[test]
    fn test_joined_at_is_strictly_increasing() {
        let mut session = session();
        let mut stamps = Vec::new();
        for i in 0..50 {
            let outcome = session.admit(ParticipantId::new(format!("p{i}")), "P", None);
            stamps.push(outcome.participant.joined_at);
        }
        assert!(stamps.windows(2).all(|w| matches!(w, [a, b] if a < b)));
    }

    #[test]
    fn test_rejoin_replaces_stale_entry() {
        let mut session = session();
        session.admit(ParticipantId::new("alice"), "Alice", None);
        session.admit(
            ParticipantId::new("bob"),
            "Bob",
            Some(SessionId::new("s1")),
        );

        let rejoin = session.admit(
            ParticipantId::new("bob"),
            "Bob",
            Some(SessionId::new("s2")),
        );

        assert_eq!(session.len(), 2);
        assert_eq!(ids(&rejoin.previous_roster), vec!["alice"]);
        assert_eq!(
            rejoin.replaced.unwrap().session_id,
            Some(SessionId::new("s1"))
        );
        assert_eq!(
            session.session_of(&ParticipantId::new("bob")),
            Some(&SessionId::new("s2"))
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut session = session();
        session.admit(ParticipantId::new("alice"), "Alice", None);

        assert!(session.remove(&ParticipantId::new("alice")).is_some());
        assert!(session.remove(&ParticipantId::new("alice")).is_none());
        assert!(session.is_empty());
    }

    #[test]
    fn test_descriptor_conversion_keeps_admission_time() {
        let mut session = session();
        let outcome = session.admit(
            ParticipantId::new("alice"),
            "Alice",
            Some(SessionId::new("s1")),
        );

        let descriptor = outcome.participant.to_descriptor();
        assert_eq!(descriptor.joined_at, Some(outcome.participant.joined_at));

        let back = Participant::from_descriptor(&descriptor, Utc::now());
        assert_eq!(back, outcome.participant);
    }

    #[test]
    fn test_insert_keeps_external_joined_at() {
        let mut view = session();
        let earlier = Utc::now() - ChronoDuration::seconds(30);
        let descriptor = ParticipantDescriptor {
            id: ParticipantId::new("alice"),
            display_name: "Alice".to_string(),
            joined_at: Some(earlier),
            session_id: None,
        };

        view.insert(Participant::from_descriptor(&descriptor, Utc::now()));
        assert_eq!(
            view.get(&ParticipantId::new("alice")).unwrap().joined_at,
            earlier
        );
    }
}
