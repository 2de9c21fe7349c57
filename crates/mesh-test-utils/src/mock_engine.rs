//! Mock peer engine for coordinator tests.
//!
//! Every description it produces trickles a configurable number of local
//! candidates, numbered per remote so the receiving side can check that they
//! were applied in order. It also counts candidates applied before a remote
//! description, which must never happen.
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_test_utils::MockPeerEngine;
//!
//! let engine = MockPeerEngine::builder("alice").candidates_per_description(2).build();
//! // ... run the call ...
//! assert_eq!(engine.early_candidate_count(), 0);
//! ```

use async_trait::async_trait;
use common::types::{ParticipantId, RoomId};
use mesh_coordinator::media::{
    EngineError, EngineEvent, EngineEventSender, MediaHandle, PeerEngine,
};
use signaling_protocol::{CandidatePayload, SessionDescription};
use std::collections::HashMap;
use std::sync::Mutex;

/// One call into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Open { room_id: RoomId, remote_id: ParticipantId },
    CreateOffer { room_id: RoomId, remote_id: ParticipantId, renegotiation: bool },
    CreateAnswer { room_id: RoomId, remote_id: ParticipantId },
    SetRemoteDescription { room_id: RoomId, remote_id: ParticipantId },
    AddCandidate { room_id: RoomId, remote_id: ParticipantId, candidate: String },
    Close { room_id: RoomId, remote_id: ParticipantId },
}

#[derive(Debug)]
struct Peer {
    events: EngineEventSender,
    remote_described: bool,
}

#[derive(Debug, Default)]
struct EngineState {
    peers: HashMap<(RoomId, ParticipantId), Peer>,
    calls: Vec<EngineCall>,
    /// Next candidate sequence per remote.
    sequences: HashMap<(RoomId, ParticipantId), u32>,
    early_candidates: usize,
}

/// Mock `PeerEngine`.
#[derive(Debug)]
pub struct MockPeerEngine {
    local_id: ParticipantId,
    candidates_per_description: u32,
    fail_offers: bool,
    state: Mutex<EngineState>,
}

impl MockPeerEngine {
    #[must_use]
    pub fn new(local_id: impl Into<String>) -> Self {
        Self::builder(local_id).build()
    }

    #[must_use]
    pub fn builder(local_id: impl Into<String>) -> MockPeerEngineBuilder {
        MockPeerEngineBuilder {
            local_id: ParticipantId::new(local_id),
            candidates_per_description: 1,
            fail_offers: false,
        }
    }

    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Remotes this engine created a non-renegotiation offer for.
    #[must_use]
    pub fn offered_to(&self) -> Vec<ParticipantId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::CreateOffer {
                    remote_id,
                    renegotiation: false,
                    ..
                } => Some(remote_id),
                _ => None,
            })
            .collect()
    }

    /// Remote candidates applied for `remote_id`, in order.
    #[must_use]
    pub fn applied_candidates(&self, remote_id: &ParticipantId) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::AddCandidate {
                    remote_id: r,
                    candidate,
                    ..
                } if &r == remote_id => Some(candidate),
                _ => None,
            })
            .collect()
    }

    /// Number of `close` calls for `remote_id`.
    #[must_use]
    pub fn close_count(&self, remote_id: &ParticipantId) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, EngineCall::Close { remote_id: r, .. } if r == remote_id))
            .count()
    }

    /// Candidates that arrived before any remote description.
    #[must_use]
    pub fn early_candidate_count(&self) -> usize {
        self.state.lock().unwrap().early_candidates
    }

    /// Number of open peer connections.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().peers.len()
    }

    /// Report a post-negotiation failure for a link.
    pub fn fail_connection(&self, room_id: &RoomId, remote_id: &ParticipantId, reason: &str) {
        let state = self.state.lock().unwrap();
        if let Some(peer) = state.peers.get(&(room_id.clone(), remote_id.clone())) {
            let _ = peer.events.send(EngineEvent::ConnectionFailed {
                room_id: room_id.clone(),
                remote_id: remote_id.clone(),
                reason: reason.to_string(),
            });
        }
    }

    /// Record a description and trickle candidates for it.
    fn describe(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        kind: &str,
    ) -> Result<String, EngineError> {
        let mut state = self.state.lock().unwrap();
        let key = (room_id.clone(), remote_id.clone());
        let events = state
            .peers
            .get(&key)
            .map(|peer| peer.events.clone())
            .ok_or_else(|| EngineError::UnknownPeer(remote_id.clone()))?;

        for _ in 0..self.candidates_per_description {
            let sequence = state.sequences.entry(key.clone()).or_insert(0);
            *sequence += 1;
            let candidate = CandidatePayload {
                candidate: format!("candidate:{}-{} 1 udp 1 10.0.0.1 {} typ host", self.local_id, sequence, 50_000 + *sequence),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            };
            let _ = events.send(EngineEvent::LocalCandidate {
                room_id: room_id.clone(),
                remote_id: remote_id.clone(),
                candidate,
            });
        }

        Ok(format!("v=0\r\no={} {kind}\r\n", self.local_id))
    }
}

#[async_trait]
impl PeerEngine for MockPeerEngine {
    async fn open(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        _media: MediaHandle,
        events: EngineEventSender,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Open {
            room_id: room_id.clone(),
            remote_id: remote_id.clone(),
        });
        state.peers.insert(
            (room_id.clone(), remote_id.clone()),
            Peer {
                events,
                remote_described: false,
            },
        );
        Ok(())
    }

    async fn create_offer(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        renegotiation: bool,
    ) -> Result<SessionDescription, EngineError> {
        self.state.lock().unwrap().calls.push(EngineCall::CreateOffer {
            room_id: room_id.clone(),
            remote_id: remote_id.clone(),
            renegotiation,
        });
        if self.fail_offers {
            return Err(EngineError::Negotiation("offer refused".to_string()));
        }
        let offer = SessionDescription::new(self.describe(room_id, remote_id, "offer")?);
        Ok(if renegotiation {
            offer.renegotiating()
        } else {
            offer
        })
    }

    async fn create_answer(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        _offer: &SessionDescription,
    ) -> Result<SessionDescription, EngineError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(EngineCall::CreateAnswer {
                room_id: room_id.clone(),
                remote_id: remote_id.clone(),
            });
            // The offer is the remote description
            if let Some(peer) = state.peers.get_mut(&(room_id.clone(), remote_id.clone())) {
                peer.remote_described = true;
            }
        }
        Ok(SessionDescription::new(self.describe(
            room_id, remote_id, "answer",
        )?))
    }

    async fn set_remote_description(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        _answer: &SessionDescription,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::SetRemoteDescription {
            room_id: room_id.clone(),
            remote_id: remote_id.clone(),
        });
        let peer = state
            .peers
            .get_mut(&(room_id.clone(), remote_id.clone()))
            .ok_or_else(|| EngineError::UnknownPeer(remote_id.clone()))?;
        peer.remote_described = true;
        Ok(())
    }

    async fn add_candidate(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        candidate: &CandidatePayload,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::AddCandidate {
            room_id: room_id.clone(),
            remote_id: remote_id.clone(),
            candidate: candidate.candidate.clone(),
        });
        let described = state
            .peers
            .get(&(room_id.clone(), remote_id.clone()))
            .is_some_and(|peer| peer.remote_described);
        if !described {
            state.early_candidates += 1;
        }
        Ok(())
    }

    async fn close(&self, room_id: &RoomId, remote_id: &ParticipantId) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Close {
            room_id: room_id.clone(),
            remote_id: remote_id.clone(),
        });
        state.peers.remove(&(room_id.clone(), remote_id.clone()));
    }
}

/// Builder for `MockPeerEngine`.
#[derive(Debug)]
pub struct MockPeerEngineBuilder {
    local_id: ParticipantId,
    candidates_per_description: u32,
    fail_offers: bool,
}

impl MockPeerEngineBuilder {
    /// Candidates trickled after each description (default 1).
    #[must_use]
    pub fn candidates_per_description(mut self, count: u32) -> Self {
        self.candidates_per_description = count;
        self
    }

    /// Every `create_offer` fails.
    #[must_use]
    pub fn fail_offers(mut self) -> Self {
        self.fail_offers = true;
        self
    }

    #[must_use]
    pub fn build(self) -> MockPeerEngine {
        MockPeerEngine {
            local_id: self.local_id,
            candidates_per_description: self.candidates_per_description,
            fail_offers: self.fail_offers,
            state: Mutex::new(EngineState::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_candidates_are_numbered_per_remote() {
        let engine = MockPeerEngine::builder("alice")
            .candidates_per_description(2)
            .build();
        let room = RoomId::new("room-1");
        let bob = ParticipantId::new("bob");
        let (tx, mut rx) = mpsc::unbounded_channel();

        engine
            .open(&room, &bob, MediaHandle::new(1), tx)
            .await
            .unwrap();
        engine.create_offer(&room, &bob, false).await.unwrap();

        let mut lines = Vec::new();
        while let Ok(EngineEvent::LocalCandidate { candidate, .. }) = rx.try_recv() {
            lines.push(candidate.candidate);
        }
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("candidate:alice-1 "));
        assert!(lines[1].starts_with("candidate:alice-2 "));
        assert_eq!(engine.offered_to(), vec![bob]);
    }

    #[tokio::test]
    async fn test_early_candidate_is_flagged() {
        let engine = MockPeerEngine::new("alice");
        let room = RoomId::new("room-1");
        let bob = ParticipantId::new("bob");
        let (tx, _rx) = mpsc::unbounded_channel();

        engine
            .open(&room, &bob, MediaHandle::new(1), tx)
            .await
            .unwrap();
        engine
            .add_candidate(&room, &bob, &CandidatePayload::new("candidate:x"))
            .await
            .unwrap();
        assert_eq!(engine.early_candidate_count(), 1);

        engine
            .set_remote_description(&room, &bob, &SessionDescription::new("v=0"))
            .await
            .unwrap();
        engine
            .add_candidate(&room, &bob, &CandidatePayload::new("candidate:y"))
            .await
            .unwrap();
        assert_eq!(engine.early_candidate_count(), 1);
    }
}
