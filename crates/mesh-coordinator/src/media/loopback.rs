//! Loopback drivers for running the coordinator without real devices.
//!
//! `LoopbackMedia` hands out handles and tracks the per-track flags.
//! `LoopbackEngine` produces synthetic descriptions and trickles one host
//! candidate per description, which is enough to exercise the full
//! offer/answer/candidate exchange.

use super::{
    EngineError, EngineEvent, EngineEventSender, LocalMedia, MediaError, MediaHandle, PeerEngine,
    TrackKind,
};
use async_trait::async_trait;
use common::types::{ParticipantId, RoomId};
use signaling_protocol::{CandidatePayload, SessionDescription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Tracks {
    audio: bool,
    video: bool,
}

/// In-memory local media.
#[derive(Debug, Default)]
pub struct LoopbackMedia {
    next_handle: AtomicU64,
    streams: Mutex<HashMap<MediaHandle, Tracks>>,
}

impl LoopbackMedia {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current `(audio, video)` flags of a live stream.
    pub async fn tracks(&self, handle: MediaHandle) -> Option<(bool, bool)> {
        self.streams
            .lock()
            .await
            .get(&handle)
            .map(|t| (t.audio, t.video))
    }
}

#[async_trait]
impl LocalMedia for LoopbackMedia {
    async fn acquire(&self) -> Result<MediaHandle, MediaError> {
        let handle = MediaHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        self.streams.lock().await.insert(
            handle,
            Tracks {
                audio: true,
                video: true,
            },
        );
        debug!(target: "mesh.media", handle = handle.id(), "Loopback stream acquired");
        Ok(handle)
    }

    async fn release(&self, handle: MediaHandle) {
        if self.streams.lock().await.remove(&handle).is_some() {
            debug!(target: "mesh.media", handle = handle.id(), "Loopback stream released");
        }
    }

    async fn set_enabled(
        &self,
        handle: MediaHandle,
        track: TrackKind,
        enabled: bool,
    ) -> Result<(), MediaError> {
        let mut streams = self.streams.lock().await;
        let tracks = streams.get_mut(&handle).ok_or(MediaError::UnknownHandle)?;
        match track {
            TrackKind::Audio => tracks.audio = enabled,
            TrackKind::Video => tracks.video = enabled,
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LoopbackPeer {
    events: EngineEventSender,
    descriptions: u32,
}

/// Synthetic peer-connection driver.
#[derive(Debug)]
pub struct LoopbackEngine {
    local_id: ParticipantId,
    peers: Mutex<HashMap<(RoomId, ParticipantId), LoopbackPeer>>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Number of open peer connections.
    pub async fn open_connections(&self) -> usize {
        self.peers.lock().await.len()
    }

    async fn describe(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        kind: &str,
    ) -> Result<String, EngineError> {
        let mut peers = self.peers.lock().await;
        let peer = peers
            .get_mut(&(room_id.clone(), remote_id.clone()))
            .ok_or_else(|| EngineError::UnknownPeer(remote_id.clone()))?;
        peer.descriptions += 1;

        let candidate = CandidatePayload {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                peer.descriptions,
                40_000 + peer.descriptions
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let _ = peer.events.send(EngineEvent::LocalCandidate {
            room_id: room_id.clone(),
            remote_id: remote_id.clone(),
            candidate,
        });

        Ok(format!(
            "v=0\r\no={} {} 1 IN IP4 127.0.0.1\r\ns={kind}\r\n",
            self.local_id, peer.descriptions
        ))
    }
}

#[async_trait]
impl PeerEngine for LoopbackEngine {
    async fn open(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        media: MediaHandle,
        events: EngineEventSender,
    ) -> Result<(), EngineError> {
        debug!(
            target: "mesh.media",
            room_id = %room_id,
            remote_id = %remote_id,
            handle = media.id(),
            "Loopback peer connection opened"
        );
        self.peers.lock().await.insert(
            (room_id.clone(), remote_id.clone()),
            LoopbackPeer {
                events,
                descriptions: 0,
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
        let sdp = self.describe(room_id, remote_id, "offer").await?;
        let offer = SessionDescription::new(sdp);
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
        offer: &SessionDescription,
    ) -> Result<SessionDescription, EngineError> {
        if offer.sdp.is_empty() {
            return Err(EngineError::Negotiation("empty offer".to_string()));
        }
        let sdp = self.describe(room_id, remote_id, "answer").await?;
        Ok(SessionDescription::new(sdp))
    }

    async fn set_remote_description(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        answer: &SessionDescription,
    ) -> Result<(), EngineError> {
        if answer.sdp.is_empty() {
            return Err(EngineError::Negotiation("empty answer".to_string()));
        }
        if self
            .peers
            .lock()
            .await
            .contains_key(&(room_id.clone(), remote_id.clone()))
        {
            Ok(())
        } else {
            Err(EngineError::UnknownPeer(remote_id.clone()))
        }
    }

    async fn add_candidate(
        &self,
        room_id: &RoomId,
        remote_id: &ParticipantId,
        candidate: &CandidatePayload,
    ) -> Result<(), EngineError> {
        if candidate.candidate.is_empty() {
            return Err(EngineError::InvalidCandidate("empty candidate".to_string()));
        }
        debug!(
            target: "mesh.media",
            room_id = %room_id,
            remote_id = %remote_id,
            "Loopback candidate applied"
        );
        Ok(())
    }

    async fn close(&self, room_id: &RoomId, remote_id: &ParticipantId) {
        self.peers
            .lock()
            .await
            .remove(&(room_id.clone(), remote_id.clone()));
    }
}
