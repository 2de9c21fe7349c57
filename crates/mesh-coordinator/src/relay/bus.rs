//! In-process relay.
//!
//! Every publish goes through the bus codec (encode, then decode) so an
//! envelope that would not survive the wire is rejected at the publisher.
//! A single lock serializes publishes, which gives per-room FIFO delivery.
//! Only live sessions are tracked; a dropped session is forgotten and its
//! client handles fail with `Disconnected` from then on.

use super::{Relay, RelayError, RelayEvent, Subscription};
use async_trait::async_trait;
use common::types::{ParticipantId, RoomId, SessionId};
use signaling_protocol::{decode_envelope, encode_envelope, SignalingEnvelope};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ClientEntry {
    participant_id: ParticipantId,
    session_id: SessionId,
}

#[derive(Debug)]
struct RoomSubscriber {
    client: u64,
    participant_id: ParticipantId,
    sender: mpsc::UnboundedSender<RelayEvent>,
}

#[derive(Debug, Default)]
struct BusState {
    next_client: u64,
    clients: HashMap<u64, ClientEntry>,
    rooms: HashMap<RoomId, Vec<RoomSubscriber>>,
}

/// Shared in-process relay. Cloning shares the same bus.
#[derive(Debug, Clone, Default)]
pub struct RelayBus {
    state: Arc<Mutex<BusState>>,
}

impl RelayBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new transport session for `participant_id`.
    pub async fn connect(&self, participant_id: ParticipantId) -> BusClient {
        let session_id = SessionId::generate();
        let mut state = self.state.lock().await;
        state.next_client += 1;
        let client = state.next_client;
        state.clients.insert(
            client,
            ClientEntry {
                participant_id: participant_id.clone(),
                session_id: session_id.clone(),
            },
        );

        debug!(
            target: "mesh.relay",
            participant_id = %participant_id,
            session_id = %session_id,
            "Relay session opened"
        );

        BusClient {
            bus: self.clone(),
            client,
            participant_id,
            session_id,
        }
    }

    /// Simulate a transport loss for every live session of `participant_id`.
    ///
    /// The dropped sessions get `ConnectionLost` on each subscription; the
    /// remaining members of the affected rooms get `PeerDisconnected`.
    /// Returns the number of sessions dropped.
    pub async fn drop_connection(&self, participant_id: &ParticipantId) -> usize {
        let mut state = self.state.lock().await;

        let dropped: Vec<(u64, SessionId)> = state
            .clients
            .iter()
            .filter(|(_, entry)| &entry.participant_id == participant_id)
            .map(|(client, entry)| (*client, entry.session_id.clone()))
            .collect();
        for (client, _) in &dropped {
            state.clients.remove(client);
        }

        for (client, session_id) in &dropped {
            for (room_id, subscribers) in &mut state.rooms {
                let before = subscribers.len();
                subscribers.retain(|sub| {
                    if sub.client == *client {
                        let _ = sub.sender.send(RelayEvent::ConnectionLost);
                        false
                    } else {
                        true
                    }
                });
                if subscribers.len() == before {
                    continue;
                }

                for sub in subscribers.iter() {
                    let _ = sub.sender.send(RelayEvent::PeerDisconnected {
                        participant_id: participant_id.clone(),
                        session_id: session_id.clone(),
                    });
                }

                info!(
                    target: "mesh.relay",
                    room_id = %room_id,
                    participant_id = %participant_id,
                    session_id = %session_id,
                    "Relay session dropped"
                );
            }
        }

        state.rooms.retain(|_, subscribers| !subscribers.is_empty());
        dropped.len()
    }

    /// Number of live transport sessions.
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    /// Number of live subscriptions to `room_id`.
    pub async fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.state
            .lock()
            .await
            .rooms
            .get(room_id)
            .map_or(0, Vec::len)
    }

    async fn subscribe_client(
        &self,
        client: u64,
        participant_id: &ParticipantId,
        room_id: &RoomId,
    ) -> Result<Subscription, RelayError> {
        let mut state = self.state.lock().await;
        if !state.clients.contains_key(&client) {
            return Err(RelayError::Disconnected);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let subscribers = state.rooms.entry(room_id.clone()).or_default();
        // One subscription per client and room
        subscribers.retain(|sub| sub.client != client);
        subscribers.push(RoomSubscriber {
            client,
            participant_id: participant_id.clone(),
            sender,
        });

        Ok(Subscription::new(room_id.clone(), receiver))
    }

    async fn unsubscribe_client(&self, client: u64, room_id: &RoomId) {
        let mut state = self.state.lock().await;
        if let Some(subscribers) = state.rooms.get_mut(room_id) {
            subscribers.retain(|sub| sub.client != client);
            if subscribers.is_empty() {
                state.rooms.remove(room_id);
            }
        }
    }

    async fn publish_from(
        &self,
        client: u64,
        room_id: &RoomId,
        envelope: &SignalingEnvelope,
    ) -> Result<(), RelayError> {
        if &envelope.room_id != room_id {
            return Err(RelayError::RoomMismatch {
                target: room_id.clone(),
                envelope: envelope.room_id.clone(),
            });
        }

        let frame = encode_envelope(envelope).map_err(|e| RelayError::Rejected(e.to_string()))?;
        let delivered = decode_envelope(&frame).map_err(|e| RelayError::Rejected(e.to_string()))?;

        let mut state = self.state.lock().await;
        if !state.clients.contains_key(&client) {
            return Err(RelayError::Disconnected);
        }

        let Some(subscribers) = state.rooms.get_mut(room_id) else {
            return Ok(());
        };

        subscribers.retain(|sub| {
            if sub.client == client || !delivered.is_for(&sub.participant_id) {
                return true;
            }
            // A closed receiver means the subscriber went away
            sub.sender
                .send(RelayEvent::Envelope(delivered.clone()))
                .is_ok()
        });

        if subscribers.is_empty() {
            warn!(
                target: "mesh.relay",
                room_id = %room_id,
                "Room has no subscribers left"
            );
            state.rooms.remove(room_id);
        }

        Ok(())
    }
}

/// One transport session on a [`RelayBus`].
#[derive(Debug, Clone)]
pub struct BusClient {
    bus: RelayBus,
    client: u64,
    participant_id: ParticipantId,
    session_id: SessionId,
}

#[async_trait]
impl Relay for BusClient {
    fn local_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    fn local_session(&self) -> &SessionId {
        &self.session_id
    }

    async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription, RelayError> {
        self.bus
            .subscribe_client(self.client, &self.participant_id, room_id)
            .await
    }

    async fn unsubscribe(&self, room_id: &RoomId) {
        self.bus.unsubscribe_client(self.client, room_id).await;
    }

    async fn publish(
        &self,
        room_id: &RoomId,
        envelope: SignalingEnvelope,
    ) -> Result<(), RelayError> {
        self.bus.publish_from(self.client, room_id, &envelope).await
    }
}
