//! Test call harness for end-to-end mesh testing.
//!
//! Provides `TestCall` for running a presence service and any number of real
//! `MeshController`s on one in-process relay bus. Media and the peer engine
//! are mocks so tests can inspect every call the coordinator made.

use crate::eventual::{assert_eventually, DEFAULT_SETTLE_TIMEOUT};
use crate::fixtures::TestParticipant;
use crate::mock_engine::MockPeerEngine;
use crate::mock_media::MockMedia;
use common::types::{ParticipantId, RoomId};
use mesh_coordinator::actors::{
    ActorMetrics, MeshControllerHandle, MeshEvent, PresenceServiceHandle, RoomSnapshot,
};
use mesh_coordinator::config::Config;
use mesh_coordinator::errors::MeshError;
use mesh_coordinator::media::{LocalMedia, PeerEngine};
use mesh_coordinator::relay::{BusClient, Relay, RelayBus, RelayEvent, Subscription};
use signaling_protocol::{EventKind, SignalingEnvelope};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Identity the harness presence service publishes as.
pub const PRESENCE_ID: &str = "presence";

/// Test harness for running a full call in-process.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_two_party_call() -> Result<(), anyhow::Error> {
///     let call = TestCall::start("room-1").await?;
///     let alice = call.participant("alice").await;
///     let bob = call.participant("bob").await;
///
///     alice.join().await?;
///     bob.join().await?;
///     call.wait_for_full_mesh(&[&alice, &bob]).await?;
///     Ok(())
/// }
/// ```
pub struct TestCall {
    bus: RelayBus,
    presence: PresenceServiceHandle,
    config: Arc<Config>,
    metrics: Arc<ActorMetrics>,
    room_id: RoomId,
}

impl TestCall {
    /// Start a call with test timings (see [`TestCall::test_config`]).
    ///
    /// # Returns
    /// * `Ok(TestCall)` - Presence is serving `room`
    /// * `Err(anyhow::Error)` - If the room could not be opened
    pub async fn start(room: impl Into<String>) -> Result<Self, anyhow::Error> {
        Self::with_config(room, Self::test_config(&[])?).await
    }

    /// Start a call with an explicit configuration.
    pub async fn with_config(room: impl Into<String>, config: Config) -> Result<Self, anyhow::Error> {
        let config = Arc::new(config);
        let metrics = ActorMetrics::new();
        let bus = RelayBus::new();
        let room_id = RoomId::new(room);

        let presence_relay = bus.connect(config.presence_id.clone()).await;
        let presence = PresenceServiceHandle::new(
            Arc::clone(&config),
            Arc::new(presence_relay),
            Arc::clone(&metrics),
        );
        presence
            .open_room(room_id.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open room: {}", e))?;

        Ok(Self {
            bus,
            presence,
            config,
            metrics,
            room_id,
        })
    }

    /// Configuration with test timings, overridden by `overrides`.
    ///
    /// Defaults: 2s negotiation timeout, 1 retry, 1s disconnect debounce,
    /// 50ms timer resolution.
    pub fn test_config(overrides: &[(&str, &str)]) -> Result<Config, anyhow::Error> {
        let mut vars = HashMap::from([
            ("MESH_INSTANCE_ID".to_string(), "mesh-test".to_string()),
            ("MESH_PRESENCE_ID".to_string(), PRESENCE_ID.to_string()),
            ("MESH_NEGOTIATION_TIMEOUT_MS".to_string(), "2000".to_string()),
            ("MESH_NEGOTIATION_RETRIES".to_string(), "1".to_string()),
            ("MESH_DISCONNECT_DEBOUNCE_MS".to_string(), "1000".to_string()),
            ("MESH_TIMER_RESOLUTION_MS".to_string(), "50".to_string()),
        ]);
        for (name, value) in overrides {
            vars.insert((*name).to_string(), (*value).to_string());
        }

        Config::from_vars(&vars).map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))
    }

    /// A participant with working mock media and a mock engine.
    pub async fn participant(&self, id: &str) -> TestClient {
        self.participant_with(
            id,
            Arc::new(MockMedia::new()),
            Arc::new(MockPeerEngine::new(id)),
        )
        .await
    }

    /// A participant with caller-provided mocks.
    pub async fn participant_with(
        &self,
        id: &str,
        media: Arc<MockMedia>,
        engine: Arc<MockPeerEngine>,
    ) -> TestClient {
        let participant_id = ParticipantId::new(id);
        let relay = self.bus.connect(participant_id.clone()).await;
        let local_media: Arc<dyn LocalMedia> = media.clone();
        let peer_engine: Arc<dyn PeerEngine> = engine.clone();
        let controller = MeshControllerHandle::new(
            Arc::clone(&self.config),
            Arc::new(relay),
            local_media,
            peer_engine,
            Arc::clone(&self.metrics),
        );
        let events = controller.subscribe_events();

        TestClient {
            id: participant_id,
            room_id: self.room_id.clone(),
            controller,
            media,
            engine,
            events,
        }
    }

    /// A raw relay client subscribed to the room, for acting as a remote
    /// peer by hand.
    pub async fn raw_client(
        &self,
        participant: &TestParticipant,
    ) -> Result<(BusClient, Subscription), anyhow::Error> {
        let client = self.bus.connect(participant.id.clone()).await;
        let subscription = client
            .subscribe(&self.room_id)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to subscribe: {}", e))?;
        Ok((client, subscription))
    }

    /// Simulate a transport loss for `participant_id`.
    pub async fn drop_connection(&self, participant_id: &ParticipantId) -> usize {
        self.bus.drop_connection(participant_id).await
    }

    /// Participant IDs presence currently admits, oldest first.
    pub async fn presence_roster(&self) -> Result<Vec<ParticipantId>, MeshError> {
        let state = self.presence.room_state(self.room_id.clone()).await?;
        Ok(state.roster.into_iter().map(|p| p.id).collect())
    }

    /// Wait until every client has a connected link to every other client.
    pub async fn wait_for_full_mesh(&self, clients: &[&TestClient]) -> Result<(), anyhow::Error> {
        let expected = clients.len().saturating_sub(1);
        assert_eventually(DEFAULT_SETTLE_TIMEOUT, move || async move {
            for client in clients {
                match client.snapshot().await {
                    Ok(snapshot)
                        if snapshot.connected_count() == expected
                            && snapshot.roster.len() == expected
                            && snapshot.is_fully_meshed() => {}
                    _ => return false,
                }
            }
            true
        })
        .await
        .map_err(|e| anyhow::anyhow!("Mesh did not converge: {}", e))
    }

    /// Wait until presence admits exactly `expected`, in order.
    pub async fn wait_for_presence(&self, expected: &[&ParticipantId]) -> Result<(), anyhow::Error> {
        assert_eventually(DEFAULT_SETTLE_TIMEOUT, move || async move {
            self.presence_roster().await.is_ok_and(|roster| {
                roster.len() == expected.len()
                    && roster.iter().zip(expected).all(|(a, b)| a == *b)
            })
        })
        .await
        .map_err(|e| anyhow::anyhow!("Presence roster did not converge: {}", e))
    }

    pub fn bus(&self) -> &RelayBus {
        &self.bus
    }

    pub fn presence(&self) -> &PresenceServiceHandle {
        &self.presence
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }
}

impl Drop for TestCall {
    fn drop(&mut self) {
        self.presence.cancel();
    }
}

/// One local participant in a `TestCall`.
pub struct TestClient {
    pub id: ParticipantId,
    pub room_id: RoomId,
    pub controller: MeshControllerHandle,
    pub media: Arc<MockMedia>,
    pub engine: Arc<MockPeerEngine>,
    pub events: broadcast::Receiver<MeshEvent>,
}

impl TestClient {
    /// Join the call's room.
    pub async fn join(&self) -> Result<RoomSnapshot, MeshError> {
        self.controller
            .join_room(self.room_id.clone(), format!("Test {}", self.id))
            .await
    }

    /// Leave the call's room.
    pub async fn leave(&self) -> Result<(), MeshError> {
        self.controller.leave_room(self.room_id.clone()).await
    }

    /// Current view of the call's room.
    pub async fn snapshot(&self) -> Result<RoomSnapshot, MeshError> {
        self.controller.room_snapshot(self.room_id.clone()).await
    }

    /// Open a fresh relay session on `call`'s bus and hand it to the controller.
    pub async fn reconnect(&self, call: &TestCall) -> Result<(), MeshError> {
        let relay = call.bus.connect(self.id.clone()).await;
        self.controller.replace_relay(Arc::new(relay)).await
    }

    /// Wait for the next event matching `predicate`, skipping others.
    pub async fn next_event_matching<P>(
        &mut self,
        timeout: Duration,
        mut predicate: P,
    ) -> Result<MeshEvent, anyhow::Error>
    where
        P: FnMut(&MeshEvent) -> bool,
    {
        tokio::time::timeout(timeout, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if predicate(&event) => return Ok(event),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(anyhow::anyhow!("Event channel closed"));
                    }
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("No matching event within {:?}", timeout))?
    }
}

/// Next envelope of `kind` on a raw subscription, skipping everything else.
pub async fn recv_envelope(
    subscription: &mut Subscription,
    kind: EventKind,
    timeout: Duration,
) -> Result<SignalingEnvelope, anyhow::Error> {
    tokio::time::timeout(timeout, async {
        loop {
            match subscription.recv().await {
                Some(RelayEvent::Envelope(envelope)) if envelope.kind() == kind => {
                    return Ok(envelope);
                }
                Some(_) => {}
                None => return Err(anyhow::anyhow!("Subscription closed")),
            }
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("No {} envelope within {:?}", kind.as_str(), timeout))?
}

/// Drain every envelope currently queued on a raw subscription.
pub fn drain_envelopes(subscription: &mut Subscription) -> Vec<SignalingEnvelope> {
    let mut envelopes = Vec::new();
    while let Some(event) = subscription.try_recv() {
        if let RelayEvent::Envelope(envelope) = event {
            envelopes.push(envelope);
        }
    }
    envelopes
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.controller.cancel();
    }
}
