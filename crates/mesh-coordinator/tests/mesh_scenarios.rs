//! End-to-end mesh scenarios.
//!
//! Runs presence and real controllers on one relay bus and walks a room
//! through join, full mesh, leave and relay loss, checking the mesh
//! invariants at every step.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use common::types::ParticipantId;
use mesh_coordinator::actors::{CallEndReason, CloseReason, MeshEvent};
use mesh_coordinator::errors::MeshError;
use mesh_coordinator::link::{LinkRole, LinkState};
use mesh_test_utils::{assert_eventually, MockMedia, MockPeerEngine, TestCall, TestClient};
use signaling_protocol::LeaveReason;
use std::sync::Arc;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sorted remote IDs with a connected link.
async fn connected_remotes(client: &TestClient) -> Vec<ParticipantId> {
    client
        .snapshot()
        .await
        .map(|snapshot| {
            snapshot
                .links
                .into_iter()
                .filter(|link| link.state == LinkState::Connected)
                .map(|link| link.remote_id)
                .collect()
        })
        .unwrap_or_default()
}

async fn join_in_order(call: &TestCall, clients: &[&TestClient]) {
    for client in clients {
        client.join().await.unwrap();
    }
    call.wait_for_full_mesh(clients).await.unwrap();
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_first_joiner_has_no_links() {
    let call = TestCall::start("scenario-1").await.unwrap();
    let alice = call.participant("alice").await;

    let snapshot = alice.join().await.unwrap();

    assert!(snapshot.roster.is_empty());
    assert!(snapshot.links.is_empty());
    call.wait_for_presence(&[&alice.id]).await.unwrap();
    assert!(alice.engine.calls().is_empty());
    assert_eq!(alice.media.live_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_joiner_offers_to_first() {
    let call = TestCall::start("scenario-2").await.unwrap();
    let alice = call.participant("alice").await;
    let bob = call.participant("bob").await;

    alice.join().await.unwrap();
    let snapshot = bob.join().await.unwrap();

    // The roster came from presence and the offer went out before join resolved
    assert_eq!(snapshot.roster.len(), 1);
    let link = snapshot.link(&alice.id).expect("link to alice");
    assert_eq!(link.state, LinkState::Offering);
    assert_eq!(link.role, Some(LinkRole::Offerer));

    call.wait_for_full_mesh(&[&alice, &bob]).await.unwrap();

    assert_eq!(bob.engine.offered_to(), vec![alice.id.clone()]);
    assert!(alice.engine.offered_to().is_empty());

    let alice_view = alice.snapshot().await.unwrap();
    assert_eq!(
        alice_view.link(&bob.id).and_then(|link| link.role),
        Some(LinkRole::Answerer)
    );
    assert_eq!(call.metrics().link_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_third_joiner_completes_triangle() {
    let call = TestCall::start("scenario-3").await.unwrap();
    let alice = call.participant("alice").await;
    let bob = call.participant("bob").await;
    let carol = call.participant("carol").await;

    join_in_order(&call, &[&alice, &bob]).await;
    carol.join().await.unwrap();
    call.wait_for_full_mesh(&[&alice, &bob, &carol]).await.unwrap();

    // Carol offered to both, in roster order; nobody offered to carol
    assert_eq!(
        carol.engine.offered_to(),
        vec![alice.id.clone(), bob.id.clone()]
    );
    assert!(alice.engine.offered_to().is_empty());
    assert_eq!(bob.engine.offered_to(), vec![alice.id.clone()]);

    // Three pairs, two link ends each
    assert_eq!(call.metrics().link_count(), 6);
    call.wait_for_presence(&[&alice.id, &bob.id, &carol.id])
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_leave_closes_exactly_the_leavers_links() {
    let call = TestCall::start("scenario-4").await.unwrap();
    let mut alice = call.participant("alice").await;
    let bob = call.participant("bob").await;
    let carol = call.participant("carol").await;

    join_in_order(&call, &[&alice, &bob, &carol]).await;

    bob.leave().await.unwrap();

    let closed = alice
        .next_event_matching(EVENT_TIMEOUT, |event| {
            matches!(event, MeshEvent::LinkClosed { .. })
        })
        .await
        .unwrap();
    assert_eq!(
        closed,
        MeshEvent::LinkClosed {
            room_id: call.room_id().clone(),
            remote_id: bob.id.clone(),
            reason: CloseReason::RemoteLeft,
        }
    );

    call.wait_for_full_mesh(&[&alice, &carol]).await.unwrap();
    call.wait_for_presence(&[&alice.id, &carol.id]).await.unwrap();

    assert_eq!(connected_remotes(&alice).await, vec![carol.id.clone()]);
    assert_eq!(connected_remotes(&carol).await, vec![alice.id.clone()]);

    // One removal per remaining side, none for the unrelated pair
    assert_eq!(alice.engine.close_count(&bob.id), 1);
    assert_eq!(carol.engine.close_count(&bob.id), 1);
    assert_eq!(alice.engine.close_count(&carol.id), 0);
    assert_eq!(carol.engine.close_count(&alice.id), 0);

    // The leaver closed both of its links and released its media
    assert_eq!(bob.engine.close_count(&alice.id), 1);
    assert_eq!(bob.engine.close_count(&carol.id), 1);
    assert_eq!(bob.engine.open_count(), 0);
    assert_eq!(bob.media.live_count(), 0);
    assert!(matches!(bob.snapshot().await, Err(MeshError::NotInCall(_))));

    assert_eq!(call.metrics().link_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_relay_loss_tears_down_locally_and_others_after_debounce() {
    let config = TestCall::test_config(&[("MESH_DISCONNECT_DEBOUNCE_MS", "5000")]).unwrap();
    let call = TestCall::with_config("scenario-5", config).await.unwrap();
    let mut alice = call.participant("alice").await;
    let mut bob = call.participant("bob").await;
    let carol = call.participant("carol").await;

    join_in_order(&call, &[&alice, &bob, &carol]).await;

    assert_eq!(call.drop_connection(&alice.id).await, 1);

    // Local side: immediate teardown, no debounce
    let ended = alice
        .next_event_matching(EVENT_TIMEOUT, |event| {
            matches!(event, MeshEvent::CallEnded { .. })
        })
        .await
        .unwrap();
    assert_eq!(
        ended,
        MeshEvent::CallEnded {
            room_id: call.room_id().clone(),
            reason: CallEndReason::RelayDisconnected,
        }
    );
    assert_eq!(alice.engine.close_count(&bob.id), 1);
    assert_eq!(alice.engine.close_count(&carol.id), 1);
    assert_eq!(alice.media.live_count(), 0);

    // Presence is still holding alice while the debounce runs
    let (presence, room_id, alice_id) = (call.presence(), call.room_id(), &alice.id);
    assert_eventually(EVENT_TIMEOUT, move || async move {
        presence
            .room_state(room_id.clone())
            .await
            .is_ok_and(|state| state.pending_disconnects == vec![alice_id.clone()])
    })
    .await
    .unwrap();
    assert!(call.presence_roster().await.unwrap().contains(&alice.id));

    // Remote side: implicit leave once the debounce expires
    let left = bob
        .next_event_matching(Duration::from_secs(10), |event| {
            matches!(event, MeshEvent::ParticipantLeft { .. })
        })
        .await
        .unwrap();
    assert_eq!(
        left,
        MeshEvent::ParticipantLeft {
            room_id: call.room_id().clone(),
            participant_id: alice.id.clone(),
            reason: LeaveReason::Disconnected,
        }
    );

    call.wait_for_full_mesh(&[&bob, &carol]).await.unwrap();
    call.wait_for_presence(&[&bob.id, &carol.id]).await.unwrap();
    assert_eq!(bob.engine.close_count(&alice.id), 1);
    assert_eq!(carol.engine.close_count(&alice.id), 1);
    assert_eq!(bob.engine.close_count(&carol.id), 0);
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_mesh_completeness_and_offer_direction() {
    let call = TestCall::start("property-mesh").await.unwrap();
    let names = ["p1", "p2", "p3", "p4", "p5"];
    let mut clients = Vec::new();
    for name in names {
        clients.push(call.participant(name).await);
    }
    let refs: Vec<&TestClient> = clients.iter().collect();

    join_in_order(&call, &refs).await;

    let n = clients.len();
    for client in &clients {
        assert_eq!(connected_remotes(client).await.len(), n - 1);
    }
    assert_eq!(call.metrics().link_count(), n * (n - 1));

    // Every participant offered exactly to those who joined before it
    for (position, client) in clients.iter().enumerate() {
        let earlier: Vec<ParticipantId> = clients
            .iter()
            .take(position)
            .map(|c| c.id.clone())
            .collect();
        assert_eq!(client.engine.offered_to(), earlier);
    }
}

#[tokio::test(start_paused = true)]
async fn test_candidates_are_applied_in_order_after_description() {
    let call = TestCall::start("property-candidates").await.unwrap();
    let alice = call
        .participant_with(
            "alice",
            Arc::new(MockMedia::new()),
            Arc::new(
                MockPeerEngine::builder("alice")
                    .candidates_per_description(3)
                    .build(),
            ),
        )
        .await;
    let bob = call
        .participant_with(
            "bob",
            Arc::new(MockMedia::new()),
            Arc::new(
                MockPeerEngine::builder("bob")
                    .candidates_per_description(3)
                    .build(),
            ),
        )
        .await;

    join_in_order(&call, &[&alice, &bob]).await;

    let (a, b) = (&alice, &bob);
    assert_eventually(EVENT_TIMEOUT, move || async move {
        a.engine.applied_candidates(&b.id).len() == 3
            && b.engine.applied_candidates(&a.id).len() == 3
    })
    .await
    .unwrap();

    assert_eq!(alice.engine.early_candidate_count(), 0);
    assert_eq!(bob.engine.early_candidate_count(), 0);

    let from_bob = alice.engine.applied_candidates(&bob.id);
    for (expected, line) in (1..=3).zip(&from_bob) {
        assert!(line.starts_with(&format!("candidate:bob-{expected} ")));
    }
    let from_alice = bob.engine.applied_candidates(&alice.id);
    for (expected, line) in (1..=3).zip(&from_alice) {
        assert!(line.starts_with(&format!("candidate:alice-{expected} ")));
    }
}

#[tokio::test(start_paused = true)]
async fn test_join_twice_keeps_one_roster_entry() {
    let call = TestCall::start("property-idempotent").await.unwrap();
    let alice = call.participant("alice").await;
    let bob = call.participant("bob").await;

    join_in_order(&call, &[&alice, &bob]).await;

    assert!(matches!(
        alice.join().await,
        Err(MeshError::AlreadyInCall(_))
    ));

    call.wait_for_presence(&[&alice.id, &bob.id]).await.unwrap();
    assert_eq!(bob.engine.offered_to(), vec![alice.id.clone()]);
    assert_eq!(connected_remotes(&alice).await, vec![bob.id.clone()]);
    assert_eq!(call.metrics().link_count(), 2);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_joins_converge_to_full_mesh() {
    let call = TestCall::start("concurrent-joins").await.unwrap();
    let p1 = call.participant("p1").await;
    let p2 = call.participant("p2").await;
    let p3 = call.participant("p3").await;
    let p4 = call.participant("p4").await;
    let p5 = call.participant("p5").await;

    let (r1, r2, r3, r4, r5) = tokio::join!(p1.join(), p2.join(), p3.join(), p4.join(), p5.join());
    for result in [r1, r2, r3, r4, r5] {
        result.unwrap();
    }

    let clients = [&p1, &p2, &p3, &p4, &p5];
    call.wait_for_full_mesh(&clients).await.unwrap();
    assert_eq!(call.presence_roster().await.unwrap().len(), 5);
    assert_eq!(call.metrics().link_count(), 20);

    // Whoever presence admitted later offered; never both, never neither
    for (position, a) in clients.iter().enumerate() {
        for b in clients.iter().skip(position + 1) {
            let a_offered = a.engine.offered_to().contains(&b.id);
            let b_offered = b.engine.offered_to().contains(&a.id);
            assert!(
                a_offered != b_offered,
                "{} and {}: exactly one side must offer",
                a.id,
                b.id
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_leave_racing_join_does_not_revive_leaver() {
    let call = TestCall::start("concurrent-leave-join").await.unwrap();
    let alice = call.participant("alice").await;
    let bob = call.participant("bob").await;
    let carol = call.participant("carol").await;

    join_in_order(&call, &[&alice, &bob]).await;

    let (left, joined) = tokio::join!(bob.leave(), carol.join());
    left.unwrap();
    joined.unwrap();

    call.wait_for_full_mesh(&[&alice, &carol]).await.unwrap();
    call.wait_for_presence(&[&alice.id, &carol.id]).await.unwrap();

    // Carol's view stays clean well past the negotiation timeout
    tokio::time::sleep(Duration::from_secs(30)).await;
    let snapshot = carol.snapshot().await.unwrap();
    assert_eq!(snapshot.roster.len(), 1);
    assert!(snapshot.link(&bob.id).is_none());
    assert_eq!(connected_remotes(&carol).await, vec![alice.id.clone()]);
    assert_eq!(connected_remotes(&alice).await, vec![carol.id.clone()]);
    assert_eq!(alice.engine.close_count(&bob.id), 1);
    assert!(carol.engine.close_count(&bob.id) <= 1);
    assert_eq!(call.metrics().link_count(), 2);
}
