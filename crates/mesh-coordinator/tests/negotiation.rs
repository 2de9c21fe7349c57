//! Link negotiation against a hand-driven remote peer.
//!
//! The remote is a raw relay client, so tests control exactly when (and
//! whether) answers and candidates arrive.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::time::Duration;

use mesh_coordinator::actors::{CloseReason, LinkFailure, MeshEvent};
use mesh_coordinator::link::LinkState;
use mesh_coordinator::relay::{BusClient, Relay, Subscription};
use mesh_test_utils::{
    assert_eventually, assert_never, drain_envelopes, recv_envelope, EngineCall, MockMedia,
    MockPeerEngine, TestCall, TestClient, TestParticipant,
};
use signaling_protocol::{EventKind, LeaveReason, SignalingEnvelope, SignalingEvent};
use std::sync::Arc;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Join `remote` by hand and wait for its (empty) roster.
async fn raw_join(call: &TestCall, remote: &TestParticipant) -> (BusClient, Subscription) {
    let (client, mut subscription) = call.raw_client(remote).await.unwrap();
    client
        .publish(call.room_id(), remote.join_envelope(call.room_id()))
        .await
        .unwrap();
    recv_envelope(
        &mut subscription,
        EventKind::ExistingParticipants,
        EVENT_TIMEOUT,
    )
    .await
    .unwrap();
    (client, subscription)
}

fn negotiation_id(envelope: &SignalingEnvelope) -> Option<String> {
    match &envelope.event {
        SignalingEvent::Offer(offer) | SignalingEvent::Answer(offer) => {
            offer.negotiation_id.clone()
        }
        _ => None,
    }
}

async fn link_state(client: &TestClient, remote: &TestParticipant) -> Option<LinkState> {
    client
        .snapshot()
        .await
        .ok()
        .and_then(|snapshot| snapshot.link(&remote.id).map(|link| link.state))
}

#[tokio::test(start_paused = true)]
async fn test_early_candidates_are_queued_until_answer() {
    let call = TestCall::start("negotiation-queue").await.unwrap();
    let carol = TestParticipant::new("carol");
    let (client, mut sub) = raw_join(&call, &carol).await;
    let alice = call.participant("alice").await;

    alice.join().await.unwrap();
    let offer = recv_envelope(&mut sub, EventKind::Offer, EVENT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(offer.receiver_id.as_ref(), Some(&carol.id));

    // Candidates overtake the answer
    for line in ["candidate:carol-1", "candidate:carol-2"] {
        client
            .publish(
                call.room_id(),
                carol.candidate_to(call.room_id(), &alice.id, line),
            )
            .await
            .unwrap();
    }
    assert_eventually(EVENT_TIMEOUT, || async {
        alice
            .snapshot()
            .await
            .ok()
            .and_then(|s| s.link(&carol.id).map(|l| l.pending_candidates))
            == Some(2)
    })
    .await
    .unwrap();
    assert!(alice.engine.applied_candidates(&carol.id).is_empty());

    let id = negotiation_id(&offer);
    client
        .publish(
            call.room_id(),
            carol.answer_to(call.room_id(), &alice.id, id.as_deref()),
        )
        .await
        .unwrap();

    assert_eventually(EVENT_TIMEOUT, || async {
        link_state(&alice, &carol).await == Some(LinkState::Connected)
    })
    .await
    .unwrap();

    assert_eq!(
        alice.engine.applied_candidates(&carol.id),
        vec!["candidate:carol-1".to_string(), "candidate:carol-2".to_string()]
    );
    assert_eq!(alice.engine.early_candidate_count(), 0);

    // The description went in before either candidate
    let calls = alice.engine.calls();
    let described = calls
        .iter()
        .position(|c| matches!(c, EngineCall::SetRemoteDescription { .. }))
        .unwrap();
    let first_candidate = calls
        .iter()
        .position(|c| matches!(c, EngineCall::AddCandidate { .. }))
        .unwrap();
    assert!(described < first_candidate);
}

#[tokio::test(start_paused = true)]
async fn test_stale_answer_is_ignored() {
    let call = TestCall::start("negotiation-stale").await.unwrap();
    let carol = TestParticipant::new("carol");
    let (client, mut sub) = raw_join(&call, &carol).await;
    let alice = call.participant("alice").await;

    alice.join().await.unwrap();
    let offer = recv_envelope(&mut sub, EventKind::Offer, EVENT_TIMEOUT)
        .await
        .unwrap();

    client
        .publish(
            call.room_id(),
            carol.answer_to(call.room_id(), &alice.id, Some("not-the-current-offer")),
        )
        .await
        .unwrap();
    assert_never(Duration::from_millis(500), || async {
        link_state(&alice, &carol).await != Some(LinkState::Offering)
    })
    .await
    .unwrap();
    assert!(!alice
        .engine
        .calls()
        .iter()
        .any(|c| matches!(c, EngineCall::SetRemoteDescription { .. })));

    let id = negotiation_id(&offer);
    client
        .publish(
            call.room_id(),
            carol.answer_to(call.room_id(), &alice.id, id.as_deref()),
        )
        .await
        .unwrap();
    assert_eventually(EVENT_TIMEOUT, || async {
        link_state(&alice, &carol).await == Some(LinkState::Connected)
    })
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_offer_retries_once_then_fails_alone() {
    let call = TestCall::start("negotiation-timeout").await.unwrap();
    let mut alice = call.participant("alice").await;
    let bob = call.participant("bob").await;

    bob.join().await.unwrap();
    let carol = TestParticipant::new("carol");
    let (_client, mut sub) = raw_join(&call, &carol).await;

    alice.join().await.unwrap();

    let failed = alice
        .next_event_matching(Duration::from_secs(30), |event| {
            matches!(event, MeshEvent::LinkFailed { .. })
        })
        .await
        .unwrap();
    assert_eq!(
        failed,
        MeshEvent::LinkFailed {
            room_id: call.room_id().clone(),
            remote_id: carol.id.clone(),
            failure: LinkFailure::NegotiationTimeout,
        }
    );

    // First offer plus exactly one retry, each a distinct negotiation
    let offers: HashSet<String> = drain_envelopes(&mut sub)
        .iter()
        .filter(|e| e.kind() == EventKind::Offer)
        .filter_map(negotiation_id)
        .collect();
    assert_eq!(offers.len(), 2);
    assert_eq!(
        alice
            .engine
            .calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::CreateOffer { remote_id, .. } if remote_id == &carol.id))
            .count(),
        2
    );

    // The rest of the mesh is untouched
    let snapshot = alice.snapshot().await.unwrap();
    assert!(snapshot.link(&carol.id).is_none());
    assert_eq!(
        snapshot.link(&bob.id).map(|l| l.state),
        Some(LinkState::Connected)
    );
}

#[tokio::test(start_paused = true)]
async fn test_offer_failure_does_not_block_other_links() {
    let call = TestCall::start("negotiation-engine").await.unwrap();
    let mut alice = call.participant("alice").await;
    let bob = call
        .participant_with(
            "bob",
            Arc::new(MockMedia::new()),
            Arc::new(MockPeerEngine::builder("bob").fail_offers().build()),
        )
        .await;
    let carol = call.participant("carol").await;

    alice.join().await.unwrap();
    carol.join().await.unwrap();
    call.wait_for_full_mesh(&[&alice, &carol]).await.unwrap();

    // Bob cannot produce an offer for alice or carol
    let snapshot = bob.join().await.unwrap();
    assert!(snapshot.links.is_empty());
    assert_eq!(snapshot.roster.len(), 2);

    // Carol stays connected to alice; a post-connect failure only hits its link
    alice
        .engine
        .fail_connection(call.room_id(), &carol.id, "ice failed");
    let failed = alice
        .next_event_matching(EVENT_TIMEOUT, |event| {
            matches!(event, MeshEvent::LinkFailed { .. })
        })
        .await
        .unwrap();
    assert!(matches!(
        failed,
        MeshEvent::LinkFailed { remote_id, failure: LinkFailure::Engine(reason), .. }
            if remote_id == carol.id && reason == "ice failed"
    ));
    assert!(alice.snapshot().await.unwrap().link(&carol.id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_renegotiation_keeps_link_connected() {
    let call = TestCall::start("negotiation-renegotiate").await.unwrap();
    let alice = call.participant("alice").await;
    let bob = call.participant("bob").await;

    alice.join().await.unwrap();
    bob.join().await.unwrap();
    call.wait_for_full_mesh(&[&alice, &bob]).await.unwrap();

    // Renegotiation may start from the incumbent side
    let sent = alice
        .controller
        .renegotiate(call.room_id().clone())
        .await
        .unwrap();
    assert_eq!(sent, 1);

    let snapshot = alice.snapshot().await.unwrap();
    let link = snapshot.link(&bob.id).unwrap();
    assert_eq!(link.state, LinkState::Connected);

    assert_eventually(EVENT_TIMEOUT, || async {
        alice
            .snapshot()
            .await
            .ok()
            .and_then(|s| s.link(&bob.id).map(|l| !l.renegotiating))
            == Some(true)
    })
    .await
    .unwrap();

    assert!(alice.engine.calls().contains(&EngineCall::CreateOffer {
        room_id: call.room_id().clone(),
        remote_id: bob.id.clone(),
        renegotiation: true,
    }));
    assert_eq!(
        bob.engine
            .calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::CreateAnswer { .. }))
            .count(),
        1
    );
    call.wait_for_full_mesh(&[&alice, &bob]).await.unwrap();
    assert_eq!(bob.engine.close_count(&alice.id), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_renegotiation_closes_link() {
    let call = TestCall::start("negotiation-renegotiate-timeout").await.unwrap();
    let carol = TestParticipant::new("carol");
    let (client, mut sub) = raw_join(&call, &carol).await;
    let mut alice = call.participant("alice").await;

    alice.join().await.unwrap();
    let offer = recv_envelope(&mut sub, EventKind::Offer, EVENT_TIMEOUT)
        .await
        .unwrap();
    let id = negotiation_id(&offer);
    client
        .publish(
            call.room_id(),
            carol.answer_to(call.room_id(), &alice.id, id.as_deref()),
        )
        .await
        .unwrap();
    assert_eventually(EVENT_TIMEOUT, || async {
        link_state(&alice, &carol).await == Some(LinkState::Connected)
    })
    .await
    .unwrap();

    assert_eq!(
        alice
            .controller
            .renegotiate(call.room_id().clone())
            .await
            .unwrap(),
        1
    );

    let closed = alice
        .next_event_matching(Duration::from_secs(30), |event| {
            matches!(event, MeshEvent::LinkClosed { .. })
        })
        .await
        .unwrap();
    assert_eq!(
        closed,
        MeshEvent::LinkClosed {
            room_id: call.room_id().clone(),
            remote_id: carol.id.clone(),
            reason: CloseReason::RenegotiationFailed,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_remote_leave_mid_negotiation_drops_late_answer() {
    let call = TestCall::start("negotiation-leave").await.unwrap();
    let carol = TestParticipant::new("carol");
    let (client, mut sub) = raw_join(&call, &carol).await;
    let mut alice = call.participant("alice").await;

    alice.join().await.unwrap();
    let offer = recv_envelope(&mut sub, EventKind::Offer, EVENT_TIMEOUT)
        .await
        .unwrap();

    client
        .publish(
            call.room_id(),
            carol.leave_envelope(call.room_id(), LeaveReason::Voluntary),
        )
        .await
        .unwrap();
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
            remote_id: carol.id.clone(),
            reason: CloseReason::RemoteLeft,
        }
    );
    call.wait_for_presence(&[&alice.id]).await.unwrap();

    // Carol is gone from the roster, so her answer cannot revive the link
    let id = negotiation_id(&offer);
    client
        .publish(
            call.room_id(),
            carol.answer_to(call.room_id(), &alice.id, id.as_deref()),
        )
        .await
        .unwrap();
    assert_never(Duration::from_millis(500), || async {
        link_state(&alice, &carol).await.is_some()
    })
    .await
    .unwrap();
    assert!(!alice
        .engine
        .calls()
        .iter()
        .any(|c| matches!(c, EngineCall::SetRemoteDescription { .. })));
    assert_eq!(alice.engine.close_count(&carol.id), 1);
}
