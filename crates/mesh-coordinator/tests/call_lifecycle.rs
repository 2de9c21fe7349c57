//! Call lifecycle: relay loss and rejoin, media failures, mute, capacity
//! and controller shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use mesh_coordinator::actors::{CloseReason, MeshEvent};
use mesh_coordinator::errors::{MeshError, CAPACITY_EXCEEDED_CODE};
use mesh_coordinator::link::LinkState;
use mesh_coordinator::media::TrackKind;
use mesh_test_utils::{
    assert_eventually, assert_never, MockMedia, MockPeerEngine, TestCall, TestClient, TrackToggle,
};
use signaling_protocol::LeaveReason;
use tokio::sync::broadcast::error::TryRecvError;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Events already delivered to `client`, without waiting.
fn drain_events(client: &mut TestClient) -> Vec<MeshEvent> {
    let mut events = Vec::new();
    loop {
        match client.events.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => return events,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_after_relay_loss_replaces_stale_links() {
    let config = TestCall::test_config(&[("MESH_DISCONNECT_DEBOUNCE_MS", "5000")]).unwrap();
    let call = TestCall::with_config("lifecycle-rejoin", config).await.unwrap();
    let mut alice = call.participant("alice").await;
    let mut bob = call.participant("bob").await;
    let carol = call.participant("carol").await;

    for client in [&alice, &bob, &carol] {
        client.join().await.unwrap();
    }
    call.wait_for_full_mesh(&[&alice, &bob, &carol]).await.unwrap();

    call.drop_connection(&alice.id).await;
    alice
        .next_event_matching(EVENT_TIMEOUT, |event| {
            matches!(event, MeshEvent::CallEnded { .. })
        })
        .await
        .unwrap();

    // The dead session cannot be reused
    assert!(matches!(
        alice.join().await,
        Err(MeshError::RelayDisconnected)
    ));

    alice.reconnect(&call).await.unwrap();
    let snapshot = alice.join().await.unwrap();
    assert_eq!(snapshot.roster.len(), 2);
    assert!(snapshot.link(&bob.id).is_some());
    assert!(snapshot.link(&carol.id).is_some());

    let replaced = bob
        .next_event_matching(EVENT_TIMEOUT, |event| {
            matches!(event, MeshEvent::LinkClosed { .. })
        })
        .await
        .unwrap();
    assert_eq!(
        replaced,
        MeshEvent::LinkClosed {
            room_id: call.room_id().clone(),
            remote_id: alice.id.clone(),
            reason: CloseReason::Replaced,
        }
    );

    call.wait_for_full_mesh(&[&alice, &bob, &carol]).await.unwrap();

    // One roster entry for alice, and the debounce never fires
    tokio::time::sleep(Duration::from_secs(10)).await;
    let state = call
        .presence()
        .room_state(call.room_id().clone())
        .await
        .unwrap();
    assert_eq!(state.roster.len(), 3);
    assert!(state.pending_disconnects.is_empty());
    assert!(!drain_events(&mut bob).iter().any(|event| matches!(
        event,
        MeshEvent::ParticipantLeft { reason: LeaveReason::Disconnected, .. }
    )));

    assert_eq!(bob.engine.close_count(&alice.id), 1);
    assert_eq!(carol.engine.close_count(&alice.id), 1);
    call.wait_for_full_mesh(&[&alice, &bob, &carol]).await.unwrap();
    // Alice joined first, so her only offers are from the rejoin
    assert_eq!(
        alice.engine.offered_to(),
        vec![bob.id.clone(), carol.id.clone()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_device_unavailable_never_enters_call() {
    let call = TestCall::start("lifecycle-device").await.unwrap();
    let bob = call.participant("bob").await;
    bob.join().await.unwrap();

    let alice = call
        .participant_with(
            "alice",
            Arc::new(MockMedia::builder().device_unavailable("camera denied").build()),
            Arc::new(MockPeerEngine::new("alice")),
        )
        .await;

    let result = alice.join().await;
    assert!(matches!(
        result,
        Err(MeshError::DeviceUnavailable(ref reason)) if reason == "camera denied"
    ));

    // Nothing was announced, so nobody else noticed
    assert_never(Duration::from_millis(500), || async {
        call.presence_roster().await.unwrap().len() != 1
    })
    .await
    .unwrap();
    assert!(alice.engine.calls().is_empty());
    assert!(bob.snapshot().await.unwrap().roster.is_empty());

    assert_eventually(EVENT_TIMEOUT, || async {
        alice
            .controller
            .get_status()
            .await
            .is_ok_and(|status| status.rooms.is_empty())
    })
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_mute_toggles_track_without_touching_links() {
    let call = TestCall::start("lifecycle-mute").await.unwrap();
    let alice = call.participant("alice").await;
    let bob = call.participant("bob").await;
    let idle = call.participant("idle").await;

    alice.join().await.unwrap();
    bob.join().await.unwrap();
    call.wait_for_full_mesh(&[&alice, &bob]).await.unwrap();

    let alice_calls = alice.engine.calls().len();
    let bob_calls = bob.engine.calls().len();
    let before = alice.snapshot().await.unwrap().links;

    alice
        .controller
        .set_track_enabled(call.room_id().clone(), TrackKind::Audio, false)
        .await
        .unwrap();
    alice
        .controller
        .set_track_enabled(call.room_id().clone(), TrackKind::Audio, true)
        .await
        .unwrap();

    let handle = alice.media.acquired().into_iter().next().unwrap();
    assert_eq!(
        alice.media.toggles(),
        vec![
            TrackToggle {
                handle,
                track: TrackKind::Audio,
                enabled: false,
            },
            TrackToggle {
                handle,
                track: TrackKind::Audio,
                enabled: true,
            },
        ]
    );

    assert_never(Duration::from_millis(500), || async {
        alice.engine.calls().len() != alice_calls || bob.engine.calls().len() != bob_calls
    })
    .await
    .unwrap();
    assert_eq!(alice.snapshot().await.unwrap().links, before);

    // Muting outside a call is refused
    assert!(matches!(
        idle.controller
            .set_track_enabled(call.room_id().clone(), TrackKind::Video, false)
            .await,
        Err(MeshError::NotInCall(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_full_room_refuses_joiner() {
    let config = TestCall::test_config(&[("MESH_MAX_ROOM_PARTICIPANTS", "2")]).unwrap();
    let call = TestCall::with_config("lifecycle-capacity", config).await.unwrap();
    let alice = call.participant("alice").await;
    let bob = call.participant("bob").await;
    let mut carol = call.participant("carol").await;

    alice.join().await.unwrap();
    bob.join().await.unwrap();
    call.wait_for_full_mesh(&[&alice, &bob]).await.unwrap();

    assert!(matches!(
        carol.join().await,
        Err(MeshError::RoomCapacityExceeded(_))
    ));

    let refusal = carol
        .next_event_matching(EVENT_TIMEOUT, |event| {
            matches!(event, MeshEvent::RemoteError { .. })
        })
        .await
        .unwrap();
    assert!(matches!(
        refusal,
        MeshEvent::RemoteError { code, .. } if code == CAPACITY_EXCEEDED_CODE
    ));
    assert_eq!(carol.media.live_count(), 0);
    assert!(carol.engine.calls().is_empty());

    // The incumbents drop the refused joiner again
    call.wait_for_presence(&[&alice.id, &bob.id]).await.unwrap();
    call.wait_for_full_mesh(&[&alice, &bob]).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_leave_then_rejoin_builds_fresh_links() {
    let call = TestCall::start("lifecycle-leave-rejoin").await.unwrap();
    let alice = call.participant("alice").await;
    let mut bob = call.participant("bob").await;

    alice.join().await.unwrap();
    bob.join().await.unwrap();
    call.wait_for_full_mesh(&[&alice, &bob]).await.unwrap();

    alice.leave().await.unwrap();
    let left = bob
        .next_event_matching(EVENT_TIMEOUT, |event| {
            matches!(event, MeshEvent::ParticipantLeft { .. })
        })
        .await
        .unwrap();
    assert!(matches!(
        left,
        MeshEvent::ParticipantLeft { reason: LeaveReason::Voluntary, .. }
    ));
    assert!(matches!(alice.leave().await, Err(MeshError::NotInCall(_))));

    let snapshot = alice.join().await.unwrap();
    assert_eq!(
        snapshot.link(&bob.id).map(|link| link.state),
        Some(LinkState::Offering)
    );
    call.wait_for_full_mesh(&[&alice, &bob]).await.unwrap();

    // The rejoiner is now the newcomer and offers
    assert_eq!(alice.engine.offered_to(), vec![bob.id.clone()]);
    assert_eq!(bob.engine.close_count(&alice.id), 1);
    assert_eq!(alice.media.acquired().len(), 2);
    assert_eq!(alice.media.live_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_controller_shutdown_leaves_call() {
    let call = TestCall::start("lifecycle-shutdown").await.unwrap();
    let alice = call.participant("alice").await;
    let mut bob = call.participant("bob").await;

    alice.join().await.unwrap();
    bob.join().await.unwrap();
    call.wait_for_full_mesh(&[&alice, &bob]).await.unwrap();

    alice
        .controller
        .shutdown(Duration::from_secs(5))
        .await
        .unwrap();

    let closed = bob
        .next_event_matching(EVENT_TIMEOUT, |event| {
            matches!(event, MeshEvent::LinkClosed { .. })
        })
        .await
        .unwrap();
    assert!(matches!(
        closed,
        MeshEvent::LinkClosed { remote_id, reason: CloseReason::RemoteLeft, .. }
            if remote_id == alice.id
    ));

    call.wait_for_presence(&[&bob.id]).await.unwrap();
    assert_eventually(EVENT_TIMEOUT, || async {
        alice.media.live_count() == 0 && alice.engine.open_count() == 0
    })
    .await
    .unwrap();
    assert!(alice.join().await.is_err());
}
