//! Mesh Coordinator
//!
//! Runs a full call in-process: one presence service and N local
//! participants on a shared relay bus, each with loopback media and a
//! loopback peer engine. Participants join one after another, the mesh is
//! built, and the process waits for a shutdown signal before everyone leaves.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Start the relay bus and the presence service for the demo room
//! 4. Start one `MeshController` per participant and join sequentially
//! 5. Wait for the mesh to complete
//! 6. Wait for shutdown signal (skipped with `MESH_DEMO_EXIT=true`)
//! 7. Leave, shut controllers down, stop presence

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::sync::Arc;
use std::time::Duration;

use common::config::ObservabilityConfig;
use common::types::{ParticipantId, RoomId};
use mesh_coordinator::actors::{ActorMetrics, MeshControllerHandle, PresenceServiceHandle};
use mesh_coordinator::config::Config;
use mesh_coordinator::errors::MeshError;
use mesh_coordinator::media::{LoopbackEngine, LoopbackMedia};
use mesh_coordinator::observability::init_metrics_recorder;
use mesh_coordinator::relay::RelayBus;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on waiting for every link to connect.
const MESH_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline handed to each controller on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();
    let observability = ObservabilityConfig {
        json_logs: config.as_ref().is_ok_and(|c| c.log_json),
        ..ObservabilityConfig::default()
    };
    let log_json = observability.json_logs;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| observability.log_filter.as_str().into()),
        )
        .with(log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!log_json).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting Mesh Coordinator");

    let config = Arc::new(config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?);

    info!(
        instance_id = %config.instance_id,
        demo_room = %config.demo_room,
        demo_participants = config.demo_participants,
        negotiation_timeout_ms = u64::try_from(config.negotiation_timeout.as_millis()).unwrap_or(u64::MAX),
        negotiation_retries = config.negotiation_retries,
        disconnect_debounce_ms = u64::try_from(config.disconnect_debounce.as_millis()).unwrap_or(u64::MAX),
        max_room_participants = config.max_room_participants,
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let metrics = ActorMetrics::new();
    let bus = RelayBus::new();
    let room_id = RoomId::new(config.demo_room.clone());

    let presence_relay = bus.connect(config.presence_id.clone()).await;
    let presence = PresenceServiceHandle::new(
        Arc::clone(&config),
        Arc::new(presence_relay),
        Arc::clone(&metrics),
    );
    presence.open_room(room_id.clone()).await?;
    info!(room_id = %room_id, "Presence serving room");

    let mut controllers = Vec::with_capacity(config.demo_participants);
    for index in 1..=config.demo_participants {
        let participant_id = ParticipantId::new(format!("{}-p{index}", config.instance_id));
        let relay = bus.connect(participant_id.clone()).await;
        let controller = MeshControllerHandle::new(
            Arc::clone(&config),
            Arc::new(relay),
            Arc::new(LoopbackMedia::new()),
            Arc::new(LoopbackEngine::new(participant_id.clone())),
            Arc::clone(&metrics),
        );

        let snapshot = controller
            .join_room(room_id.clone(), format!("Participant {index}"))
            .await
            .map_err(|e| {
                error!(participant_id = %participant_id, error = %e, "Join failed");
                e
            })?;
        info!(
            participant_id = %participant_id,
            existing = snapshot.roster.len(),
            offers = snapshot.links.len(),
            "Participant joined"
        );
        controllers.push(controller);
    }

    match tokio::time::timeout(MESH_WAIT_TIMEOUT, wait_for_mesh(&controllers, &room_id)).await {
        Ok(Ok(())) => {
            info!(
                room_id = %room_id,
                participants = controllers.len(),
                links = metrics.link_count(),
                "Full mesh established"
            );
        }
        Ok(Err(e)) => warn!(error = %e, "Mesh check failed"),
        Err(_) => warn!(
            timeout_secs = MESH_WAIT_TIMEOUT.as_secs(),
            links = metrics.link_count(),
            "Mesh incomplete after timeout"
        ),
    }

    if config.demo_exit {
        info!("Demo exit requested, leaving now");
    } else {
        info!("Mesh running, waiting for shutdown signal");
        shutdown_signal().await;
        info!("Shutdown signal received, initiating graceful shutdown...");
    }

    for controller in &controllers {
        if let Err(e) = controller.leave_room(room_id.clone()).await {
            warn!(
                participant_id = %controller.participant_id(),
                error = %e,
                "Leave failed"
            );
        }
        if let Err(e) = controller.shutdown(SHUTDOWN_DEADLINE).await {
            warn!(
                participant_id = %controller.participant_id(),
                error = %e,
                "Controller shutdown error"
            );
        }
    }

    presence.cancel();

    info!(
        metrics = %prometheus_handle.render(),
        "Final metrics"
    );
    info!("Mesh Coordinator shutdown complete");
    Ok(())
}

/// Poll every controller until each sees a fully connected mesh.
async fn wait_for_mesh(
    controllers: &[MeshControllerHandle],
    room_id: &RoomId,
) -> Result<(), MeshError> {
    let expected = controllers.len().saturating_sub(1);
    loop {
        let mut complete = true;
        for controller in controllers {
            let snapshot = controller.room_snapshot(room_id.clone()).await?;
            if snapshot.connected_count() != expected || !snapshot.is_fully_meshed() {
                complete = false;
                break;
            }
        }
        if complete {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
