//! Actor model implementation for the mesh coordinator.
//!
//! ```text
//! MeshController (one per local participant)
//! └── supervises N RoomActors
//!     └── RoomActor (one per joined room)
//!         ├── owns the local roster view and the link table
//!         └── drives the PeerEngine for every link
//!
//! PresenceService (one per relay deployment)
//! └── supervises N PresenceActors
//!     └── PresenceActor (one per served room)
//!         └── owns the authoritative CallSession
//! ```
//!
//! # Key Design Decisions
//!
//! - **One actor per room**: relay envelopes, engine events, deadline scans
//!   and local requests for a room are handled in one serialized loop
//! - **CancellationToken propagation**: parents pass child tokens for graceful shutdown
//! - **Mailbox monitoring**: depth thresholds with metrics (Room/Presence: 100/500, Controller: 50/200)
//! - **Message passing**: all inter-actor communication via `tokio::sync::mpsc` channels
//!
//! # Modules
//!
//! - [`controller`] - `MeshController` that supervises room actors
//! - [`room`] - `RoomActor` per joined room, owns links
//! - [`presence`] - `PresenceService` and per-room `PresenceActor`
//! - [`messages`] - Message and event types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod controller;
pub mod messages;
pub mod metrics;
pub mod presence;
pub mod room;

// Re-export primary types
pub use controller::{MeshController, MeshControllerHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use presence::{PresenceActor, PresenceRoomHandle, PresenceService, PresenceServiceHandle};
pub use room::{RoomActor, RoomActorHandle, RoomContext};
