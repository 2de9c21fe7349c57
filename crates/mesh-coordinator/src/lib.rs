//! Mesh Coordinator Library
//!
//! Signaling and link coordination for small multi-party calls where every
//! participant holds a direct peer connection to every other participant:
//!
//! - Presence: the authoritative roster of each room, with debounced
//!   removal of participants whose transport dropped
//! - Mesh coordination: one link per remote participant, offered by the
//!   newcomer and answered by the incumbent
//! - Negotiation: offer/answer exchange, trickled candidates queued until
//!   the remote description is applied, timeouts with one retry
//! - Teardown: leave, remote leave, relay loss and shutdown all close
//!   every affected link exactly once
//!
//! # Architecture
//!
//! ```text
//! MeshController (one per local participant)
//! └── RoomActor (one per joined room) ── PeerEngine, LocalMedia
//!
//! PresenceService
//! └── PresenceActor (one per served room)
//!
//!            all actors exchange SignalingEnvelopes over a Relay
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types with signaling error codes
//! - [`link`] - Per-remote link state machine
//! - [`media`] - Local media and peer engine collaborators, with loopback drivers
//! - [`observability`] - Prometheus metrics
//! - [`presence`] - Roster bookkeeping
//! - [`relay`] - Room-scoped publish/subscribe relay and the in-process bus

pub mod actors;
pub mod config;
pub mod errors;
pub mod link;
pub mod media;
pub mod observability;
pub mod presence;
pub mod relay;
