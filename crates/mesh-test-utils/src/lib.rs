//! # Mesh Test Utilities
//!
//! Shared test utilities for the mesh coordinator.
//!
//! This crate provides mock collaborators, fixtures and an in-process call
//! harness for testing the coordinator without real media devices or a real
//! relay transport.
//!
//! ## Modules
//!
//! - `mock_media` - Mock local media that records every call
//! - `mock_engine` - Mock peer engine that trickles numbered candidates
//! - `fixtures` - Participants and hand-built envelopes
//! - `harness` - `TestCall` with presence and real controllers on one bus
//! - `eventual` - Polling assertions for asynchronous convergence
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mesh_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let call = TestCall::start("room-1").await?;
//!     let alice = call.participant("alice").await;
//!     let bob = call.participant("bob").await;
//!
//!     alice.join().await?;
//!     bob.join().await?;
//!     call.wait_for_full_mesh(&[&alice, &bob]).await?;
//!
//!     // Bob joined last, so Bob offered
//!     assert_eq!(bob.engine.offered_to(), vec![alice.id.clone()]);
//!     Ok(())
//! }
//! ```
//!
//! ## Test Patterns
//!
//! ### Acting as a remote peer
//!
//! ```rust,ignore
//! let carol = TestParticipant::new("carol");
//! let (client, mut sub) = call.raw_client(&carol).await?;
//! client.publish(call.room_id(), carol.join_envelope(call.room_id())).await?;
//! ```
//!
//! ### Failing collaborators
//!
//! ```rust,ignore
//! let media = Arc::new(MockMedia::builder().device_unavailable("denied").build());
//! let engine = Arc::new(MockPeerEngine::new("alice"));
//! let alice = call.participant_with("alice", media, engine).await;
//! assert!(matches!(alice.join().await, Err(MeshError::DeviceUnavailable(_))));
//! ```

pub mod eventual;
pub mod fixtures;
pub mod harness;
pub mod mock_engine;
pub mod mock_media;

// Re-export commonly used items
pub use eventual::*;
pub use fixtures::*;
pub use harness::*;
pub use mock_engine::*;
pub use mock_media::*;
