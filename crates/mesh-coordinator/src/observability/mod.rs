//! Observability for the mesh coordinator.
//!
//! # Privacy by Default
//!
//! Actor loops use `#[instrument(skip_all)]` with explicit fields. SDP bodies
//! and candidate lines are never logged. Metric labels are bounded:
//! - `actor_type`: 3 values (controller, room, presence)
//! - `state`: link states (6 values)
//! - `event`: envelope kinds (7 values)
//! - `direction`: in, out
//! - `outcome` / `reason`: small fixed sets
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `mesh_links_active` | Gauge | none | Non-terminal links across all rooms |
//! | `mesh_link_transitions_total` | Counter | `state` | Link lifecycle transitions |
//! | `mesh_negotiation_timeouts_total` | Counter | `outcome` | Timeouts that retried or gave up |
//! | `mesh_negotiation_duration_seconds` | Histogram | none | Offer-to-connected time |
//! | `mesh_envelopes_total` | Counter | `event`, `direction` | Signaling traffic |
//! | `mesh_envelopes_dropped_total` | Counter | `reason` | Envelopes ignored on receipt |
//! | `mesh_rooms_active` | Gauge | none | Rooms joined locally |
//! | `mesh_presence_roster_size` | Gauge | none | Participants admitted by presence |
//! | `mesh_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `mesh_actor_panics_total` | Counter | `actor_type` | Actor task panics |

pub mod metrics;

pub use metrics::{
    init_metrics_recorder, record_actor_panic, record_envelope, record_envelope_dropped,
    record_link_transition, record_negotiation_duration, record_negotiation_timeout,
    set_actor_mailbox_depth, set_links_active, set_presence_roster_size, set_rooms_active,
};
