//! Metric definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `mesh_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return its handle.
///
/// Must be called before any metric is recorded. Negotiation buckets span the
/// default 10s timeout.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("mesh_negotiation".to_string()),
            &[
                0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000, 20.000,
            ],
        )
        .map_err(|e| format!("Failed to set negotiation buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Link Metrics
// ============================================================================

/// Set the number of non-terminal links.
///
/// Metric: `mesh_links_active`
pub fn set_links_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("mesh_links_active").set(count as f64);
}

/// Record a link entering `state`.
///
/// Metric: `mesh_link_transitions_total`
/// Labels: `state` (idle, offering, answering, connected, closed, failed)
pub fn record_link_transition(state: &'static str) {
    counter!("mesh_link_transitions_total", "state" => state).increment(1);
}

/// Record a negotiation timeout.
///
/// Metric: `mesh_negotiation_timeouts_total`
/// Labels: `outcome` (retried, failed, renegotiation)
pub fn record_negotiation_timeout(outcome: &'static str) {
    counter!("mesh_negotiation_timeouts_total", "outcome" => outcome).increment(1);
}

/// Record time from first offer to a connected link.
///
/// Metric: `mesh_negotiation_duration_seconds`
pub fn record_negotiation_duration(duration: Duration) {
    histogram!("mesh_negotiation_duration_seconds").record(duration.as_secs_f64());
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record an envelope sent or received.
///
/// Metric: `mesh_envelopes_total`
/// Labels: `event` (wire event name), `direction` (in, out)
pub fn record_envelope(event: &'static str, direction: &'static str) {
    counter!("mesh_envelopes_total", "event" => event, "direction" => direction).increment(1);
}

/// Record an inbound envelope that was ignored.
///
/// Metric: `mesh_envelopes_dropped_total`
/// Labels: `reason` (unknown_sender, no_link, not_in_call, stale_answer)
pub fn record_envelope_dropped(reason: &'static str) {
    counter!("mesh_envelopes_dropped_total", "reason" => reason).increment(1);
}

// ============================================================================
// Room & Presence Metrics
// ============================================================================

/// Set the number of rooms joined locally.
///
/// Metric: `mesh_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("mesh_rooms_active").set(count as f64);
}

/// Set the number of participants admitted by presence across all rooms.
///
/// Metric: `mesh_presence_roster_size`
pub fn set_presence_roster_size(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("mesh_presence_roster_size").set(count as f64);
}

// ============================================================================
// Actor Metrics
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `mesh_actor_mailbox_depth`
/// Labels: `actor_type` (controller, room, presence)
pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("mesh_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

/// Record an actor panic.
///
/// Metric: `mesh_actor_panics_total`
/// Labels: `actor_type`
///
/// Any non-zero value is a bug.
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("mesh_actor_panics_total", "actor_type" => actor_type).increment(1);
}
