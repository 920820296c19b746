//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Live connections and rooms
//! - Local fanout and slow-consumer evictions
//! - Bridge connectivity, publishes and echo suppression
//! - Edit events produced, dropped and applied
//! - Broker connection attempts
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `fanout_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Document ids are never used as labels.
//!
//! # Usage
//!
//! ```rust,no_run
//! use doc_fanout::metrics;
//! use std::time::Duration;
//!
//! metrics::record_local_broadcast(3);
//! metrics::record_edit_applied("applied", Duration::from_millis(4));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Hub
// =============================================================================

/// Record a connection joining a room.
pub fn record_connection_registered() {
    counter!("fanout_connections_registered_total").increment(1);
}

/// Record a connection leaving its room, labelled by why.
pub fn record_connection_closed(reason: &str) {
    counter!("fanout_connections_closed_total", "reason" => reason.to_string()).increment(1);
}

/// Registration refused (shutting down or duplicate id).
pub fn record_registration_rejected(reason: &str) {
    counter!("fanout_registrations_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Set the number of live connections in this process.
pub fn set_active_connections(count: usize) {
    gauge!("fanout_active_connections").set(count as f64);
}

/// Set the number of non-empty rooms in this process.
pub fn set_active_rooms(count: usize) {
    gauge!("fanout_active_rooms").set(count as f64);
}

/// Record one local fanout and how many queues received it.
pub fn record_local_broadcast(recipients: usize) {
    counter!("fanout_local_broadcasts_total").increment(1);
    histogram!("fanout_broadcast_recipients").record(recipients as f64);
}

/// Record a connection dropped because its outbound queue was full.
pub fn record_slow_consumer_evicted() {
    counter!("fanout_slow_consumers_evicted_total").increment(1);
}

// =============================================================================
// Bridge
// =============================================================================

/// Set bridge connectivity (1 = connected, 0 = single-instance mode).
pub fn set_bridge_connected(connected: bool) {
    gauge!("fanout_bridge_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record a channel subscribe/unsubscribe issued to the medium.
pub fn record_bridge_subscription(action: &str) {
    counter!("fanout_bridge_subscriptions_total", "action" => action.to_string()).increment(1);
}

/// Record a publish attempt.
pub fn record_bridge_publish(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("fanout_bridge_publishes_total", "status" => status).increment(1);
}

/// Record an envelope dropped before reaching the medium.
pub fn record_bridge_publish_dropped(reason: &str) {
    counter!("fanout_bridge_publish_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Record an envelope relayed in from another instance.
pub fn record_bridge_received() {
    counter!("fanout_bridge_received_total").increment(1);
}

/// Record an envelope discarded because it originated here.
pub fn record_echo_suppressed() {
    counter!("fanout_bridge_echo_suppressed_total").increment(1);
}

/// Record a bridge message that could not be decoded.
pub fn record_bridge_decode_failure() {
    counter!("fanout_bridge_decode_failures_total").increment(1);
}

// =============================================================================
// Ingestion
// =============================================================================

/// Record an append to the durable log.
pub fn record_edit_produced(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("fanout_edit_events_produced_total", "status" => status).increment(1);
}

/// Record an edit event that never reached the log.
pub fn record_edit_dropped(reason: &str) {
    counter!("fanout_edit_events_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Record the outcome of applying one edit (applied/stale/failed/timeout/undecodable).
pub fn record_edit_applied(outcome: &str, duration: Duration) {
    counter!("fanout_edit_events_consumed_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("fanout_edit_apply_seconds").record(duration.as_secs_f64());
}

/// Set the number of apply workers holding a slot.
pub fn set_apply_workers(count: usize) {
    gauge!("fanout_apply_workers_busy").set(count as f64);
}

/// Record entries read from one partition.
pub fn record_partition_read(partition: u32, count: usize) {
    counter!("fanout_partition_entries_read_total", "partition" => partition.to_string())
        .increment(count as u64);
}

/// Set the number of partitions this consumer currently owns.
pub fn set_owned_partitions(count: usize) {
    gauge!("fanout_owned_partitions").set(count as f64);
}

/// Record a lease change (acquired/lost/released).
pub fn record_partition_lease(action: &str) {
    counter!("fanout_partition_leases_total", "action" => action.to_string()).increment(1);
}

/// Record retries of SQLite statements on busy/locked errors.
pub fn store_retries_total(operation: &str) {
    counter!("fanout_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Connection manager / lifecycle
// =============================================================================

/// Record a broker connection attempt.
pub fn record_broker_connect(component: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("fanout_broker_connects_total", "component" => component.to_string(), "status" => status)
        .increment(1);
}

/// Record an auth collaborator verdict (accepted/rejected/unavailable).
pub fn record_auth(result: &str) {
    counter!("fanout_auth_total", "result" => result.to_string()).increment(1);
}

/// Set service state for a component (gateway/consumer).
pub fn set_service_state(component: &str, state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Connecting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("fanout_service_state", "component" => component.to_string()).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only check that recording without an installed recorder is a no-op.

    #[test]
    fn test_hub_metrics() {
        record_connection_registered();
        record_connection_closed("unregistered");
        record_connection_closed("slow_consumer");
        record_registration_rejected("shutting_down");
        set_active_connections(3);
        set_active_rooms(1);
        record_local_broadcast(2);
        record_slow_consumer_evicted();
    }

    #[test]
    fn test_bridge_metrics() {
        set_bridge_connected(true);
        set_bridge_connected(false);
        record_bridge_subscription("subscribe");
        record_bridge_publish(true);
        record_bridge_publish(false);
        record_bridge_publish_dropped("queue_full");
        record_bridge_received();
        record_echo_suppressed();
        record_bridge_decode_failure();
    }

    #[test]
    fn test_ingest_metrics() {
        record_edit_produced(true);
        record_edit_dropped("queue_full");
        record_edit_applied("stale", Duration::from_micros(300));
        record_partition_read(2, 10);
        set_owned_partitions(3);
        record_partition_lease("acquired");
        store_retries_total("apply_edit");
    }

    #[test]
    fn test_set_service_state_all_states() {
        for state in ["Created", "Connecting", "Running", "ShuttingDown", "Stopped", "Failed", "Unknown"] {
            set_service_state("gateway", state);
        }
        record_broker_connect("producer", false);
        record_auth("rejected");
    }
}
