//! Metrics definitions for the worker service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `worker_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! - `command`: bounded by the wire command set (24 values)
//! - `status`: success plus the `CommandError` labels (6 values)
//! - `kind`: bounded by event types (6 values)
//! - `reason`: bounded respawn reasons (2 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Command handling is in-memory plus one engine call
        .set_buckets_for_metric(
            Matcher::Prefix("worker_command".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set command duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Command Metrics
// ============================================================================

/// Record a handled command.
///
/// Metrics: `worker_commands_total`, `worker_command_duration_seconds`
/// Labels: `command`, `status` (counter); `command` (histogram)
pub fn record_command(command: &str, status: &'static str, duration: Duration) {
    counter!(
        "worker_commands_total",
        "command" => command.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("worker_command_duration_seconds", "command" => command.to_string())
        .record(duration.as_secs_f64());
}

/// Record a create command answered from the repeat-key registry.
///
/// Metric: `worker_command_replays_total`
/// Labels: `command`
pub fn record_replay(command: &str) {
    counter!("worker_command_replays_total", "command" => command.to_string()).increment(1);
}

// ============================================================================
// Event Metrics
// ============================================================================

/// Record an event appended to the log.
///
/// Metric: `worker_events_total`
/// Labels: `kind`
pub fn record_event(kind: &'static str) {
    counter!("worker_events_total", "kind" => kind).increment(1);
}

/// Record a live event publish that failed on the bus.
///
/// Metric: `worker_event_publish_failures_total`
pub fn record_event_publish_failure() {
    counter!("worker_event_publish_failures_total").increment(1);
}

// ============================================================================
// Pool Metrics
// ============================================================================

/// Set the number of workers currently alive in the pool.
///
/// Metric: `worker_pool_alive`
pub fn set_pool_alive(count: usize) {
    // usize to f64 conversion is safe for realistic pool sizes
    #[allow(clippy::cast_precision_loss)]
    gauge!("worker_pool_alive").set(count as f64);
}

/// Record a worker being replaced after it stopped.
///
/// Metric: `worker_respawns_total`
/// Labels: `reason` (engine_died, killed)
pub fn record_worker_respawn(reason: &'static str) {
    counter!("worker_respawns_total", "reason" => reason).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::DebuggingRecorder;

    #[test]
    fn test_record_functions_without_recorder() {
        record_command("router-create", "success", Duration::from_millis(2));
        record_command("router-close", "not_found", Duration::from_micros(300));
        record_replay("router-create");
        record_event("state-router");
        record_event_publish_failure();
        set_pool_alive(4);
        record_worker_respawn("engine_died");
    }

    #[test]
    fn test_metrics_are_captured_by_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_command("produce-create", "success", Duration::from_millis(1));
            record_replay("produce-create");
            record_event("state-producer");
            set_pool_alive(2);
            record_worker_respawn("killed");
        });

        let names: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "worker_commands_total",
            "worker_command_duration_seconds",
            "worker_command_replays_total",
            "worker_events_total",
            "worker_pool_alive",
            "worker_respawns_total",
        ] {
            assert!(
                names.iter().any(|n| n == expected),
                "missing metric {expected}, got {names:?}"
            );
        }
    }
}
