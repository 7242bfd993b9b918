//! Observability for the worker service.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `worker_commands_total` | Counter | `command`, `status` | Commands handled |
//! | `worker_command_duration_seconds` | Histogram | `command` | Command latency |
//! | `worker_command_replays_total` | Counter | `command` | Creates answered by repeat key |
//! | `worker_events_total` | Counter | `kind` | Events appended to the log |
//! | `worker_event_publish_failures_total` | Counter | none | Live publishes lost |
//! | `worker_pool_alive` | Gauge | none | Workers currently alive |
//! | `worker_respawns_total` | Counter | `reason` | Workers replaced |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
