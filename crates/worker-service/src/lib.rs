//! Media Worker Service Library
//!
//! Server side of the media cluster. Each worker wraps one media engine and
//! exposes it on the bus:
//!
//! - commands arrive as request/reply on `<root>.<workerId>.commands`
//! - state changes go out as sequenced events on `<root>.<workerId>.events`
//! - heartbeats go out on `<root>.report`
//!
//! # Architecture
//!
//! ```text
//! WorkerPool (one per process)
//! └── Worker (one per engine, respawned on death)
//!     ├── CommandLayer     decode, keyed lock for creates, reply
//!     │   └── WorkerExecutor   authoritative resource maps
//!     │       ├── EventLog     seq-numbered, replayable
//!     │       └── MediaEngine  router/transport/producer/consumer lifecycle
//!     └── heartbeat        periodic alive report, dead report on close
//! ```
//!
//! # Modules
//!
//! - [`commands`] - Idempotent command layer
//! - [`executor`] - Resource maps, change detection, cascading close
//! - [`event_log`] - Append-only event log with batched replay
//! - [`engine`] - Media engine boundary and the loopback engine
//! - [`worker`] - Worker lifecycle and bus tasks
//! - [`pool`] - Supervised worker pool
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Command and engine error types

pub mod commands;
pub mod config;
pub mod engine;
pub mod errors;
pub mod event_log;
pub mod executor;
pub mod heartbeat;
pub mod observability;
pub mod pool;
pub mod worker;
