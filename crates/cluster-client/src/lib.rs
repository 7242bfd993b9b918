//! Media Cluster Client Library
//!
//! Client side of the media cluster. Tracks which workers are alive from
//! their heartbeats, keeps an ordered and gapless mirror of every worker's
//! resources from its event stream, and sends commands.
//!
//! # Architecture
//!
//! ```text
//! Cluster (heartbeats on <root>.report)
//! └── Worker (one per worker id; Healthy / Unhealthy / Dead)
//!     ├── WorkerApi     typed request/reply on <root>.<workerId>.commands
//!     ├── reconciler    baseline + live events + backfill, in seq order
//!     └── WorkerModel   mirrored resources keyed by id
//!         └── Router → WebRtc/Plain/Pipe transport → Producer / Consumer
//! ```
//!
//! Closing a resource (or killing a worker) takes effect locally at once,
//! cascades to its descendants, and is confirmed with the worker in the
//! background.
//!
//! # Modules
//!
//! - [`cluster`] - Membership and health tracking
//! - [`model`] - Mirrored resource handles
//! - [`reconciler`] - Ordered event delivery with gap backfill
//! - [`api`] - Typed command calls
//! - [`config`] - Client configuration from environment
//! - [`errors`] - Client error type

pub mod api;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod model;
pub mod reconciler;

pub use cluster::Cluster;
pub use config::{ClusterConfig, HealthPolicy};
pub use errors::ClientError;
pub use model::{
    Consumer, PipeTransport, PlainTransport, Producer, Router, Transport, WebRtcTransport, Worker,
    WorkerStatus,
};
