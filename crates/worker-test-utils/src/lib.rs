//! # Worker Test Utilities
//!
//! Shared test utilities for the media worker cluster.
//!
//! ## Modules
//!
//! - `server_harness` - In-process worker pool on an in-memory bus
//! - `lossy_bus` - Bus wrapper that drops, duplicates and reorders messages
//! - `fixtures` - Codecs, RTP parameters and command arguments
//! - `assertions` - Eventual-consistency assertion helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use worker_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let cluster = TestCluster::spawn(2).await;
//!
//!     // Point a client at cluster.bus() and cluster.root_topic()
//!
//!     cluster.close().await;
//! }
//! ```

pub mod assertions;
pub mod fixtures;
pub mod lossy_bus;
pub mod server_harness;

pub use assertions::assert_eventually;
pub use lossy_bus::LossyBus;
pub use server_harness::TestCluster;
