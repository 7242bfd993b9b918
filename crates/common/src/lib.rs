//! Common utilities and types shared by media cluster workers and clients.
//!
//! Both sides of the cluster speak the same wire protocol over the same bus,
//! so everything they agree on lives here:
//!
//! ```text
//! common
//! ├── wire      - JSON wire types (commands, replies, events, reports, states)
//! ├── bus       - Bus trait, in-process MemoryBus, NATS adapter, topic names
//! ├── lock      - AsyncLock / AsyncLockMap (FIFO, keyed)
//! ├── backoff   - Unbounded exponential backoff with jitter
//! ├── clock     - Strictly increasing millisecond clock
//! ├── config    - Bus connection configuration
//! ├── types     - Ids and application metadata
//! ├── secret    - Secret wrappers
//! └── error     - Bus error type
//! ```

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for common data types
pub mod types;

/// Module for bus connection configuration
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for the JSON wire protocol
pub mod wire;

/// Module for the message bus abstraction
pub mod bus;

/// Module for the keyed async lock
pub mod lock;

/// Module for retry backoff
pub mod backoff;

/// Module for the monotonic version clock
pub mod clock;
