//! Common error types for the media cluster bus.

use thiserror::Error;

/// Errors raised by a [`Bus`](crate::bus::Bus) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Request did not receive a reply before the deadline
    #[error("Request timed out")]
    Timeout,

    /// Nobody is subscribed to the request topic
    #[error("No responders for topic")]
    NoResponders,

    /// The bus connection has been closed
    #[error("Bus closed")]
    Closed,

    /// Underlying transport failure
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type alias using `BusError`
pub type Result<T> = std::result::Result<T, BusError>;
