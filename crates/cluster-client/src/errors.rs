//! Cluster client error types.
//!
//! Failures surface only on create, connect and query paths. Close and kill
//! always succeed locally and confirm with the worker in the background.

use common::error::BusError;
use thiserror::Error;

/// Cluster client error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The worker answered with an error reply. The message is the worker's
    /// text, unchanged.
    #[error("{0}")]
    Remote(String),

    /// The reply was missing or could not be decoded.
    #[error("Unknown error")]
    Unknown,

    /// No reply within the request timeout.
    #[error("Request timed out")]
    Timeout,

    /// The bus refused the request.
    #[error("Bus error: {0}")]
    Bus(String),

    /// The resource (or its parent) was already closed locally.
    #[error("{0} already closed")]
    AlreadyClosed(&'static str),

    /// The owning worker is dead.
    #[error("Worker {0} is dead")]
    WorkerDead(String),

    /// The command could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<BusError> for ClientError {
    fn from(error: BusError) -> Self {
        match error {
            BusError::Timeout => Self::Timeout,
            other => Self::Bus(other.to_string()),
        }
    }
}
