//! Worker service error types.
//!
//! Every command failure is answered on the bus as
//! `{response: "error", message}`. The wire message is deliberately terse
//! and stable (clients match on it); the `Display` text carries the ids for
//! server-side logs.

use common::wire::commands::DecodeError;
use thiserror::Error;

/// Failure of a single inbound command.
///
/// Maps to wire messages:
/// - `NotFound`: `Unable to find <kind>`
/// - `AlreadyClosed`: `<What> closed`
/// - `Malformed`: `Malformed command: <detail>`
/// - `UnknownCommand`: `Unknown command: <type>`
/// - `Unknown`: engine text as-is
#[derive(Debug, Error)]
pub enum CommandError {
    /// Operand id is not known to this worker.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The operand's parent is closed, so the operation is meaningless.
    #[error("{0} closed")]
    AlreadyClosed(&'static str),

    /// Payload failed schema validation.
    #[error("Malformed command: {0}")]
    Malformed(String),

    /// Well-formed box with a command type this worker does not implement.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Engine-level failure, original message preserved.
    #[error("{0}")]
    Unknown(String),
}

impl CommandError {
    pub fn not_found(kind: &'static str, id: &str) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Message sent to the client in the error reply.
    #[must_use]
    pub fn wire_message(&self) -> String {
        match self {
            Self::NotFound { kind, .. } => format!("Unable to find {kind}"),
            Self::AlreadyClosed(_)
            | Self::Malformed(_)
            | Self::UnknownCommand(_)
            | Self::Unknown(_) => self.to_string(),
        }
    }

    /// Bounded label for the `status` metric dimension.
    #[must_use]
    pub fn status_label(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyClosed(_) => "already_closed",
            Self::Malformed(_) => "malformed",
            Self::UnknownCommand(_) => "unknown_command",
            Self::Unknown(_) => "engine_error",
        }
    }
}

impl From<DecodeError> for CommandError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownCommand(tag) => Self::UnknownCommand(tag),
            DecodeError::Malformed(detail) => Self::Malformed(detail),
        }
    }
}

/// Failure reported by a [`MediaEngine`](crate::engine::MediaEngine).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine rejected or failed the operation.
    #[error("{0}")]
    Failed(String),

    /// The engine has shut down.
    #[error("Engine closed")]
    Closed,

    /// No free port left in the configured range.
    #[error("No free port in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },
}

impl From<EngineError> for CommandError {
    fn from(err: EngineError) -> Self {
        Self::Unknown(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_mapping() {
        assert_eq!(
            CommandError::not_found("router", "abc").wire_message(),
            "Unable to find router"
        );
        assert_eq!(
            CommandError::AlreadyClosed("Transport").wire_message(),
            "Transport closed"
        );
        assert_eq!(
            CommandError::Malformed("missing field `args`".to_string()).wire_message(),
            "Malformed command: missing field `args`"
        );
        assert_eq!(
            CommandError::UnknownCommand("router-explode".to_string()).wire_message(),
            "Unknown command: router-explode"
        );
        assert_eq!(
            CommandError::from(EngineError::Failed("codec not supported".to_string()))
                .wire_message(),
            "codec not supported"
        );
    }

    #[test]
    fn test_display_keeps_ids_for_logs() {
        let err = CommandError::not_found("producer", "p-123");
        assert_eq!(err.to_string(), "producer not found: p-123");
    }

    #[test]
    fn test_status_labels_are_bounded() {
        let labels = [
            CommandError::not_found("router", "x").status_label(),
            CommandError::AlreadyClosed("Router").status_label(),
            CommandError::Malformed(String::new()).status_label(),
            CommandError::UnknownCommand(String::new()).status_label(),
            CommandError::Unknown(String::new()).status_label(),
        ];
        assert_eq!(
            labels,
            [
                "not_found",
                "already_closed",
                "malformed",
                "unknown_command",
                "engine_error"
            ]
        );
    }

    #[test]
    fn test_decode_error_conversion() {
        let err: CommandError = DecodeError::UnknownCommand("x".to_string()).into();
        assert!(matches!(err, CommandError::UnknownCommand(_)));

        let err: CommandError = DecodeError::Malformed("bad".to_string()).into();
        assert!(matches!(err, CommandError::Malformed(_)));
    }
}
