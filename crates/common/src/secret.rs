//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports from the [`secrecy`] crate. Bus credentials (the NATS token in
//! particular) travel through configuration structs that derive or implement
//! `Debug`, and those structs end up in startup logs. Wrapping the value in
//! `SecretString` keeps it out of `{:?}` output and out of `tracing` fields.
//!
//! Secrets are zeroized when dropped.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct NatsCredentials {
//!     server: String,
//!     token: SecretString,
//! }
//!
//! let creds = NatsCredentials {
//!     server: "nats://127.0.0.1:4222".to_string(),
//!     token: SecretString::from("hunter2"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("hunter2"));
//!
//! // Reading the value is always explicit.
//! let token: &str = creds.token.expose_secret();
//! assert_eq!(token, "hunter2");
//! ```

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("hunter2");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_deserialize_token_from_json() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct BusCredentials {
            server: String,
            token: SecretString,
        }

        let json = r#"{"server": "nats://bus:4222", "token": "bus-token-value"}"#;
        let creds: BusCredentials = serde_json::from_str(json).expect("deserialize");

        assert_eq!(creds.token.expose_secret(), "bus-token-value");

        let debug = format!("{creds:?}");
        assert!(debug.contains("nats://bus:4222"));
        assert!(!debug.contains("bus-token-value"));
    }
}
