//! Bus connection configuration shared by workers and clients.

use crate::secret::{ExposeSecret, SecretString};

/// Default root topic under which all cluster traffic is published.
pub const DEFAULT_ROOT_TOPIC: &str = "media-cluster";

/// Default NATS server URL.
pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";

/// Message bus connection settings.
#[derive(Clone)]
pub struct BusConfig {
    /// NATS server URLs.
    pub servers: Vec<String>,

    /// Optional token for NATS authentication.
    pub token: Option<SecretString>,

    /// Client connection name reported to the server.
    pub name: String,
}

impl BusConfig {
    /// Parse a comma-separated server list, dropping empty entries.
    #[must_use]
    pub fn parse_servers(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    /// Servers joined back into the comma list accepted by the NATS client.
    #[must_use]
    pub fn server_list(&self) -> String {
        self.servers.join(",")
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_NATS_URL.to_string()],
            token: None,
            name: "media-cluster".to_string(),
        }
    }
}

impl std::fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConfig")
            .field("servers", &self.servers)
            .field(
                "token",
                &self
                    .token
                    .as_ref()
                    .map(|t| if t.expose_secret().is_empty() { "" } else { "[REDACTED]" }),
            )
            .field("name", &self.name)
            .finish()
    }
}
