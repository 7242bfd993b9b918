//! Cluster client configuration.
//!
//! Loaded from `MEDIA_CLUSTER_*` environment variables by applications that
//! embed the client. The NATS token is redacted in Debug output.

use common::config::{BusConfig, DEFAULT_NATS_URL, DEFAULT_ROOT_TOPIC};
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default request/reply timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

/// Default heartbeat timeout in milliseconds (about four missed heartbeats).
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 10_000;

/// Default number of events fetched per backfill request.
pub const DEFAULT_EVENTS_BATCH: u64 = 500;

/// How heartbeat silence demotes a worker.
///
/// A worker that misses `heartbeat_timeout` becomes unhealthy. With
/// `dead_after_unhealthy` set, staying unhealthy for that much longer makes
/// it dead; otherwise only an explicit dead report or a kill does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub heartbeat_timeout: Duration,
    pub dead_after_unhealthy: Option<Duration>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEALTH_TIMEOUT_MS),
            dead_after_unhealthy: None,
        }
    }
}

/// Cluster client configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Root topic shared with the workers.
    pub root_topic: String,

    /// Timeout of every command request.
    pub request_timeout: Duration,

    pub health: HealthPolicy,

    /// Backfill batch size.
    pub events_batch: u64,

    /// Bus connection settings for applications that connect to NATS.
    pub bus: BusConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            root_topic: DEFAULT_ROOT_TOPIC.to_string(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            health: HealthPolicy::default(),
            events_batch: DEFAULT_EVENTS_BATCH,
            bus: BusConfig {
                servers: vec![DEFAULT_NATS_URL.to_string()],
                token: None,
                name: "cluster-client".to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_ms(vars: &HashMap<String, String>, name: &str) -> Result<Option<u64>, ConfigError> {
    match vars.get(name) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(0) => Err(ConfigError::InvalidValue(format!(
                "{name} must be greater than 0"
            ))),
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(ConfigError::InvalidValue(format!("{name}={raw}"))),
        },
    }
}

impl ClusterConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparsable or zero values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparsable or zero values.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let root_topic = vars
            .get("MEDIA_CLUSTER_TOPIC")
            .cloned()
            .unwrap_or(defaults.root_topic);

        let request_timeout = parse_ms(vars, "MEDIA_CLUSTER_REQUEST_TIMEOUT_MS")?
            .map_or(defaults.request_timeout, Duration::from_millis);

        let heartbeat_timeout = parse_ms(vars, "MEDIA_CLUSTER_HEALTH_TIMEOUT_MS")?
            .map_or(defaults.health.heartbeat_timeout, Duration::from_millis);

        let dead_after_unhealthy =
            parse_ms(vars, "MEDIA_CLUSTER_DEAD_AFTER_MS")?.map(Duration::from_millis);

        let events_batch =
            parse_ms(vars, "MEDIA_CLUSTER_EVENTS_BATCH")?.unwrap_or(defaults.events_batch);

        let servers = BusConfig::parse_servers(
            vars.get("MEDIA_CLUSTER_NATS")
                .map_or(DEFAULT_NATS_URL, String::as_str),
        );
        if servers.is_empty() {
            return Err(ConfigError::InvalidValue(
                "MEDIA_CLUSTER_NATS lists no servers".to_string(),
            ));
        }

        Ok(Self {
            root_topic,
            request_timeout,
            health: HealthPolicy {
                heartbeat_timeout,
                dead_after_unhealthy,
            },
            events_batch,
            bus: BusConfig {
                servers,
                token: vars
                    .get("MEDIA_CLUSTER_NATS_TOKEN")
                    .cloned()
                    .map(SecretString::from),
                name: defaults.bus.name,
            },
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.root_topic, "media-cluster");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.health.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(config.health.dead_after_unhealthy, None);
        assert_eq!(config.events_batch, 500);
        assert!(config.bus.token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ClusterConfig::from_vars(&vars(&[
            ("MEDIA_CLUSTER_TOPIC", "calls"),
            ("MEDIA_CLUSTER_REQUEST_TIMEOUT_MS", "250"),
            ("MEDIA_CLUSTER_HEALTH_TIMEOUT_MS", "3000"),
            ("MEDIA_CLUSTER_DEAD_AFTER_MS", "20000"),
            ("MEDIA_CLUSTER_EVENTS_BATCH", "50"),
            ("MEDIA_CLUSTER_NATS", "nats://a:4222,nats://b:4222"),
        ]))
        .unwrap();

        assert_eq!(config.root_topic, "calls");
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.health.heartbeat_timeout, Duration::from_secs(3));
        assert_eq!(
            config.health.dead_after_unhealthy,
            Some(Duration::from_secs(20))
        );
        assert_eq!(config.events_batch, 50);
        assert_eq!(config.bus.servers.len(), 2);
    }

    #[test]
    fn test_rejects_zero_and_garbage() {
        assert!(ClusterConfig::from_vars(&vars(&[("MEDIA_CLUSTER_EVENTS_BATCH", "0")])).is_err());
        assert!(
            ClusterConfig::from_vars(&vars(&[("MEDIA_CLUSTER_HEALTH_TIMEOUT_MS", "soon")]))
                .is_err()
        );
    }

    #[test]
    fn test_token_is_redacted() {
        let config =
            ClusterConfig::from_vars(&vars(&[("MEDIA_CLUSTER_NATS_TOKEN", "hunter2")])).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
    }
}
