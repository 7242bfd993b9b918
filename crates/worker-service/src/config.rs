//! Worker service configuration.
//!
//! Configuration is loaded from `MEDIA_WORKER_*` environment variables.
//! The NATS token is redacted in Debug output and never copied into the
//! worker's advertised application data.

use common::config::{BusConfig, DEFAULT_NATS_URL, DEFAULT_ROOT_TOPIC};
use common::secret::SecretString;
use common::types::{SimpleMap, SimpleValue};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by every worker variable.
pub const ENV_PREFIX: &str = "MEDIA_WORKER_";

/// Default listen address for media ports.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default address announced in ICE candidates and tuples.
pub const DEFAULT_ANNOUNCE_IP: &str = "127.0.0.1";

/// Default lowest media port.
pub const DEFAULT_MIN_PORT: u16 = 10000;

/// Default highest media port.
pub const DEFAULT_MAX_PORT: u16 = 59999;

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default heartbeat interval in milliseconds.
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 2500;

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8090";

const TOKEN_VAR: &str = "MEDIA_WORKER_NATS_TOKEN";

/// Worker service configuration.
#[derive(Clone)]
pub struct Config {
    /// Number of workers in the pool (default: available parallelism).
    pub worker_count: usize,

    /// Address media sockets bind to.
    pub listen_ip: String,

    /// Address advertised to remote peers.
    pub announce_ip: String,

    /// Media port range, inclusive.
    pub min_port: u16,
    pub max_port: u16,

    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Root topic for all cluster traffic.
    pub root_topic: String,

    /// Bus connection settings. The token is a `SecretString`.
    pub bus: BusConfig,

    /// Heartbeat interval.
    pub report_interval: Duration,

    /// Health endpoint bind address (default: "0.0.0.0:8090").
    pub health_bind_address: String,

    /// Extra `MEDIA_WORKER_*` variables, camel-cased, forwarded as appData.
    pub extra_app_data: SimpleMap,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("worker_count", &self.worker_count)
            .field("listen_ip", &self.listen_ip)
            .field("announce_ip", &self.announce_ip)
            .field("min_port", &self.min_port)
            .field("max_port", &self.max_port)
            .field("log_level", &self.log_level)
            .field("root_topic", &self.root_topic)
            .field("bus", &self.bus)
            .field("report_interval", &self.report_interval)
            .field("health_bind_address", &self.health_bind_address)
            .field("extra_app_data", &self.extra_app_data)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// `MEDIA_WORKER_SOME_NAME` -> `someName`.
fn camel_case(var: &str) -> String {
    let mut out = String::new();
    for (i, word) in var.split('_').filter(|w| !w.is_empty()).enumerate() {
        let lower = word.to_ascii_lowercase();
        if i == 0 {
            out.push_str(&lower);
        } else {
            let mut chars = lower.chars();
            if let Some(first) = chars.next() {
                out.push(first.to_ascii_uppercase());
                out.push_str(chars.as_str());
            }
        }
    }
    out
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
    }
}

// Variables with a dedicated field; everything else is forwarded as appData.
const KNOWN_VARS: &[&str] = &[
    "MEDIA_WORKER_COUNT",
    "MEDIA_WORKER_LISTEN_IP",
    "MEDIA_WORKER_ANNOUNCE_IP",
    "MEDIA_WORKER_MIN_PORT",
    "MEDIA_WORKER_MAX_PORT",
    "MEDIA_WORKER_LOG_LEVEL",
    "MEDIA_WORKER_TOPIC",
    "MEDIA_WORKER_NATS",
    TOKEN_VAR,
    "MEDIA_WORKER_REPORT_INTERVAL_MS",
    "MEDIA_WORKER_HEALTH_BIND_ADDRESS",
];

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparsable or inconsistent
    /// values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparsable or inconsistent
    /// values.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let default_count = std::thread::available_parallelism().map_or(1, usize::from);
        let worker_count = parse_var(vars, "MEDIA_WORKER_COUNT", default_count)?;
        if worker_count == 0 {
            return Err(ConfigError::InvalidValue(
                "MEDIA_WORKER_COUNT must be at least 1".to_string(),
            ));
        }

        let listen_ip = vars
            .get("MEDIA_WORKER_LISTEN_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LISTEN_IP.to_string());

        let announce_ip = vars
            .get("MEDIA_WORKER_ANNOUNCE_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ANNOUNCE_IP.to_string());

        let min_port = parse_var(vars, "MEDIA_WORKER_MIN_PORT", DEFAULT_MIN_PORT)?;
        let max_port = parse_var(vars, "MEDIA_WORKER_MAX_PORT", DEFAULT_MAX_PORT)?;
        if min_port > max_port {
            return Err(ConfigError::InvalidValue(format!(
                "MEDIA_WORKER_MIN_PORT ({min_port}) exceeds MEDIA_WORKER_MAX_PORT ({max_port})"
            )));
        }

        let log_level = vars
            .get("MEDIA_WORKER_LOG_LEVEL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        let root_topic = vars
            .get("MEDIA_WORKER_TOPIC")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ROOT_TOPIC.to_string());

        let servers = BusConfig::parse_servers(
            vars.get("MEDIA_WORKER_NATS")
                .map_or(DEFAULT_NATS_URL, String::as_str),
        );
        if servers.is_empty() {
            return Err(ConfigError::InvalidValue(
                "MEDIA_WORKER_NATS lists no servers".to_string(),
            ));
        }
        let bus = BusConfig {
            servers,
            token: vars.get(TOKEN_VAR).cloned().map(SecretString::from),
            name: format!("worker-service-{}", std::process::id()),
        };

        let report_interval_ms = parse_var(
            vars,
            "MEDIA_WORKER_REPORT_INTERVAL_MS",
            DEFAULT_REPORT_INTERVAL_MS,
        )?;
        if report_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "MEDIA_WORKER_REPORT_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }

        let health_bind_address = vars
            .get("MEDIA_WORKER_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let extra_app_data = vars
            .iter()
            .filter(|(name, _)| name.starts_with(ENV_PREFIX) && !KNOWN_VARS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                let suffix = name.strip_prefix(ENV_PREFIX)?;
                Some((camel_case(suffix), SimpleValue::from(value.as_str())))
            })
            .collect();

        Ok(Config {
            worker_count,
            listen_ip,
            announce_ip,
            min_port,
            max_port,
            log_level,
            root_topic,
            bus,
            report_interval: Duration::from_millis(report_interval_ms),
            health_bind_address,
            extra_app_data,
        })
    }

    /// Application data advertised in every heartbeat of this process.
    #[must_use]
    pub fn app_data(&self) -> SimpleMap {
        let mut app_data = self.extra_app_data.clone();
        app_data.insert(
            "process".to_string(),
            SimpleValue::from(u64::from(std::process::id())),
        );
        app_data.insert(
            "topic".to_string(),
            SimpleValue::from(self.root_topic.as_str()),
        );
        app_data.insert(
            "ip".to_string(),
            SimpleValue::from(self.announce_ip.as_str()),
        );
        app_data.insert(
            "minPort".to_string(),
            SimpleValue::from(u64::from(self.min_port)),
        );
        app_data.insert(
            "maxPort".to_string(),
            SimpleValue::from(u64::from(self.max_port)),
        );
        app_data
    }
}
