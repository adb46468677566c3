use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_STATUS_TOPIC: &str = "galgo/status";
pub const DEFAULT_DATABASE_PATH: &str = "galgo.db";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub status_topic: String,
    pub resubscribe_delay_ms: u64,
    pub auto_connect: bool,
    pub database_path: String,
}

/// Everything needed to open one broker session.
///
/// `client_id` must stay the same across restarts: the broker keeps one
/// session per id and a fixed id lets a new connection evict the old one.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub address: String,
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_clean_session() -> bool {
    true
}

impl BrokerConfig {
    pub fn new(address: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            client_id: client_id.into(),
            username: None,
            password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            keepalive_secs: default_keepalive_secs(),
            clean_session: default_clean_session(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Credentials are only sent when a username is present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match self.username.as_deref() {
            Some(user) if !user.is_empty() => {
                Some((user, self.password.as_deref().unwrap_or_default()))
            }
            _ => None,
        }
    }

    /// Validate timeout values and other critical configurations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        BrokerAddress::from_str(&self.address)?;

        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingOrInvalid("MQTT_CLIENT_ID".to_string()));
        }
        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.connect_timeout_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_CONNECT_TIMEOUT_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.reconnect_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RECONNECT_PERIOD_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if self.keepalive_secs == 0 || self.keepalive_secs > u16::MAX as u64 {
            return Err(ConfigError::ParsingError(
                "MQTT_KEEPALIVE_SECS must be between 1 and 65535".to_string(),
            ));
        }
        Ok(())
    }
}

/// A parsed `scheme://host:port` broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl FromStr for BrokerAddress {
    type Err = ConfigError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            ConfigError::ParsingError(format!("invalid broker address '{}': {}", address, reason))
        };

        let (scheme, rest) = address
            .split_once("://")
            .ok_or_else(|| invalid("expected scheme://host:port"))?;

        let (tls, default_port) = match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => (false, 1883),
            "mqtts" | "ssl" | "tls" => (true, 8883),
            other => return Err(invalid(&format!("unsupported scheme '{}'", other))),
        };

        let authority = rest.trim_end_matches('/');
        if authority.is_empty() || authority.contains('/') {
            return Err(invalid("expected host[:port] after the scheme"));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid("port must be a number between 0 and 65535"))?;
                (host, port)
            }
            None => (authority, default_port),
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{} has an invalid value", name))),
        _ => Ok(default),
    }
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// When `MQTT_CLIENT_ID` is not set the returned broker config carries an
    /// empty client id; callers resolve the persisted one before connecting.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let broker = BrokerConfig {
            address: env::var("MQTT_BROKER_URL")
                .map_err(|_| ConfigError::MissingOrInvalid("MQTT_BROKER_URL".to_string()))?,
            client_id: env_opt("MQTT_CLIENT_ID").unwrap_or_default(),
            username: env_opt("MQTT_USERNAME"),
            password: env_opt("MQTT_PASSWORD"),
            connect_timeout_ms: env_or("MQTT_CONNECT_TIMEOUT_MS", default_connect_timeout_ms())?,
            reconnect_interval_ms: env_or(
                "MQTT_RECONNECT_PERIOD_MS",
                default_reconnect_interval_ms(),
            )?,
            keepalive_secs: env_or("MQTT_KEEPALIVE_SECS", default_keepalive_secs())?,
            clean_session: env_or("MQTT_CLEAN_SESSION", default_clean_session())?,
        };

        BrokerAddress::from_str(&broker.address)?;

        let config = Self {
            broker,
            status_topic: env_opt("MQTT_STATUS_TOPIC")
                .unwrap_or_else(|| DEFAULT_STATUS_TOPIC.to_string()),
            resubscribe_delay_ms: env_or("MQTT_RESUBSCRIBE_DELAY_MS", 1_000)?,
            auto_connect: env_or("MQTT_AUTO_CONNECT", true)?,
            database_path: env_opt("DATABASE_PATH")
                .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
        };

        Ok(config)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}
