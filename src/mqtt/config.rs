use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Broker connection settings, as read from the `[mqtt]` section of the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// `tcp://host:port`, `host:port` or just `host`
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub connection_timeout_secs: u64,
    pub clean_session: bool,
    /// Let the network thread reconnect on its own after a transport error
    pub automatic_reconnect: bool,
    /// Seconds the network thread waits before reconnecting on its own
    pub reconnect_interval_secs: u64,
    pub request_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: "tcp://localhost:1883".to_string(),
            client_id: "SensorWorkerClient".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 5,
            connection_timeout_secs: 10,
            clean_session: true,
            automatic_reconnect: true,
            reconnect_interval_secs: 2,
            request_capacity: 10,
        }
    }
}

impl MqttConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Splits the broker URL into host and port.
    pub fn broker_address(&self) -> Result<(String, u16), ConfigError> {
        let url = self.broker_url.trim();
        let without_scheme = match url.split_once("://") {
            Some(("tcp", rest)) | Some(("mqtt", rest)) => rest,
            Some((scheme, _)) => {
                return Err(ConfigError::InvalidBrokerUrl(format!(
                    "unsupported scheme '{}' in '{}'",
                    scheme, url
                )))
            }
            None => url,
        };

        let (host, port) = match without_scheme.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    ConfigError::InvalidBrokerUrl(format!("bad port in '{}': {}", url, e))
                })?;
                (host, port)
            }
            None => (without_scheme, DEFAULT_MQTT_PORT),
        };

        if host.is_empty() {
            return Err(ConfigError::InvalidBrokerUrl(format!(
                "missing host in '{}'",
                url
            )));
        }

        Ok((host.to_string(), port))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker_address()?;
        if self.client_id.is_empty() || self.client_id.starts_with(' ') {
            return Err(ConfigError::InvalidClientId(self.client_id.clone()));
        }
        if self.request_capacity == 0 {
            return Err(ConfigError::Invalid(
                "mqtt.request_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Attempt budget for one logical publish.
///
/// Constant delay between attempts, no backoff. Fixed for the process
/// lifetime; not read from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            delay,
        })
    }
}
