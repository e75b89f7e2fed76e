//! Configuration for the WRD sensor bridge.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use iot_bridge_common::LoggingConfig;

use crate::metrics::SensorLabels;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] iot_bridge_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrdBridgeConfig {
    /// Sensors to poll
    pub sensors: Vec<SensorConfig>,

    /// Polling cadence, timeouts and retry policy
    #[serde(default)]
    pub polling: PollingConfig,

    /// Metrics endpoint settings
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One physical sensor: its address and where it hangs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Sensor IP address (IPv4 or IPv6)
    pub ip: String,

    /// Campus label
    #[serde(default)]
    pub campus: String,

    /// Building label
    #[serde(default)]
    pub building: String,

    /// Room label
    #[serde(default)]
    pub room: String,
}

impl SensorConfig {
    /// Label set identifying this sensor's metric series.
    pub fn labels(&self) -> SensorLabels {
        SensorLabels::new(&self.ip, &self.campus, &self.building, &self.room)
    }
}

/// Polling and retry settings shared by all sensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// TCP port the sensors listen on (default: 80)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connect timeout in milliseconds (default: 2000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Deadline for all reads on one connection, in milliseconds (default: 1000)
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Pause between successful polls in seconds (default: 5)
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    /// Delay after the first consecutive failure in seconds (default: 15)
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,

    /// Ceiling for the retry delay in seconds (default: 86400)
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,
}

fn default_port() -> u16 {
    80
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_sample_interval() -> u64 {
    5
}

fn default_retry_base_delay() -> u64 {
    15
}

fn default_retry_max_delay() -> u64 {
    24 * 60 * 60
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            sample_interval_secs: default_sample_interval(),
            retry_base_delay_secs: default_retry_base_delay(),
            retry_max_delay_secs: default_retry_max_delay(),
        }
    }
}

impl PollingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_secs)
    }
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:9580").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_listen() -> String {
    "0.0.0.0:9580".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
        }
    }
}

impl WrdBridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: WrdBridgeConfig = iot_bridge_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: WrdBridgeConfig = iot_bridge_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensors.is_empty() {
            return Err(ConfigError::Validation(
                "At least one sensor must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for sensor in &self.sensors {
            if sensor.ip.parse::<IpAddr>().is_err() {
                return Err(ConfigError::Validation(format!(
                    "Invalid IP address: {}",
                    sensor.ip
                )));
            }

            if !seen.insert(sensor.ip.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Sensor {} is configured more than once",
                    sensor.ip
                )));
            }
        }

        let polling = &self.polling;
        if polling.port == 0 {
            return Err(ConfigError::Validation("port must be > 0".to_string()));
        }
        if polling.connect_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "connect_timeout_ms must be > 0".to_string(),
            ));
        }
        if polling.read_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "read_timeout_ms must be > 0".to_string(),
            ));
        }
        if polling.sample_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sample_interval_secs must be > 0".to_string(),
            ));
        }
        if polling.retry_base_delay_secs == 0 {
            return Err(ConfigError::Validation(
                "retry_base_delay_secs must be > 0".to_string(),
            ));
        }
        if polling.retry_max_delay_secs < polling.retry_base_delay_secs {
            return Err(ConfigError::Validation(
                "retry_max_delay_secs must be >= retry_base_delay_secs".to_string(),
            ));
        }

        if self.prometheus.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            )));
        }

        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        Ok(())
    }
}
