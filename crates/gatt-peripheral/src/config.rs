//! Configuration types for the peripheral
//!
//! Every section is optional in a JSON file; missing fields take the
//! defaults below. Durations are written in humantime form (`"1s"`,
//! `"250ms"`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{PeripheralError, Result};
use crate::scheduler::DEFAULT_NOTIFY_INTERVAL;
use crate::services::temperature::TemperatureUnit;
use crate::transport::AdvertiseSettings;

/// Largest attribute value ATT can carry
pub const MAX_ATTRIBUTE_LEN: usize = 512;

/// Default command queue depth for the server handle
pub const DEFAULT_COMMAND_QUEUE_SIZE: usize = 256;

/// Default device name in the scan response
pub const DEFAULT_DEVICE_NAME: &str = "gatt-node";

/// Default heart rate seed in beats per minute
pub const DEFAULT_HEART_RATE: i32 = 80;

/// Default temperature seed in degrees Celsius
pub const DEFAULT_CELSIUS: i32 = 22;

/// Main configuration for the peripheral
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeripheralConfig {
    /// Identity strings
    #[serde(default)]
    pub device: DeviceConfig,

    /// Advertising parameters
    #[serde(default)]
    pub advertising: AdvertiseSettings,

    /// Periodic push settings
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Simulated sensor settings
    #[serde(default)]
    pub sensors: SensorConfig,

    /// Event loop settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Identity strings exposed over the air
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Local name carried in the scan response
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Manufacturer Name String value
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,

    /// Model Number String value until a central writes one
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_string()
}

fn default_manufacturer() -> String {
    "Univrs".to_string()
}

fn default_model() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            manufacturer: default_manufacturer(),
            model: default_model(),
        }
    }
}

/// Periodic push settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Period between pushed values
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,
}

fn default_interval() -> Duration {
    DEFAULT_NOTIFY_INTERVAL
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_NOTIFY_INTERVAL,
        }
    }
}

/// Simulated sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Heart rate seed
    #[serde(default = "default_heart_rate")]
    pub initial_heart_rate: i32,

    /// Temperature seed in Celsius
    #[serde(default = "default_celsius")]
    pub initial_celsius: i32,

    /// Unit of the flagged Temperature Measurement
    #[serde(default)]
    pub temperature_unit: TemperatureUnit,
}

fn default_heart_rate() -> i32 {
    DEFAULT_HEART_RATE
}

fn default_celsius() -> i32 {
    DEFAULT_CELSIUS
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            initial_heart_rate: DEFAULT_HEART_RATE,
            initial_celsius: DEFAULT_CELSIUS,
            temperature_unit: TemperatureUnit::Celsius,
        }
    }
}

/// Event loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Depth of the command queue behind [`ServerHandle`](crate::server::ServerHandle)
    #[serde(default = "default_queue_size")]
    pub command_queue_size: usize,
}

fn default_queue_size() -> usize {
    DEFAULT_COMMAND_QUEUE_SIZE
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command_queue_size: DEFAULT_COMMAND_QUEUE_SIZE,
        }
    }
}

impl PeripheralConfig {
    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.device.name.is_empty() {
            return Err(PeripheralError::InvalidConfig("device name is empty".into()));
        }
        if self.device.model.len() > MAX_ATTRIBUTE_LEN {
            return Err(PeripheralError::InvalidConfig(format!(
                "model string is {} bytes, limit is {}",
                self.device.model.len(),
                MAX_ATTRIBUTE_LEN
            )));
        }
        if self.notifications.interval.is_zero() {
            return Err(PeripheralError::InvalidConfig(
                "notification interval must be positive".into(),
            ));
        }
        if self.server.command_queue_size == 0 {
            return Err(PeripheralError::InvalidConfig(
                "command queue size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for PeripheralConfig
#[derive(Debug, Default)]
pub struct PeripheralConfigBuilder {
    config: PeripheralConfig,
}

impl PeripheralConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised device name
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.config.device.name = name.into();
        self
    }

    /// Set the manufacturer string
    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.config.device.manufacturer = manufacturer.into();
        self
    }

    /// Set the default model string
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.device.model = model.into();
        self
    }

    /// Set advertising parameters
    pub fn advertising(mut self, settings: AdvertiseSettings) -> Self {
        self.config.advertising = settings;
        self
    }

    /// Set the push period
    pub fn notify_interval(mut self, interval: Duration) -> Self {
        self.config.notifications.interval = interval;
        self
    }

    /// Set the heart rate seed
    pub fn initial_heart_rate(mut self, bpm: i32) -> Self {
        self.config.sensors.initial_heart_rate = bpm;
        self
    }

    /// Set the temperature seed
    pub fn initial_celsius(mut self, celsius: i32) -> Self {
        self.config.sensors.initial_celsius = celsius;
        self
    }

    /// Set the flagged measurement unit
    pub fn temperature_unit(mut self, unit: TemperatureUnit) -> Self {
        self.config.sensors.temperature_unit = unit;
        self
    }

    /// Set the command queue depth
    pub fn command_queue_size(mut self, size: usize) -> Self {
        self.config.server.command_queue_size = size;
        self
    }

    /// Build the configuration
    pub fn build(self) -> PeripheralConfig {
        self.config
    }
}

// Duration as humantime text
pub(crate) mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

// Optional duration; null means none
pub(crate) mod humantime_serde_opt {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TxPowerLevel;

    #[test]
    fn test_default_config() {
        let config = PeripheralConfig::default();
        assert_eq!(config.notifications.interval, Duration::from_secs(1));
        assert_eq!(config.sensors.initial_heart_rate, 80);
        assert_eq!(config.sensors.initial_celsius, 22);
        assert_eq!(config.sensors.temperature_unit, TemperatureUnit::Celsius);
        assert!(config.advertising.connectable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PeripheralConfigBuilder::new()
            .device_name("bench")
            .model("Pixel 7")
            .notify_interval(Duration::from_millis(250))
            .temperature_unit(TemperatureUnit::Fahrenheit)
            .build();

        assert_eq!(config.device.name, "bench");
        assert_eq!(config.device.model, "Pixel 7");
        assert_eq!(config.notifications.interval, Duration::from_millis(250));
        assert_eq!(config.sensors.temperature_unit, TemperatureUnit::Fahrenheit);
    }

    #[test]
    fn test_partial_json() {
        let config = PeripheralConfig::from_json_str(
            r#"{
                "device": { "name": "lab-node" },
                "advertising": { "tx_power": "high", "timeout": "30s" },
                "notifications": { "interval": "500ms" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.device.name, "lab-node");
        assert_eq!(config.device.manufacturer, "Univrs");
        assert_eq!(config.advertising.tx_power, TxPowerLevel::High);
        assert_eq!(config.advertising.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.notifications.interval, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = PeripheralConfig::from_json_str(r#"{ "notifications": { "interval": "0s" } }"#)
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");

        let err = PeripheralConfig::from_json_str(r#"{ "device": { "name": "" } }"#).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");

        assert!(PeripheralConfig::from_json_str("{ not json").is_err());
    }

    #[test]
    fn test_json_round_trip_keeps_humantime() {
        let config = PeripheralConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"interval\":\"1s\""));
        let back = PeripheralConfig::from_json_str(&json).unwrap();
        assert_eq!(back.notifications.interval, config.notifications.interval);
    }
}
