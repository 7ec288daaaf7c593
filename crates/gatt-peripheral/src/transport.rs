//! Radio-side boundary
//!
//! The [`Transport`] is whatever actually owns the Bluetooth controller:
//! a platform GATT server, a HCI socket, or the simulated transport used
//! by the demo node and the tests. The server calls it synchronously from
//! its event loop; asynchronous results (advertising started, a
//! notification delivered) come back through the
//! [`ServerHandle`](crate::server::ServerHandle).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::central::Central;
use crate::error::Result;
use crate::gatt::{CharacteristicRef, GattService};
use crate::subscription::NotifyMode;
use crate::uuids;

/// Maximum payload of a legacy advertising or scan response PDU
pub const MAX_LEGACY_ADVERTISE_LEN: usize = 31;

/// Size of the flags AD structure a connectable advertisement carries
pub const ADVERTISE_FLAGS_LEN: usize = 3;

/// Interface to the Bluetooth controller
pub trait Transport: Send {
    /// Transport name (for logging)
    fn name(&self) -> &str;

    /// Publish a service in the local GATT database
    fn add_service(&mut self, service: &GattService) -> Result<()>;

    /// Begin advertising
    ///
    /// Success only means the request was accepted; the outcome arrives
    /// later as advertising started or failed.
    fn start_advertising(
        &mut self,
        settings: &AdvertiseSettings,
        advertise_data: &AdvertiseData,
        scan_response: &AdvertiseData,
    ) -> Result<()>;

    /// Stop advertising
    fn stop_advertising(&mut self) -> Result<()>;

    /// Queue a notification or indication for one central
    fn push_notification(
        &mut self,
        central: &Central,
        characteristic: &CharacteristicRef,
        value: &[u8],
        mode: NotifyMode,
    ) -> PushOutcome;
}

/// Synchronous answer to [`Transport::push_notification`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued for delivery; completion is reported as notification-sent
    Accepted,
    /// Refused outright
    Rejected(String),
}

impl PushOutcome {
    /// Whether the push was accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self, PushOutcome::Accepted)
    }
}

/// Advertising interval profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertiseMode {
    /// Longest interval
    LowPower,
    /// Balance of latency and power
    #[default]
    Balanced,
    /// Shortest interval
    LowLatency,
}

/// Advertising TX power
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxPowerLevel {
    /// About -21 dBm
    UltraLow,
    /// About -15 dBm
    Low,
    /// About -7 dBm
    #[default]
    Medium,
    /// About +1 dBm
    High,
}

impl TxPowerLevel {
    /// Nominal power in dBm, as carried in the TX power AD structure
    pub fn dbm(&self) -> i8 {
        match self {
            TxPowerLevel::UltraLow => -21,
            TxPowerLevel::Low => -15,
            TxPowerLevel::Medium => -7,
            TxPowerLevel::High => 1,
        }
    }
}

/// Advertising parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertiseSettings {
    /// Interval profile
    pub mode: AdvertiseMode,
    /// TX power
    pub tx_power: TxPowerLevel,
    /// Whether centrals may connect
    pub connectable: bool,
    /// Stop after this long; `None` advertises until stopped
    #[serde(with = "crate::config::humantime_serde_opt")]
    pub timeout: Option<Duration>,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::Balanced,
            tx_power: TxPowerLevel::Medium,
            connectable: true,
            timeout: None,
        }
    }
}

/// Content of an advertising or scan response packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertiseData {
    /// Carry the TX power level
    pub include_tx_power: bool,
    /// Carry the complete local name
    pub include_device_name: bool,
    /// Advertised service UUIDs, in order
    pub service_uuids: Vec<Uuid>,
}

impl AdvertiseData {
    /// Encoded size in bytes, excluding the flags structure
    ///
    /// Each AD structure costs a length and a type byte. 16-bit SIG UUIDs
    /// share one list at 2 bytes each, other UUIDs share one at 16.
    pub fn encoded_len(&self, device_name: &str) -> usize {
        let mut len = 0;
        if self.include_tx_power {
            len += 3;
        }
        if self.include_device_name {
            len += 2 + device_name.len();
        }

        let short = self
            .service_uuids
            .iter()
            .filter(|uuid| uuids::as_uuid16(uuid).is_some())
            .count();
        let long = self.service_uuids.len() - short;
        if short > 0 {
            len += 2 + 2 * short;
        }
        if long > 0 {
            len += 2 + 16 * long;
        }
        len
    }
}

/// Reason the controller gave for an advertising failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertiseError {
    /// Payload larger than the PDU allows
    DataTooLarge,
    /// No advertising instance available
    TooManyAdvertisers,
    /// Already advertising
    AlreadyStarted,
    /// Controller reported an internal failure
    InternalError,
    /// Controller cannot advertise
    FeatureUnsupported,
}

impl fmt::Display for AdvertiseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AdvertiseError::DataTooLarge => "data too large",
            AdvertiseError::TooManyAdvertisers => "too many advertisers",
            AdvertiseError::AlreadyStarted => "already started",
            AdvertiseError::InternalError => "internal error",
            AdvertiseError::FeatureUnsupported => "feature unsupported",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_len_short_uuids() {
        let data = AdvertiseData {
            include_tx_power: true,
            include_device_name: false,
            service_uuids: vec![uuids::HEART_RATE_SERVICE, uuids::ENVIRONMENTAL_SENSING_SERVICE],
        };
        // tx power (3) + uuid16 list header (2) + 2 * 2
        assert_eq!(data.encoded_len("ignored"), 9);
    }

    #[test]
    fn test_encoded_len_long_uuid_and_name() {
        let custom = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let data = AdvertiseData {
            include_tx_power: false,
            include_device_name: true,
            service_uuids: vec![custom],
        };
        assert_eq!(data.encoded_len("node"), 2 + 4 + 2 + 16);
    }

    #[test]
    fn test_default_settings() {
        let settings = AdvertiseSettings::default();
        assert_eq!(settings.mode, AdvertiseMode::Balanced);
        assert_eq!(settings.tx_power, TxPowerLevel::Medium);
        assert!(settings.connectable);
        assert!(settings.timeout.is_none());
    }

    #[test]
    fn test_advertise_error_display() {
        assert_eq!(AdvertiseError::TooManyAdvertisers.to_string(), "too many advertisers");
    }
}
