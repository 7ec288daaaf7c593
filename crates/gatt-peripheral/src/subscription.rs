//! Subscription bookkeeping
//!
//! Records which central enabled which push mode on which characteristic,
//! as written to the characteristic's CCCD.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::gatt::{Characteristic, CharacteristicRef, GattStatus, Properties};

/// How values are pushed to a subscribed central
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyMode {
    /// Unacknowledged push
    Notify,
    /// Acknowledged push
    Indicate,
}

impl NotifyMode {
    /// Property bit a characteristic needs for this mode
    pub fn required_property(&self) -> Properties {
        match self {
            NotifyMode::Notify => Properties::NOTIFY,
            NotifyMode::Indicate => Properties::INDICATE,
        }
    }
}

/// Decoded CCCD value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CccdValue {
    /// `0x0000`
    Disabled,
    /// `0x0001`
    Enabled(NotifyMode),
}

impl CccdValue {
    /// CCCD value for `0x0001`
    pub const NOTIFY: [u8; 2] = [0x01, 0x00];
    /// CCCD value for `0x0002`
    pub const INDICATE: [u8; 2] = [0x02, 0x00];
    /// CCCD value for `0x0000`
    pub const DISABLED: [u8; 2] = [0x00, 0x00];

    /// Parse a CCCD write
    ///
    /// Anything other than exactly two bytes holding 0, 1 or 2 is
    /// improperly configured.
    pub fn parse(bytes: &[u8]) -> Result<Self, GattStatus> {
        match bytes {
            [0x00, 0x00] => Ok(CccdValue::Disabled),
            [0x01, 0x00] => Ok(CccdValue::Enabled(NotifyMode::Notify)),
            [0x02, 0x00] => Ok(CccdValue::Enabled(NotifyMode::Indicate)),
            [_, _] => Err(GattStatus::CccdImproperlyConfigured),
            _ => Err(GattStatus::InvalidAttributeValueLength),
        }
    }

    /// Wire encoding
    pub fn encode(&self) -> [u8; 2] {
        match self {
            CccdValue::Disabled => Self::DISABLED,
            CccdValue::Enabled(NotifyMode::Notify) => Self::NOTIFY,
            CccdValue::Enabled(NotifyMode::Indicate) => Self::INDICATE,
        }
    }

    /// Whether `characteristic` supports this value
    pub fn supported_by(&self, characteristic: &Characteristic) -> bool {
        match self {
            CccdValue::Disabled => true,
            CccdValue::Enabled(mode) => characteristic
                .properties
                .contains(mode.required_property()),
        }
    }
}

impl From<Option<NotifyMode>> for CccdValue {
    fn from(mode: Option<NotifyMode>) -> Self {
        mode.map(CccdValue::Enabled).unwrap_or(CccdValue::Disabled)
    }
}

/// `(central, characteristic) -> mode` relation
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: HashMap<(String, CharacteristicRef), NotifyMode>,
}

impl SubscriptionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable `mode` for a central
    ///
    /// Returns `true` if the central was not subscribed before. Switching
    /// between notify and indicate is not a new subscription.
    pub fn enable(&mut self, address: &str, characteristic: CharacteristicRef, mode: NotifyMode) -> bool {
        self.entries
            .insert((address.to_string(), characteristic), mode)
            .is_none()
    }

    /// Disable pushes for a central, returning `true` if it was subscribed
    pub fn disable(&mut self, address: &str, characteristic: CharacteristicRef) -> bool {
        self.entries
            .remove(&(address.to_string(), characteristic))
            .is_some()
    }

    /// Mode a central enabled, if any
    pub fn mode(&self, address: &str, characteristic: CharacteristicRef) -> Option<NotifyMode> {
        self.entries
            .get(&(address.to_string(), characteristic))
            .copied()
    }

    /// Subscribers of a characteristic with their modes, sorted by address
    pub fn subscribers(&self, characteristic: CharacteristicRef) -> Vec<(String, NotifyMode)> {
        let mut subscribers: Vec<_> = self
            .entries
            .iter()
            .filter(|((_, c), _)| *c == characteristic)
            .map(|((address, _), mode)| (address.clone(), *mode))
            .collect();
        subscribers.sort_by(|a, b| a.0.cmp(&b.0));
        subscribers
    }

    /// Whether anyone is subscribed to a characteristic
    pub fn has_subscribers(&self, characteristic: CharacteristicRef) -> bool {
        self.entries.keys().any(|(_, c)| *c == characteristic)
    }

    /// Drop every subscription held by a central
    ///
    /// Returns the characteristics it was subscribed to.
    pub fn remove_central(&mut self, address: &str) -> Vec<CharacteristicRef> {
        let mut removed = Vec::new();
        self.entries.retain(|(a, characteristic), _| {
            if a == address {
                removed.push(*characteristic);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Total subscriptions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no subscriptions
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
