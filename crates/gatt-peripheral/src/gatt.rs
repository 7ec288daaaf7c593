//! GATT data model
//!
//! Static metadata describing what a service exposes: characteristics,
//! their operation and permission masks, and attached descriptors. Values
//! are never stored here; they are produced on demand by the owning
//! [`ServiceHandler`](crate::handler::ServiceHandler).

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::error::{PeripheralError, Result};
use crate::uuids;

bitflags! {
    /// Operations a central may perform on a characteristic
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Properties: u8 {
        /// Value can be read
        const READ = 0x02;
        /// Value can be written without response
        const WRITE_NO_RESPONSE = 0x04;
        /// Value can be written with response
        const WRITE = 0x08;
        /// Value changes can be notified (unacknowledged)
        const NOTIFY = 0x10;
        /// Value changes can be indicated (acknowledged)
        const INDICATE = 0x20;
    }
}

bitflags! {
    /// Link security a central needs before it may access an attribute
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        /// Read on any link
        const READ = 0x0001;
        /// Read on an encrypted link
        const READ_ENCRYPTED = 0x0002;
        /// Read on an encrypted, MITM-protected link
        const READ_ENCRYPTED_MITM = 0x0004;
        /// Write on any link
        const WRITE = 0x0010;
        /// Write on an encrypted link
        const WRITE_ENCRYPTED = 0x0020;
        /// Write on an encrypted, MITM-protected link
        const WRITE_ENCRYPTED_MITM = 0x0040;
    }
}

/// Security level of a central's link
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Unencrypted link
    #[default]
    Open,
    /// Encrypted, unauthenticated pairing
    Encrypted,
    /// Encrypted with MITM protection
    Authenticated,
}

impl Permissions {
    /// Least security level that grants read access, if reads are permitted at all
    pub fn read_requirement(&self) -> Option<SecurityLevel> {
        Self::requirement(
            self.contains(Permissions::READ),
            self.contains(Permissions::READ_ENCRYPTED),
            self.contains(Permissions::READ_ENCRYPTED_MITM),
        )
    }

    /// Least security level that grants write access, if writes are permitted at all
    pub fn write_requirement(&self) -> Option<SecurityLevel> {
        Self::requirement(
            self.contains(Permissions::WRITE),
            self.contains(Permissions::WRITE_ENCRYPTED),
            self.contains(Permissions::WRITE_ENCRYPTED_MITM),
        )
    }

    fn requirement(open: bool, encrypted: bool, mitm: bool) -> Option<SecurityLevel> {
        if open {
            Some(SecurityLevel::Open)
        } else if encrypted {
            Some(SecurityLevel::Encrypted)
        } else if mitm {
            Some(SecurityLevel::Authenticated)
        } else {
            None
        }
    }
}

/// Map a permission requirement and the link's level to an ATT status
fn check_access(required: Option<SecurityLevel>, actual: SecurityLevel, denied: GattStatus) -> GattStatus {
    match required {
        None => denied,
        Some(level) if actual >= level => GattStatus::Success,
        Some(SecurityLevel::Authenticated) => GattStatus::InsufficientAuthentication,
        Some(_) => GattStatus::InsufficientEncryption,
    }
}

/// A descriptor attached to a characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Descriptor UUID
    pub uuid: Uuid,
    /// Access permissions
    pub permissions: Permissions,
    /// Static value, for descriptors whose content never changes
    pub value: Option<Bytes>,
}

impl Descriptor {
    /// Client Characteristic Configuration descriptor
    pub fn cccd() -> Self {
        Self {
            uuid: uuids::CLIENT_CHARACTERISTIC_CONFIGURATION,
            permissions: Permissions::READ | Permissions::WRITE,
            value: None,
        }
    }

    /// Characteristic User Description descriptor with fixed text
    pub fn user_description(text: &str) -> Self {
        Self {
            uuid: uuids::CHARACTERISTIC_USER_DESCRIPTION,
            permissions: Permissions::READ,
            value: Some(Bytes::copy_from_slice(text.as_bytes())),
        }
    }

    /// Whether this is a CCCD
    pub fn is_cccd(&self) -> bool {
        self.uuid == uuids::CLIENT_CHARACTERISTIC_CONFIGURATION
    }

    /// Status for a read by a central with the given link security
    pub fn check_read(&self, security: SecurityLevel) -> GattStatus {
        check_access(
            self.permissions.read_requirement(),
            security,
            GattStatus::ReadNotPermitted,
        )
    }

    /// Status for a write by a central with the given link security
    pub fn check_write(&self, security: SecurityLevel) -> GattStatus {
        check_access(
            self.permissions.write_requirement(),
            security,
            GattStatus::WriteNotPermitted,
        )
    }
}

/// Characteristic metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    /// Characteristic UUID, unique within its service
    pub uuid: Uuid,
    /// Permitted operations
    pub properties: Properties,
    /// Access permissions
    pub permissions: Permissions,
    /// Attached descriptors
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    /// Create a characteristic without descriptors
    pub fn new(uuid: Uuid, properties: Properties, permissions: Permissions) -> Self {
        Self {
            uuid,
            properties,
            permissions,
            descriptors: Vec::new(),
        }
    }

    /// Attach a descriptor
    pub fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Attach a CCCD
    pub fn with_cccd(self) -> Self {
        self.with_descriptor(Descriptor::cccd())
    }

    /// Look up a descriptor by UUID
    pub fn descriptor(&self, uuid: &Uuid) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| &d.uuid == uuid)
    }

    /// Whether a CCCD is attached
    pub fn has_cccd(&self) -> bool {
        self.descriptors.iter().any(Descriptor::is_cccd)
    }

    /// Whether notify or indicate is supported
    pub fn can_push(&self) -> bool {
        self.properties
            .intersects(Properties::NOTIFY | Properties::INDICATE)
    }

    /// Status for a read by a central with the given link security
    pub fn check_read(&self, security: SecurityLevel) -> GattStatus {
        if !self.properties.contains(Properties::READ) {
            return GattStatus::ReadNotPermitted;
        }
        check_access(
            self.permissions.read_requirement(),
            security,
            GattStatus::ReadNotPermitted,
        )
    }

    /// Status for a write by a central with the given link security
    pub fn check_write(&self, security: SecurityLevel) -> GattStatus {
        if !self
            .properties
            .intersects(Properties::WRITE | Properties::WRITE_NO_RESPONSE)
        {
            return GattStatus::WriteNotPermitted;
        }
        check_access(
            self.permissions.write_requirement(),
            security,
            GattStatus::WriteNotPermitted,
        )
    }
}

/// A primary GATT service definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID
    pub uuid: Uuid,
    /// Owned characteristics
    pub characteristics: Vec<Characteristic>,
}

impl GattService {
    /// Create an empty service
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
        }
    }

    /// Add a characteristic
    pub fn with_characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Look up a characteristic by UUID
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }

    /// Reference to one of this service's characteristics
    pub fn characteristic_ref(&self, uuid: Uuid) -> CharacteristicRef {
        CharacteristicRef::new(self.uuid, uuid)
    }

    /// Check structural invariants before registration
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for characteristic in &self.characteristics {
            if !seen.insert(characteristic.uuid) {
                return Err(PeripheralError::DuplicateCharacteristic {
                    service: self.uuid,
                    characteristic: characteristic.uuid,
                });
            }
            if characteristic.can_push() && !characteristic.has_cccd() {
                return Err(PeripheralError::MissingCccd {
                    characteristic: characteristic.uuid,
                });
            }
        }
        Ok(())
    }
}

/// Identity of a characteristic: its UUID within its parent service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    /// Parent service UUID
    pub service: Uuid,
    /// Characteristic UUID
    pub characteristic: Uuid,
}

impl CharacteristicRef {
    /// Create a reference
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    /// Reference to a descriptor on this characteristic
    pub const fn descriptor(self, uuid: Uuid) -> DescriptorRef {
        DescriptorRef {
            characteristic: self,
            descriptor: uuid,
        }
    }

    /// Reference to this characteristic's CCCD
    pub const fn cccd(self) -> DescriptorRef {
        self.descriptor(uuids::CLIENT_CHARACTERISTIC_CONFIGURATION)
    }
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (uuids::as_uuid16(&self.service), uuids::as_uuid16(&self.characteristic)) {
            (Some(s), Some(c)) => write!(f, "0x{:04X}/0x{:04X}", s, c),
            _ => write!(f, "{}/{}", self.service, self.characteristic),
        }
    }
}

/// Identity of a descriptor: its UUID on its owning characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRef {
    /// Owning characteristic
    pub characteristic: CharacteristicRef,
    /// Descriptor UUID
    pub descriptor: Uuid,
}

impl DescriptorRef {
    /// Whether this addresses a CCCD
    pub fn is_cccd(&self) -> bool {
        self.descriptor == uuids::CLIENT_CHARACTERISTIC_CONFIGURATION
    }
}

/// ATT status returned to a central
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GattStatus {
    /// Operation succeeded
    Success,
    /// Attribute handle not valid on this server
    InvalidHandle,
    /// Attribute cannot be read
    ReadNotPermitted,
    /// Attribute cannot be written
    WriteNotPermitted,
    /// Link must be authenticated
    InsufficientAuthentication,
    /// Server does not support the request
    RequestNotSupported,
    /// Offset beyond the end of the attribute
    InvalidOffset,
    /// Value length not valid for this attribute
    InvalidAttributeValueLength,
    /// Request could not be completed for an unlikely reason
    UnlikelyError,
    /// Link must be encrypted
    InsufficientEncryption,
    /// Value not allowed
    ValueNotAllowed,
    /// CCCD written with an unsupported value
    CccdImproperlyConfigured,
}

impl GattStatus {
    /// ATT error code
    pub fn code(&self) -> u8 {
        match self {
            GattStatus::Success => 0x00,
            GattStatus::InvalidHandle => 0x01,
            GattStatus::ReadNotPermitted => 0x02,
            GattStatus::WriteNotPermitted => 0x03,
            GattStatus::InsufficientAuthentication => 0x05,
            GattStatus::RequestNotSupported => 0x06,
            GattStatus::InvalidOffset => 0x07,
            GattStatus::InvalidAttributeValueLength => 0x0D,
            GattStatus::UnlikelyError => 0x0E,
            GattStatus::InsufficientEncryption => 0x0F,
            GattStatus::ValueNotAllowed => 0x13,
            GattStatus::CccdImproperlyConfigured => 0xFD,
        }
    }

    /// Whether this is [`GattStatus::Success`]
    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, self.code())
    }
}

/// Result of a characteristic or descriptor read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Value to return to the central
    Success(Bytes),
    /// Read refused
    Failure(GattStatus),
}

impl ReadOutcome {
    /// Successful read
    pub fn success(value: impl Into<Bytes>) -> Self {
        ReadOutcome::Success(value.into())
    }

    /// Generic "not supported" outcome used for routing misses
    pub fn not_supported() -> Self {
        ReadOutcome::Failure(GattStatus::RequestNotSupported)
    }

    /// Status of this outcome
    pub fn status(&self) -> GattStatus {
        match self {
            ReadOutcome::Success(_) => GattStatus::Success,
            ReadOutcome::Failure(status) => *status,
        }
    }

    /// Value, if successful
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            ReadOutcome::Success(value) => Some(value),
            ReadOutcome::Failure(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notify_char() -> Characteristic {
        Characteristic::new(
            uuids::HEART_RATE_MEASUREMENT,
            Properties::READ | Properties::NOTIFY,
            Permissions::READ,
        )
    }

    #[test]
    fn test_duplicate_characteristic_rejected() {
        let service = GattService::new(uuids::DEVICE_INFORMATION_SERVICE)
            .with_characteristic(Characteristic::new(
                uuids::MODEL_NUMBER,
                Properties::READ,
                Permissions::READ,
            ))
            .with_characteristic(Characteristic::new(
                uuids::MODEL_NUMBER,
                Properties::READ,
                Permissions::READ,
            ));
        assert!(matches!(
            service.validate(),
            Err(PeripheralError::DuplicateCharacteristic { .. })
        ));
    }

    #[test]
    fn test_notify_requires_cccd() {
        let missing = GattService::new(uuids::HEART_RATE_SERVICE).with_characteristic(notify_char());
        assert!(matches!(
            missing.validate(),
            Err(PeripheralError::MissingCccd { .. })
        ));

        let ok = GattService::new(uuids::HEART_RATE_SERVICE)
            .with_characteristic(notify_char().with_cccd());
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_read_permission_tiers() {
        let open = Characteristic::new(uuids::MODEL_NUMBER, Properties::READ, Permissions::READ);
        assert_eq!(open.check_read(SecurityLevel::Open), GattStatus::Success);

        let encrypted = Characteristic::new(
            uuids::MODEL_NUMBER,
            Properties::READ,
            Permissions::READ_ENCRYPTED,
        );
        assert_eq!(
            encrypted.check_read(SecurityLevel::Open),
            GattStatus::InsufficientEncryption
        );
        assert_eq!(encrypted.check_read(SecurityLevel::Encrypted), GattStatus::Success);

        let mitm = Characteristic::new(
            uuids::MODEL_NUMBER,
            Properties::READ,
            Permissions::READ_ENCRYPTED_MITM,
        );
        assert_eq!(
            mitm.check_read(SecurityLevel::Encrypted),
            GattStatus::InsufficientAuthentication
        );
        assert_eq!(mitm.check_read(SecurityLevel::Authenticated), GattStatus::Success);
    }

    #[test]
    fn test_write_requires_property() {
        let read_only =
            Characteristic::new(uuids::MANUFACTURER_NAME, Properties::READ, Permissions::READ);
        assert_eq!(
            read_only.check_write(SecurityLevel::Authenticated),
            GattStatus::WriteNotPermitted
        );

        let writable = Characteristic::new(
            uuids::MODEL_NUMBER,
            Properties::READ | Properties::WRITE,
            Permissions::READ | Permissions::WRITE,
        );
        assert_eq!(writable.check_write(SecurityLevel::Open), GattStatus::Success);
    }

    #[test]
    fn test_characteristic_ref_display() {
        let r = CharacteristicRef::new(uuids::HEART_RATE_SERVICE, uuids::HEART_RATE_MEASUREMENT);
        assert_eq!(r.to_string(), "0x180D/0x2A37");
        assert!(r.cccd().is_cccd());
    }

    #[test]
    fn test_read_outcome_helpers() {
        let ok = ReadOutcome::success(vec![1u8, 2]);
        assert_eq!(ok.status(), GattStatus::Success);
        assert_eq!(ok.value().map(|v| v.as_ref()), Some(&[1u8, 2][..]));

        let miss = ReadOutcome::not_supported();
        assert_eq!(miss.status(), GattStatus::RequestNotSupported);
        assert!(miss.value().is_none());
    }
}
