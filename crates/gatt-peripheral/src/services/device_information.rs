//! Device Information service (0x180A)

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, info};

use crate::central::Central;
use crate::config::{DeviceConfig, MAX_ATTRIBUTE_LEN};
use crate::gatt::{
    Characteristic, CharacteristicRef, Descriptor, GattService, GattStatus, Permissions,
    Properties, ReadOutcome,
};
use crate::handler::{ServiceContext, ServiceHandler};
use crate::uuids;

/// Manufacturer Name String
pub const MANUFACTURER_NAME_REF: CharacteristicRef =
    CharacteristicRef::new(uuids::DEVICE_INFORMATION_SERVICE, uuids::MANUFACTURER_NAME);

/// Model Number String
pub const MODEL_NUMBER_REF: CharacteristicRef =
    CharacteristicRef::new(uuids::DEVICE_INFORMATION_SERVICE, uuids::MODEL_NUMBER);

/// Manufacturer and a writable model number
pub struct DeviceInformationService {
    service: GattService,
    manufacturer: Bytes,
    default_model: Bytes,
    /// Writes awaiting completion, per central address
    staged_models: HashMap<String, Bytes>,
    committed_model: Option<Bytes>,
}

impl DeviceInformationService {
    /// Create the service from the device section of the configuration
    pub fn new(device: &DeviceConfig) -> Self {
        let service = GattService::new(uuids::DEVICE_INFORMATION_SERVICE)
            .with_characteristic(
                Characteristic::new(uuids::MANUFACTURER_NAME, Properties::READ, Permissions::READ)
                    .with_descriptor(Descriptor::user_description("Manufacturer")),
            )
            .with_characteristic(
                Characteristic::new(
                    uuids::MODEL_NUMBER,
                    Properties::READ | Properties::WRITE,
                    Permissions::READ | Permissions::WRITE,
                )
                .with_descriptor(Descriptor::user_description("Model")),
            );

        Self {
            service,
            manufacturer: Bytes::copy_from_slice(device.manufacturer.as_bytes()),
            default_model: Bytes::copy_from_slice(device.model.as_bytes()),
            staged_models: HashMap::new(),
            committed_model: None,
        }
    }

    /// Model number a read would return now
    pub fn model(&self) -> &Bytes {
        self.committed_model.as_ref().unwrap_or(&self.default_model)
    }
}

impl ServiceHandler for DeviceInformationService {
    fn service(&self) -> &GattService {
        &self.service
    }

    fn name(&self) -> &str {
        "device-information"
    }

    fn on_characteristic_read(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _central: &Central,
        characteristic: CharacteristicRef,
    ) -> ReadOutcome {
        match characteristic {
            MANUFACTURER_NAME_REF => ReadOutcome::Success(self.manufacturer.clone()),
            MODEL_NUMBER_REF => ReadOutcome::Success(self.model().clone()),
            _ => ReadOutcome::not_supported(),
        }
    }

    fn on_characteristic_write(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        central: &Central,
        characteristic: CharacteristicRef,
        value: &[u8],
    ) -> GattStatus {
        if characteristic != MODEL_NUMBER_REF {
            return GattStatus::RequestNotSupported;
        }
        if value.len() > MAX_ATTRIBUTE_LEN {
            debug!(
                "Model write from {} rejected: {} bytes exceeds {}",
                central,
                value.len(),
                MAX_ATTRIBUTE_LEN
            );
            return GattStatus::InvalidAttributeValueLength;
        }
        self.staged_models
            .insert(central.address.clone(), Bytes::copy_from_slice(value));
        GattStatus::Success
    }

    fn on_characteristic_write_completed(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        central: &Central,
        characteristic: CharacteristicRef,
        value: &[u8],
    ) {
        if characteristic != MODEL_NUMBER_REF {
            return;
        }
        // A completion without a staged write (e.g. write-without-response)
        // commits the completed bytes directly.
        let model = self
            .staged_models
            .remove(&central.address)
            .unwrap_or_else(|| Bytes::copy_from_slice(value));
        if model.len() > MAX_ATTRIBUTE_LEN {
            return;
        }
        info!(
            "Model number set by {}: {}",
            central,
            String::from_utf8_lossy(&model)
        );
        self.committed_model = Some(model);
    }

    fn on_central_disconnected(&mut self, _ctx: &mut ServiceContext<'_>, central: &Central) {
        if self.staged_models.remove(&central.address).is_some() {
            debug!("Dropped staged model write from {}", central);
        }
    }
}
