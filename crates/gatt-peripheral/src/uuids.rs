//! Bluetooth SIG assigned numbers used by the built-in services
//!
//! 16-bit assigned numbers expand into the Bluetooth base UUID
//! `0000xxxx-0000-1000-8000-00805f9b34fb`.

use uuid::Uuid;

/// Bluetooth base UUID
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_bytes([
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb,
]);

/// Expand a 16-bit assigned number into a full UUID
pub const fn uuid16(short: u16) -> Uuid {
    let mut bytes = BLUETOOTH_BASE_UUID.into_bytes();
    bytes[2] = (short >> 8) as u8;
    bytes[3] = (short & 0xff) as u8;
    Uuid::from_bytes(bytes)
}

/// Return the 16-bit alias if `uuid` lies in the Bluetooth base range
pub fn as_uuid16(uuid: &Uuid) -> Option<u16> {
    let bytes = uuid.as_bytes();
    let base = BLUETOOTH_BASE_UUID.as_bytes();
    if bytes[0] == 0 && bytes[1] == 0 && bytes[4..] == base[4..] {
        Some(u16::from_be_bytes([bytes[2], bytes[3]]))
    } else {
        None
    }
}

// Services
/// Device Information service
pub const DEVICE_INFORMATION_SERVICE: Uuid = uuid16(0x180A);
/// Current Time service
pub const CURRENT_TIME_SERVICE: Uuid = uuid16(0x1805);
/// Heart Rate service
pub const HEART_RATE_SERVICE: Uuid = uuid16(0x180D);
/// Environmental Sensing service (hosts the temperature characteristics)
pub const ENVIRONMENTAL_SENSING_SERVICE: Uuid = uuid16(0x181A);

// Device Information characteristics
/// Manufacturer Name String
pub const MANUFACTURER_NAME: Uuid = uuid16(0x2A29);
/// Model Number String
pub const MODEL_NUMBER: Uuid = uuid16(0x2A24);

// Current Time characteristics
/// Current Time (10-byte exact time)
pub const CURRENT_TIME: Uuid = uuid16(0x2A2B);
/// Local Time Information (time zone + DST offset)
pub const LOCAL_TIME_INFORMATION: Uuid = uuid16(0x2A0F);

// Heart Rate characteristics
/// Heart Rate Measurement
pub const HEART_RATE_MEASUREMENT: Uuid = uuid16(0x2A37);

// Temperature characteristics
/// Temperature Measurement (flags + FLOAT)
pub const TEMPERATURE_MEASUREMENT: Uuid = uuid16(0x2A1C);
/// Temperature Fahrenheit (FLOAT)
pub const TEMPERATURE_FAHRENHEIT: Uuid = uuid16(0x2A20);

// Descriptors
/// Characteristic User Description
pub const CHARACTERISTIC_USER_DESCRIPTION: Uuid = uuid16(0x2901);
/// Client Characteristic Configuration
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = uuid16(0x2902);
