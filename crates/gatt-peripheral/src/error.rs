//! Error types for GATT peripheral operations
//!
//! Only failures that abort an operation on the Rust side live here:
//! registration, advertising, payload decoding, configuration and the
//! server's command channel. Outcomes a remote central observes (a read
//! that is not supported, a rejected write, a refused notification) are
//! [`GattStatus`](crate::gatt::GattStatus) values instead.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for peripheral operations
#[derive(Error, Debug)]
pub enum PeripheralError {
    // ===== Registration Errors =====
    /// A service with this UUID is already registered
    #[error("Service already registered: {0}")]
    DuplicateService(Uuid),

    /// A service declares the same characteristic UUID twice
    #[error("Characteristic {characteristic} declared twice in service {service}")]
    DuplicateCharacteristic {
        /// Owning service
        service: Uuid,
        /// Repeated characteristic
        characteristic: Uuid,
    },

    /// A notify/indicate characteristic is missing its CCCD
    #[error("Characteristic {characteristic} supports notify/indicate but has no CCCD")]
    MissingCccd {
        /// Offending characteristic
        characteristic: Uuid,
    },

    // ===== Advertising Errors =====
    /// Services cannot be added once advertising has been requested
    #[error("Advertising already started, routing table is frozen")]
    AlreadyAdvertising,

    /// Advertisement payload does not fit a legacy advertising PDU
    #[error("Advertising data too large: {size} bytes exceeds maximum of {max} bytes")]
    AdvertiseDataTooLarge {
        /// Encoded payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// The radio cannot advertise at all
    #[error("Advertising not supported: {0}")]
    AdvertisingUnsupported(String),

    /// The transport reported an advertising failure
    #[error("Advertising failed: {0}")]
    AdvertiseFailed(String),

    /// Generic transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    // ===== Codec Errors =====
    /// Not enough bytes left to decode a field
    #[error("Payload too short: needed {needed} bytes, got {got}")]
    PayloadTooShort {
        /// Bytes required
        needed: usize,
        /// Bytes available
        got: usize,
    },

    /// Bytes present but not a valid encoding
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== Server Errors =====
    /// Server event loop is not running
    #[error("Peripheral server is not running")]
    ServerNotRunning,

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeripheralError {
    /// Whether this error must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PeripheralError::DuplicateService(_)
                | PeripheralError::DuplicateCharacteristic { .. }
                | PeripheralError::MissingCccd { .. }
                | PeripheralError::AdvertisingUnsupported(_)
        )
    }

    /// Check if this is a decoding error (bad bytes from a central)
    pub fn is_codec_error(&self) -> bool {
        matches!(
            self,
            PeripheralError::PayloadTooShort { .. } | PeripheralError::InvalidPayload(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            PeripheralError::DuplicateService(_) => "DUPLICATE_SERVICE",
            PeripheralError::DuplicateCharacteristic { .. } => "DUPLICATE_CHARACTERISTIC",
            PeripheralError::MissingCccd { .. } => "MISSING_CCCD",
            PeripheralError::AlreadyAdvertising => "ALREADY_ADVERTISING",
            PeripheralError::AdvertiseDataTooLarge { .. } => "ADVERTISE_DATA_TOO_LARGE",
            PeripheralError::AdvertisingUnsupported(_) => "ADVERTISING_UNSUPPORTED",
            PeripheralError::AdvertiseFailed(_) => "ADVERTISE_FAILED",
            PeripheralError::Transport(_) => "TRANSPORT_ERROR",
            PeripheralError::PayloadTooShort { .. } => "PAYLOAD_TOO_SHORT",
            PeripheralError::InvalidPayload(_) => "INVALID_PAYLOAD",
            PeripheralError::InvalidConfig(_) => "INVALID_CONFIG",
            PeripheralError::ServerNotRunning => "SERVER_NOT_RUNNING",
            PeripheralError::ChannelClosed => "CHANNEL_CLOSED",
            PeripheralError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for peripheral operations
pub type Result<T> = std::result::Result<T, PeripheralError>;

// Configuration files are JSON
impl From<serde_json::Error> for PeripheralError {
    fn from(err: serde_json::Error) -> Self {
        PeripheralError::InvalidConfig(err.to_string())
    }
}

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PeripheralError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        PeripheralError::ChannelClosed
    }
}
