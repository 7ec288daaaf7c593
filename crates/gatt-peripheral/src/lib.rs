//! BLE GATT Peripheral Service Engine
//!
//! This crate implements the server side of a Bluetooth Low Energy GATT
//! peripheral: it owns a set of services, routes every remote read, write
//! and subscription to the handler that declared the characteristic,
//! tracks connected centrals, and drives periodic notifications while a
//! central is subscribed.
//!
//! # Architecture
//!
//! 1. **Transport** - the radio side, behind the [`Transport`] trait
//! 2. **Server** - [`PeripheralServer`] event loop fed by a [`ServerHandle`]
//! 3. **Handlers** - one [`ServiceHandler`] per GATT service
//! 4. **Codec** - fixed-layout characteristic values ([`codec`])
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use gatt_peripheral::{BroadcastSink, PeripheralConfig, PeripheralServer};
//! use gatt_peripheral::services::default_services;
//! use gatt_peripheral::uuids::{ENVIRONMENTAL_SENSING_SERVICE, HEART_RATE_SERVICE};
//!
//! #[tokio::main]
//! async fn main() -> gatt_peripheral::Result<()> {
//!     let config = PeripheralConfig::default();
//!     let sink = BroadcastSink::default();
//!     let mut events = sink.subscribe();
//!
//!     let (mut server, handle) = PeripheralServer::new(my_transport, sink, config.clone());
//!     for service in default_services(&config) {
//!         server.register_service(service)?;
//!     }
//!     server.start_advertising(HEART_RATE_SERVICE, &[])?;
//!     server.start_advertising(ENVIRONMENTAL_SENSING_SERVICE, &[])?;
//!
//!     tokio::spawn(server.run());
//!     // Feed radio callbacks through `handle`, read UI events from `events`
//!     Ok(())
//! }
//! ```
//!
//! # Wire Formats
//!
//! - Short float: 4 bytes, 24-bit mantissa and 8-bit decimal exponent
//! - Current Time: 10 bytes
//! - Heart Rate Measurement: flags byte plus uint8 value
//! - Temperature Measurement: flags byte plus short float

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Data model and encoding
pub mod codec;
pub mod error;
pub mod gatt;
pub mod uuids;

// Bookkeeping
pub mod central;
pub mod scheduler;
pub mod subscription;

// Boundaries
pub mod config;
pub mod events;
pub mod transport;

// Routing and behavior
pub mod handler;
pub mod server;
pub mod services;

// Testing utilities
pub mod test_utils;

pub use central::{Central, ConnectionRegistry};
pub use config::{
    DeviceConfig, NotificationConfig, PeripheralConfig, PeripheralConfigBuilder, SensorConfig,
    ServerConfig,
};
pub use error::{PeripheralError, Result};
pub use events::{AdvertiserState, BroadcastSink, EventSink, NullSink, UiEvent};
pub use gatt::{
    Characteristic, CharacteristicRef, Descriptor, DescriptorRef, GattService, GattStatus,
    Permissions, Properties, ReadOutcome, SecurityLevel,
};
pub use handler::{ServiceContext, ServiceHandler};
pub use scheduler::{NotificationScheduler, Tick, TickTimer};
pub use server::{PeripheralServer, ServerCommand, ServerHandle, ServerStats};
pub use subscription::{CccdValue, NotifyMode, SubscriptionTable};
pub use transport::{
    AdvertiseData, AdvertiseError, AdvertiseMode, AdvertiseSettings, PushOutcome, Transport,
    TxPowerLevel,
};

pub use test_utils::{MockTransport, RecordingSink, TestContext, TestFixture};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
