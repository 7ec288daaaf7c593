//! Environmental Sensing service (0x181A) with two temperature views
//!
//! One simulated Celsius reading feeds both characteristics: a flagged
//! Temperature Measurement (indicate) and a plain Fahrenheit float
//! (notify). A single scheduler drives the service; each tick advances
//! the reading once and pushes it to whichever view has subscribers.

use std::time::Duration;

use bytes::Bytes;
use chrono::NaiveDateTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::central::Central;
use crate::codec::{self, BytesReader, BytesWriter};
use crate::error::Result;
use crate::gatt::{
    Characteristic, CharacteristicRef, Descriptor, GattService, Permissions, Properties,
    ReadOutcome,
};
use crate::handler::{ServiceContext, ServiceHandler};
use crate::scheduler::{NotificationScheduler, Tick};
use crate::subscription::NotifyMode;
use crate::uuids;

/// Flagged Temperature Measurement
pub const TEMPERATURE_MEASUREMENT_REF: CharacteristicRef = CharacteristicRef::new(
    uuids::ENVIRONMENTAL_SENSING_SERVICE,
    uuids::TEMPERATURE_MEASUREMENT,
);

/// Plain Fahrenheit float
pub const TEMPERATURE_FAHRENHEIT_REF: CharacteristicRef = CharacteristicRef::new(
    uuids::ENVIRONMENTAL_SENSING_SERVICE,
    uuids::TEMPERATURE_FAHRENHEIT,
);

/// Ceiling of the simulated reading
pub const MAX_CELSIUS: i32 = 40;

/// Largest step per tick in either direction
pub const MAX_STEP: i32 = 5;

/// Decimal digits carried in the float mantissa
pub const FLOAT_PRECISION: i8 = 2;

const FLAG_FAHRENHEIT: u8 = 0;
const FLAG_TIMESTAMP: u8 = 1;
const FLAG_TYPE: u8 = 2;

/// Next simulated reading
pub fn next_temperature(current: i32, delta: i32) -> i32 {
    (current + delta).min(MAX_CELSIUS)
}

/// Convert Celsius to Fahrenheit
pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Convert Fahrenheit to Celsius
pub fn fahrenheit_to_celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

/// Temperature scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureUnit {
    /// Degrees Celsius
    #[default]
    Celsius,
    /// Degrees Fahrenheit
    Fahrenheit,
}

/// Temperature Measurement value
///
/// ```text
/// flags:u8  bit0 unit (1 = Fahrenheit), bit1 timestamp present, bit2 type present
/// value:FLOAT
/// timestamp:date-time (7 bytes, optional)
/// type:u8 (optional)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureMeasurement {
    /// Reading in `unit`
    pub value: f64,
    /// Scale of `value`
    pub unit: TemperatureUnit,
    /// Time of the reading
    pub timestamp: Option<NaiveDateTime>,
    /// Measurement location code
    pub temperature_type: Option<u8>,
}

impl TemperatureMeasurement {
    /// Reading without timestamp or type
    pub fn new(value: f64, unit: TemperatureUnit) -> Self {
        Self {
            value,
            unit,
            timestamp: None,
            temperature_type: None,
        }
    }

    /// Wire encoding
    pub fn encode(&self) -> Bytes {
        let mut flags = 0u8;
        if self.unit == TemperatureUnit::Fahrenheit {
            flags = codec::set_bit(flags, FLAG_FAHRENHEIT);
        }
        if self.timestamp.is_some() {
            flags = codec::set_bit(flags, FLAG_TIMESTAMP);
        }
        if self.temperature_type.is_some() {
            flags = codec::set_bit(flags, FLAG_TYPE);
        }

        let mut writer = BytesWriter::with_capacity(13);
        writer.u8(flags).float(self.value, FLOAT_PRECISION);
        if let Some(timestamp) = &self.timestamp {
            writer.date_time(timestamp);
        }
        if let Some(temperature_type) = self.temperature_type {
            writer.u8(temperature_type);
        }
        writer.into_bytes()
    }

    /// Decode a wire value
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = BytesReader::new(bytes);
        let flags = [reader.u8()?];
        let value = reader.float()?;
        let unit = if codec::test_bit(&flags, FLAG_FAHRENHEIT as usize) {
            TemperatureUnit::Fahrenheit
        } else {
            TemperatureUnit::Celsius
        };
        let timestamp = if codec::test_bit(&flags, FLAG_TIMESTAMP as usize) {
            Some(reader.date_time()?)
        } else {
            None
        };
        let temperature_type = if codec::test_bit(&flags, FLAG_TYPE as usize) {
            Some(reader.u8()?)
        } else {
            None
        };

        Ok(Self {
            value,
            unit,
            timestamp,
            temperature_type,
        })
    }

    /// Reading converted to Celsius
    pub fn celsius(&self) -> f64 {
        match self.unit {
            TemperatureUnit::Celsius => self.value,
            TemperatureUnit::Fahrenheit => fahrenheit_to_celsius(self.value),
        }
    }
}

/// Simulated thermometer
pub struct TemperatureService {
    service: GattService,
    celsius: i32,
    unit: TemperatureUnit,
    rng: StdRng,
    scheduler: NotificationScheduler,
}

impl TemperatureService {
    /// Create the service seeded at `initial_celsius`
    pub fn new(interval: Duration, initial_celsius: i32, unit: TemperatureUnit) -> Self {
        Self::with_rng(interval, initial_celsius, unit, StdRng::from_entropy())
    }

    /// Create the service with an explicit random source
    pub fn with_rng(interval: Duration, initial_celsius: i32, unit: TemperatureUnit, rng: StdRng) -> Self {
        let service = GattService::new(uuids::ENVIRONMENTAL_SENSING_SERVICE)
            .with_characteristic(
                Characteristic::new(
                    uuids::TEMPERATURE_MEASUREMENT,
                    Properties::READ | Properties::INDICATE,
                    Permissions::READ,
                )
                .with_cccd()
                .with_descriptor(Descriptor::user_description("Temperature")),
            )
            .with_characteristic(
                Characteristic::new(
                    uuids::TEMPERATURE_FAHRENHEIT,
                    Properties::READ | Properties::NOTIFY,
                    Permissions::READ,
                )
                .with_cccd()
                .with_descriptor(Descriptor::user_description("Temperature (F)")),
            );

        Self {
            service,
            celsius: initial_celsius,
            unit,
            rng,
            // Both views share one stream, keyed by the flagged characteristic
            scheduler: NotificationScheduler::new(TEMPERATURE_MEASUREMENT_REF, interval),
        }
    }

    /// Current simulated reading
    pub fn celsius(&self) -> i32 {
        self.celsius
    }

    /// Whether the push scheduler is running
    pub fn is_notifying(&self) -> bool {
        self.scheduler.is_active()
    }

    fn measurement(&self) -> Bytes {
        let celsius = f64::from(self.celsius);
        let value = match self.unit {
            TemperatureUnit::Celsius => celsius,
            TemperatureUnit::Fahrenheit => celsius_to_fahrenheit(celsius),
        };
        TemperatureMeasurement::new(value, self.unit).encode()
    }

    fn fahrenheit(&self) -> [u8; codec::FLOAT_LEN] {
        codec::encode_float(celsius_to_fahrenheit(f64::from(self.celsius)), FLOAT_PRECISION)
    }

    fn any_subscribers(ctx: &ServiceContext<'_>) -> bool {
        ctx.has_subscribers(TEMPERATURE_MEASUREMENT_REF) || ctx.has_subscribers(TEMPERATURE_FAHRENHEIT_REF)
    }

    fn push_next(&mut self, ctx: &mut ServiceContext<'_>) {
        let delta = self.rng.gen_range(-MAX_STEP..=MAX_STEP);
        self.celsius = next_temperature(self.celsius, delta);
        debug!("new temp: {}", self.celsius);

        if ctx.has_subscribers(TEMPERATURE_MEASUREMENT_REF) {
            let value = self.measurement();
            ctx.notify(TEMPERATURE_MEASUREMENT_REF, &value);
        }
        if ctx.has_subscribers(TEMPERATURE_FAHRENHEIT_REF) {
            let value = self.fahrenheit();
            ctx.notify(TEMPERATURE_FAHRENHEIT_REF, &value);
        }
    }

    fn stop_notifying(&mut self) {
        if self.scheduler.stop() {
            debug!("Temperature notifications stopped");
        }
    }

    fn owns(characteristic: CharacteristicRef) -> bool {
        characteristic == TEMPERATURE_MEASUREMENT_REF || characteristic == TEMPERATURE_FAHRENHEIT_REF
    }
}

impl ServiceHandler for TemperatureService {
    fn service(&self) -> &GattService {
        &self.service
    }

    fn name(&self) -> &str {
        "temperature"
    }

    fn on_characteristic_read(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _central: &Central,
        characteristic: CharacteristicRef,
    ) -> ReadOutcome {
        match characteristic {
            TEMPERATURE_MEASUREMENT_REF => ReadOutcome::Success(self.measurement()),
            TEMPERATURE_FAHRENHEIT_REF => ReadOutcome::success(self.fahrenheit().to_vec()),
            _ => ReadOutcome::not_supported(),
        }
    }

    fn on_notifying_enabled(
        &mut self,
        ctx: &mut ServiceContext<'_>,
        _central: &Central,
        characteristic: CharacteristicRef,
        _mode: NotifyMode,
    ) {
        if !Self::owns(characteristic) || !self.scheduler.start() {
            return;
        }
        self.push_next(ctx);
        self.scheduler.schedule_next(ctx.timer());
    }

    fn on_notifying_disabled(
        &mut self,
        ctx: &mut ServiceContext<'_>,
        _central: &Central,
        characteristic: CharacteristicRef,
    ) {
        if Self::owns(characteristic) && !Self::any_subscribers(ctx) {
            self.stop_notifying();
        }
    }

    fn on_central_disconnected(&mut self, ctx: &mut ServiceContext<'_>, _central: &Central) {
        if ctx.no_centrals() || !Self::any_subscribers(ctx) {
            self.stop_notifying();
        }
    }

    fn on_tick(&mut self, ctx: &mut ServiceContext<'_>, tick: &Tick) {
        if !self.scheduler.accept(tick) {
            return;
        }
        self.push_next(ctx);
        self.scheduler.schedule_next(ctx.timer());
    }

    fn shutdown(&mut self) {
        if self.scheduler.stop() {
            info!("Temperature scheduler stopped on shutdown");
        }
    }
}
