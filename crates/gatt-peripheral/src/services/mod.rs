//! Built-in service handlers
//!
//! - [`DeviceInformationService`]: manufacturer and writable model number
//! - [`CurrentTimeService`]: wall clock with periodic notifications
//! - [`HeartRateService`]: simulated pulse, notified
//! - [`TemperatureService`]: simulated temperature, indicated and notified

pub mod current_time;
pub mod device_information;
pub mod heart_rate;
pub mod temperature;

pub use current_time::CurrentTimeService;
pub use device_information::DeviceInformationService;
pub use heart_rate::HeartRateService;
pub use temperature::{TemperatureMeasurement, TemperatureService, TemperatureUnit};

use crate::config::PeripheralConfig;
use crate::handler::ServiceHandler;

/// All built-in services configured from `config`, in registration order
pub fn default_services(config: &PeripheralConfig) -> Vec<Box<dyn ServiceHandler>> {
    let interval = config.notifications.interval;
    vec![
        Box::new(DeviceInformationService::new(&config.device)),
        Box::new(CurrentTimeService::new(interval)),
        Box::new(HeartRateService::new(
            interval,
            config.sensors.initial_heart_rate,
        )),
        Box::new(TemperatureService::new(
            interval,
            config.sensors.initial_celsius,
            config.sensors.temperature_unit,
        )),
    ]
}
