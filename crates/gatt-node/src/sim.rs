//! Simulated radio: a transport that accepts everything and a scripted central
//!
//! The transport reports completions back through the server handle the
//! way a controller would, so UI events flow exactly as they do on
//! hardware.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use gatt_peripheral::codec;
use gatt_peripheral::services::current_time::CURRENT_TIME_REF;
use gatt_peripheral::services::device_information::{MANUFACTURER_NAME_REF, MODEL_NUMBER_REF};
use gatt_peripheral::services::heart_rate::HEART_RATE_MEASUREMENT_REF;
use gatt_peripheral::services::temperature::{TEMPERATURE_FAHRENHEIT_REF, TEMPERATURE_MEASUREMENT_REF};
use gatt_peripheral::{
    AdvertiseData, AdvertiseSettings, Central, CharacteristicRef, GattService, GattStatus, NotifyMode,
    PushOutcome, ReadOutcome, ServerHandle, Transport,
};

/// Address of the scripted central
pub const SIM_CENTRAL: &str = "C0:FF:EE:00:00:01";

#[derive(Default)]
struct SimState {
    handle: Option<ServerHandle>,
    services: usize,
    pushes: u64,
}

/// Transport that loops every request back into the server
#[derive(Clone, Default)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route controller callbacks to `handle`
    pub fn attach(&self, handle: ServerHandle) {
        self.state.lock().handle = Some(handle);
    }

    /// Pushes accepted so far
    pub fn pushes(&self) -> u64 {
        self.state.lock().pushes
    }

    fn handle(&self) -> Option<ServerHandle> {
        self.state.lock().handle.clone()
    }
}

impl Transport for SimulatedTransport {
    fn name(&self) -> &str {
        "SimulatedTransport"
    }

    fn add_service(&mut self, service: &GattService) -> gatt_peripheral::Result<()> {
        let mut state = self.state.lock();
        state.services += 1;
        debug!(
            "Sim: service {} added ({} total)",
            service.uuid, state.services
        );
        Ok(())
    }

    fn start_advertising(
        &mut self,
        settings: &AdvertiseSettings,
        advertise_data: &AdvertiseData,
        _scan_response: &AdvertiseData,
    ) -> gatt_peripheral::Result<()> {
        info!(
            "Sim: advertising {} services ({:?}, {:?})",
            advertise_data.service_uuids.len(),
            settings.mode,
            settings.tx_power
        );
        if let Some(handle) = self.handle() {
            tokio::spawn(async move {
                let _ = handle.advertising_started().await;
            });
        }
        Ok(())
    }

    fn stop_advertising(&mut self) -> gatt_peripheral::Result<()> {
        debug!("Sim: advertising stopped");
        if let Some(handle) = self.handle() {
            tokio::spawn(async move {
                let _ = handle.advertising_stopped().await;
            });
        }
        Ok(())
    }

    fn push_notification(
        &mut self,
        central: &Central,
        characteristic: &CharacteristicRef,
        value: &[u8],
        mode: NotifyMode,
    ) -> PushOutcome {
        self.state.lock().pushes += 1;
        debug!("Sim: {:?} {} -> {} {:02X?}", mode, characteristic, central, value);

        if let Some(handle) = self.handle() {
            let central = central.clone();
            let characteristic = *characteristic;
            let value = Bytes::copy_from_slice(value);
            tokio::spawn(async move {
                let _ = handle
                    .notification_sent(central, characteristic, value, GattStatus::Success)
                    .await;
            });
        }
        PushOutcome::Accepted
    }
}

fn describe(outcome: &ReadOutcome) -> String {
    match outcome {
        ReadOutcome::Success(value) => String::from_utf8_lossy(value).into_owned(),
        ReadOutcome::Failure(status) => format!("failed: {}", status),
    }
}

async fn subscribe(
    handle: &ServerHandle,
    central: &Central,
    characteristic: CharacteristicRef,
    value: [u8; 2],
) -> gatt_peripheral::Result<()> {
    let status = handle
        .descriptor_write(central.clone(), characteristic.cccd(), value.to_vec())
        .await?;
    if !status.is_success() {
        warn!("Sim: CCCD write on {} refused: {}", characteristic, status);
    }
    Ok(())
}

/// Play one central session against the server
///
/// Connects, reads device information, renames the model, subscribes to
/// every pushing characteristic, waits `hold`, then disconnects.
pub async fn run_scripted_central(handle: &ServerHandle, model: &str, hold: Duration) -> gatt_peripheral::Result<()> {
    let central = Central::new(SIM_CENTRAL);
    handle.central_connected(central.clone()).await?;

    let manufacturer = handle
        .characteristic_read(central.clone(), MANUFACTURER_NAME_REF)
        .await?;
    info!("Sim: manufacturer = {}", describe(&manufacturer));

    let status = handle
        .characteristic_write(central.clone(), MODEL_NUMBER_REF, model.to_owned())
        .await?;
    if status.is_success() {
        handle
            .characteristic_write_completed(central.clone(), MODEL_NUMBER_REF, model.to_owned())
            .await?;
    }
    let read_back = handle
        .characteristic_read(central.clone(), MODEL_NUMBER_REF)
        .await?;
    info!("Sim: model = {}", describe(&read_back));

    if let ReadOutcome::Success(value) = handle
        .characteristic_read(central.clone(), CURRENT_TIME_REF)
        .await?
    {
        match codec::decode_current_time(&value) {
            Ok(time) => info!("Sim: peripheral clock = {}", time.date_time),
            Err(e) => warn!("Sim: bad current time: {}", e),
        }
    }

    subscribe(handle, &central, HEART_RATE_MEASUREMENT_REF, [1, 0]).await?;
    subscribe(handle, &central, CURRENT_TIME_REF, [1, 0]).await?;
    subscribe(handle, &central, TEMPERATURE_MEASUREMENT_REF, [2, 0]).await?;
    subscribe(handle, &central, TEMPERATURE_FAHRENHEIT_REF, [1, 0]).await?;

    tokio::time::sleep(hold).await;

    subscribe(handle, &central, HEART_RATE_MEASUREMENT_REF, [0, 0]).await?;
    handle.central_disconnected(central).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatt_peripheral::services::default_services;
    use gatt_peripheral::{PeripheralConfig, PeripheralServer, RecordingSink};

    #[tokio::test(start_paused = true)]
    async fn test_scripted_session_produces_events() {
        let config = PeripheralConfig::default();
        let transport = SimulatedTransport::new();
        let sink = RecordingSink::new();
        let (mut server, handle) = PeripheralServer::new(transport.clone(), sink.clone(), config.clone());
        transport.attach(handle.clone());
        for service in default_services(&config) {
            server.register_service(service).unwrap();
        }
        let task = tokio::spawn(server.run());

        run_scripted_central(&handle, "demo", Duration::from_millis(2500))
            .await
            .unwrap();
        handle.stats().await.unwrap();

        assert!(transport.pushes() > 0);
        assert!(!sink.events_named("heart-rate").is_empty());
        assert!(!sink.events_named("current-time").is_empty());
        assert_eq!(sink.events_named("model-name").len(), 1);
        assert_eq!(sink.events_named("connection-state").len(), 2);

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
