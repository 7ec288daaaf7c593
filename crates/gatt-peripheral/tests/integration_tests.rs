//! Integration tests for the GATT peripheral server
//!
//! These tests drive a running server through its handle, the way a radio
//! transport would:
//! - Subscription gating and periodic notifications
//! - Scheduler shutdown on disconnect and unsubscribe
//! - Write then read of the model number
//! - Routing misses and transport rejections
//! - UI events derived from completed pushes

use std::time::Duration;

use gatt_peripheral::codec;
use gatt_peripheral::services::current_time::CURRENT_TIME_REF;
use gatt_peripheral::services::device_information::{MANUFACTURER_NAME_REF, MODEL_NUMBER_REF};
use gatt_peripheral::services::heart_rate::{decode_measurement, HEART_RATE_MEASUREMENT_REF};
use gatt_peripheral::services::temperature::{TEMPERATURE_FAHRENHEIT_REF, TEMPERATURE_MEASUREMENT_REF};
use gatt_peripheral::services::{TemperatureMeasurement, TemperatureUnit};
use gatt_peripheral::uuids;
use gatt_peripheral::{
    AdvertiseError, AdvertiserState, Central, CharacteristicRef, GattStatus, MockTransport, NotifyMode,
    PeripheralError, ReadOutcome, RecordingSink, ServerHandle, TestFixture, UiEvent, VERSION,
};
use tokio::task::JoinHandle;

const PHONE: &str = "AA:BB:CC:DD:EE:01";
const WATCH: &str = "AA:BB:CC:DD:EE:02";

// ============================================================================
// Harness
// ============================================================================

struct Running {
    handle: ServerHandle,
    transport: MockTransport,
    sink: RecordingSink,
    task: JoinHandle<gatt_peripheral::Result<()>>,
}

impl Running {
    fn start() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("gatt_peripheral=debug,integration_tests=debug")
            .with_test_writer()
            .try_init();

        let TestFixture {
            server,
            handle,
            transport,
            sink,
            ..
        } = TestFixture::with_default_services();
        let task = tokio::spawn(server.run());
        Self {
            handle,
            transport,
            sink,
            task,
        }
    }

    /// Round-trip through the command queue so earlier commands are processed
    async fn settle(&self) {
        self.handle.stats().await.unwrap();
    }

    async fn connect(&self, address: &str) -> Central {
        let central = Central::new(address);
        self.handle.central_connected(central.clone()).await.unwrap();
        central
    }

    async fn subscribe(&self, central: &Central, characteristic: CharacteristicRef, value: [u8; 2]) -> GattStatus {
        self.handle
            .descriptor_write(central.clone(), characteristic.cccd(), value.to_vec())
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.handle.shutdown().await.unwrap();
        self.task.await.unwrap().unwrap();
    }
}

// ============================================================================
// Notification lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_no_pushes_without_subscription() {
    let server = Running::start();
    let _phone = server.connect(PHONE).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    server.settle().await;

    assert!(server.transport.pushes().is_empty());
    server.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscription_drives_periodic_pushes() {
    let server = Running::start();
    let phone = server.connect(PHONE).await;

    let status = server.subscribe(&phone, HEART_RATE_MEASUREMENT_REF, [1, 0]).await;
    assert_eq!(status, GattStatus::Success);

    // One immediate push, then one per second
    tokio::time::sleep(Duration::from_millis(3500)).await;
    server.settle().await;

    let pushes = server.transport.pushes_for(HEART_RATE_MEASUREMENT_REF);
    assert_eq!(pushes.len(), 4);
    for push in &pushes {
        assert_eq!(push.address, PHONE);
        assert_eq!(push.mode, NotifyMode::Notify);
        let bpm = decode_measurement(&push.value).unwrap();
        assert!(bpm <= 120, "bpm {} above ceiling", bpm);
    }

    server.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_notifier() {
    let server = Running::start();
    let phone = server.connect(PHONE).await;
    server.subscribe(&phone, HEART_RATE_MEASUREMENT_REF, [1, 0]).await;
    server.subscribe(&phone, CURRENT_TIME_REF, [1, 0]).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    server.handle.central_disconnected(phone.clone()).await.unwrap();
    server.settle().await;
    server.transport.clear_pushes();

    tokio::time::sleep(Duration::from_secs(5)).await;
    server.settle().await;
    assert!(server.transport.pushes().is_empty());

    let stats = server.handle.stats().await.unwrap();
    assert_eq!(stats.disconnections, 1);
    server.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unconnected_central_cannot_subscribe() {
    let server = Running::start();
    let stranger = Central::new(PHONE);

    let status = server.subscribe(&stranger, HEART_RATE_MEASUREMENT_REF, [1, 0]).await;
    assert_eq!(status, GattStatus::UnlikelyError);

    // Connecting later does not revive the refused subscription
    server.handle.central_connected(stranger.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    server.settle().await;

    let stats = server.handle.stats().await.unwrap();
    assert_eq!(stats.ticks, 0);
    assert!(server.transport.pushes().is_empty());
    server.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_remaining_subscriber_keeps_notifier() {
    let server = Running::start();
    let phone = server.connect(PHONE).await;
    let watch = server.connect(WATCH).await;
    server.subscribe(&phone, HEART_RATE_MEASUREMENT_REF, [1, 0]).await;
    server.subscribe(&watch, HEART_RATE_MEASUREMENT_REF, [1, 0]).await;

    server.subscribe(&phone, HEART_RATE_MEASUREMENT_REF, [0, 0]).await;
    server.transport.clear_pushes();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    server.settle().await;

    let pushes = server.transport.pushes();
    assert_eq!(pushes.len(), 2);
    assert!(pushes.iter().all(|p| p.address == WATCH));
    server.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_discards_stale_ticks() {
    let server = Running::start();
    let phone = server.connect(PHONE).await;

    server.subscribe(&phone, HEART_RATE_MEASUREMENT_REF, [1, 0]).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    server.subscribe(&phone, HEART_RATE_MEASUREMENT_REF, [0, 0]).await;
    server.subscribe(&phone, HEART_RATE_MEASUREMENT_REF, [1, 0]).await;

    // The first schedule would have fired at 1.0s; the restart fires at 1.5s
    tokio::time::sleep(Duration::from_millis(700)).await;
    server.settle().await;
    assert_eq!(server.transport.pushes().len(), 2);

    tokio::time::sleep(Duration::from_millis(500)).await;
    server.settle().await;
    assert_eq!(server.transport.pushes().len(), 3);
    server.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_temperature_indicates_and_notifies() {
    let server = Running::start();
    let phone = server.connect(PHONE).await;

    // Measurement indicates only
    assert_eq!(
        server.subscribe(&phone, TEMPERATURE_MEASUREMENT_REF, [1, 0]).await,
        GattStatus::RequestNotSupported
    );
    assert_eq!(
        server.subscribe(&phone, TEMPERATURE_MEASUREMENT_REF, [2, 0]).await,
        GattStatus::Success
    );
    assert_eq!(
        server.subscribe(&phone, TEMPERATURE_FAHRENHEIT_REF, [1, 0]).await,
        GattStatus::Success
    );

    tokio::time::sleep(Duration::from_millis(1500)).await;
    server.settle().await;

    let indications = server.transport.pushes_for(TEMPERATURE_MEASUREMENT_REF);
    assert_eq!(indications.len(), 2);
    assert!(indications.iter().all(|p| p.mode == NotifyMode::Indicate));
    for push in &indications {
        let measurement = TemperatureMeasurement::decode(&push.value).unwrap();
        assert!(measurement.celsius() <= 40.0);
    }

    let notifications = server.transport.pushes_for(TEMPERATURE_FAHRENHEIT_REF);
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].value.len(), codec::FLOAT_LEN);

    server.stop().await;
}

// ============================================================================
// Reads and writes
// ============================================================================

#[tokio::test]
async fn test_model_write_then_read() {
    let server = Running::start();
    let phone = server.connect(PHONE).await;

    let status = server
        .handle
        .characteristic_write(phone.clone(), MODEL_NUMBER_REF, &b"Sensor-7"[..])
        .await
        .unwrap();
    assert_eq!(status, GattStatus::Success);
    server
        .handle
        .characteristic_write_completed(phone.clone(), MODEL_NUMBER_REF, &b"Sensor-7"[..])
        .await
        .unwrap();

    let outcome = server
        .handle
        .characteristic_read(phone.clone(), MODEL_NUMBER_REF)
        .await
        .unwrap();
    assert_eq!(outcome, ReadOutcome::success(&b"Sensor-7"[..]));
    assert!(server
        .sink
        .events()
        .contains(&UiEvent::ModelName("Sensor-7".into())));

    let manufacturer = server
        .handle
        .characteristic_read(phone, MANUFACTURER_NAME_REF)
        .await
        .unwrap();
    assert_eq!(manufacturer, ReadOutcome::success(&b"Univrs"[..]));

    server.stop().await;
}

#[tokio::test]
async fn test_reads_return_encoded_values() {
    let server = Running::start();
    let phone = server.connect(PHONE).await;

    let time = server
        .handle
        .characteristic_read(phone.clone(), CURRENT_TIME_REF)
        .await
        .unwrap();
    let bytes = time.value().unwrap();
    assert_eq!(bytes.len(), codec::CURRENT_TIME_LEN);
    assert!(codec::decode_current_time(bytes).is_ok());

    let heart = server
        .handle
        .characteristic_read(phone.clone(), HEART_RATE_MEASUREMENT_REF)
        .await
        .unwrap();
    assert_eq!(heart, ReadOutcome::success(vec![0x00, 0x40]));

    let temperature = server
        .handle
        .characteristic_read(phone, TEMPERATURE_MEASUREMENT_REF)
        .await
        .unwrap();
    let measurement = TemperatureMeasurement::decode(temperature.value().unwrap()).unwrap();
    assert_eq!(measurement.unit, TemperatureUnit::Celsius);
    assert_eq!(measurement.value, 22.0);

    server.stop().await;
}

#[tokio::test]
async fn test_unrouted_requests() {
    let server = Running::start();
    let phone = server.connect(PHONE).await;
    let unknown = CharacteristicRef::new(uuids::uuid16(0x1816), uuids::uuid16(0x2A5B));

    let read = server
        .handle
        .characteristic_read(phone.clone(), unknown)
        .await
        .unwrap();
    assert_eq!(read, ReadOutcome::Failure(GattStatus::RequestNotSupported));

    let write = server
        .handle
        .characteristic_write(phone.clone(), unknown, vec![1])
        .await
        .unwrap();
    assert_eq!(write, GattStatus::RequestNotSupported);

    // Manufacturer name is read-only
    let write = server
        .handle
        .characteristic_write(phone, MANUFACTURER_NAME_REF, &b"Other"[..])
        .await
        .unwrap();
    assert_eq!(write, GattStatus::WriteNotPermitted);

    let stats = server.handle.stats().await.unwrap();
    assert_eq!(stats.routing_misses, 2);
    assert_eq!(stats.reads, 1);
    assert_eq!(stats.writes, 2);

    server.stop().await;
}

#[tokio::test]
async fn test_cccd_read_reflects_subscription() {
    let server = Running::start();
    let phone = server.connect(PHONE).await;
    let watch = server.connect(WATCH).await;

    server.subscribe(&phone, CURRENT_TIME_REF, [1, 0]).await;

    let phone_view = server
        .handle
        .descriptor_read(phone, CURRENT_TIME_REF.cccd())
        .await
        .unwrap();
    assert_eq!(phone_view, ReadOutcome::success(vec![1, 0]));

    let watch_view = server
        .handle
        .descriptor_read(watch, CURRENT_TIME_REF.cccd())
        .await
        .unwrap();
    assert_eq!(watch_view, ReadOutcome::success(vec![0, 0]));

    server.stop().await;
}

// ============================================================================
// Push completion and UI events
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_heart_rate_event_after_notification_sent() {
    let server = Running::start();
    let phone = server.connect(PHONE).await;
    server.subscribe(&phone, HEART_RATE_MEASUREMENT_REF, [1, 0]).await;

    let push = server.transport.pushes()[0].clone();
    let bpm = decode_measurement(&push.value).unwrap();
    assert!(server.sink.events_named("heart-rate").is_empty());

    server
        .handle
        .notification_sent(phone, HEART_RATE_MEASUREMENT_REF, push.value, GattStatus::Success)
        .await
        .unwrap();
    server.settle().await;

    assert_eq!(
        server.sink.events_named("heart-rate"),
        vec![UiEvent::HeartRate(bpm.to_string())]
    );
    server.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_push_reported_as_failure() {
    let server = Running::start();
    let phone = server.connect(PHONE).await;
    server.transport.reject_pushes(true);

    server.subscribe(&phone, HEART_RATE_MEASUREMENT_REF, [1, 0]).await;
    server.settle().await;

    let stats = server.handle.stats().await.unwrap();
    assert_eq!(stats.notifications_rejected, 1);
    assert_eq!(stats.notifications_pushed, 0);
    assert!(server.transport.pushes().is_empty());
    assert!(server.sink.events_named("heart-rate").is_empty());

    // The scheduler keeps running while the subscription stands
    server.transport.reject_pushes(false);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    server.settle().await;
    assert_eq!(server.transport.pushes().len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_connection_state_events() {
    let server = Running::start();
    let phone = server.connect(PHONE).await;
    server.handle.central_disconnected(phone).await.unwrap();
    server.settle().await;

    assert_eq!(
        server.sink.events_named("connection-state"),
        vec![
            UiEvent::ConnectionState(format!("connected to MAC: {}", PHONE)),
            UiEvent::ConnectionState(format!("DISCONNECTED from MAC: {}", PHONE)),
        ]
    );
    server.stop().await;
}

// ============================================================================
// Advertising
// ============================================================================

#[tokio::test]
async fn test_advertising_through_handle() {
    let server = Running::start();

    server
        .handle
        .start_advertising(uuids::HEART_RATE_SERVICE, Vec::new())
        .await
        .unwrap();
    server
        .handle
        .start_advertising(uuids::ENVIRONMENTAL_SENSING_SERVICE, Vec::new())
        .await
        .unwrap();
    server.handle.advertising_started().await.unwrap();

    let starts = server.transport.advertise_starts();
    assert_eq!(starts.len(), 2);
    assert_eq!(
        starts[1].service_uuids,
        vec![uuids::HEART_RATE_SERVICE, uuids::ENVIRONMENTAL_SENSING_SERVICE]
    );

    let err = server
        .handle
        .register_service(Box::new(gatt_peripheral::services::HeartRateService::new(
            Duration::from_secs(1),
            80,
        )))
        .await
        .unwrap_err();
    assert!(matches!(err, PeripheralError::AlreadyAdvertising));

    server
        .handle
        .advertising_failed(AdvertiseError::DataTooLarge)
        .await
        .unwrap();
    server.handle.stop_advertising().await.unwrap();
    server.settle().await;

    assert_eq!(
        server.sink.events_named("advertiser-state"),
        vec![
            UiEvent::AdvertiserState(AdvertiserState::On),
            UiEvent::AdvertiserState(AdvertiserState::Off),
        ]
    );
    assert_eq!(server.transport.advertise_stops(), 2);
    server.stop().await;
}

#[tokio::test]
async fn test_handle_after_shutdown() {
    let server = Running::start();
    let handle = server.handle.clone();
    server.stop().await;

    let err = handle.stats().await.unwrap_err();
    assert!(matches!(err, PeripheralError::ServerNotRunning));
    assert!(!VERSION.is_empty());
}
