//! Test doubles for driving the peripheral without a radio
//!
//! - [`MockTransport`] records services, advertising requests and pushes,
//!   and can be told to refuse pushes or advertising
//! - [`RecordingSink`] keeps every UI event
//! - [`TestContext`] builds a [`ServiceContext`] for calling one handler
//!   directly
//! - [`TestFixture`] wires a [`PeripheralServer`] to the two doubles
//!
//! Clones of a double share state, so a test can keep one copy while the
//! server owns the other.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut fixture = TestFixture::with_default_services();
//! let central = Central::new("AA:BB:CC:DD:EE:FF");
//! fixture.server.on_central_connected(central.clone());
//! fixture.server.on_descriptor_write(&central, HEART_RATE_MEASUREMENT_REF.cccd(), &[1, 0]);
//! assert_eq!(fixture.transport.pushes().len(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::central::{Central, ConnectionRegistry};
use crate::config::{PeripheralConfig, PeripheralConfigBuilder};
use crate::error::{PeripheralError, Result};
use crate::events::{EventSink, UiEvent};
use crate::gatt::{CharacteristicRef, GattService};
use crate::handler::{RejectedPush, ServiceContext};
use crate::scheduler::{Tick, TickTimer};
use crate::server::{PeripheralServer, ServerHandle, ServerStats};
use crate::services::default_services;
use crate::subscription::{NotifyMode, SubscriptionTable};
use crate::transport::{AdvertiseData, AdvertiseSettings, PushOutcome, Transport};

/// A push the mock transport accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPush {
    /// Receiving central's address
    pub address: String,
    /// Source characteristic
    pub characteristic: CharacteristicRef,
    /// Pushed bytes
    pub value: Bytes,
    /// Notify or indicate
    pub mode: NotifyMode,
}

#[derive(Debug, Default)]
struct MockState {
    services: Vec<GattService>,
    advertise_starts: Vec<AdvertiseData>,
    advertise_stops: usize,
    pushes: Vec<RecordedPush>,
    reject_pushes: bool,
    fail_advertising: bool,
}

/// Mock transport for testing without a Bluetooth controller
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Services added so far
    pub fn services(&self) -> Vec<GattService> {
        self.state.lock().services.clone()
    }

    /// Advertising data of every start request
    pub fn advertise_starts(&self) -> Vec<AdvertiseData> {
        self.state.lock().advertise_starts.clone()
    }

    /// Number of stop requests
    pub fn advertise_stops(&self) -> usize {
        self.state.lock().advertise_stops
    }

    /// Accepted pushes, oldest first
    pub fn pushes(&self) -> Vec<RecordedPush> {
        self.state.lock().pushes.clone()
    }

    /// Accepted pushes on one characteristic
    pub fn pushes_for(&self, characteristic: CharacteristicRef) -> Vec<RecordedPush> {
        self.state
            .lock()
            .pushes
            .iter()
            .filter(|p| p.characteristic == characteristic)
            .cloned()
            .collect()
    }

    /// Forget recorded pushes
    pub fn clear_pushes(&self) {
        self.state.lock().pushes.clear();
    }

    /// Refuse every push from now on
    pub fn reject_pushes(&self, reject: bool) {
        self.state.lock().reject_pushes = reject;
    }

    /// Fail every advertising request from now on
    pub fn fail_advertising(&self, fail: bool) {
        self.state.lock().fail_advertising = fail;
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        "MockTransport"
    }

    fn add_service(&mut self, service: &GattService) -> Result<()> {
        self.state.lock().services.push(service.clone());
        Ok(())
    }

    fn start_advertising(
        &mut self,
        _settings: &AdvertiseSettings,
        advertise_data: &AdvertiseData,
        _scan_response: &AdvertiseData,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_advertising {
            return Err(PeripheralError::AdvertisingUnsupported(
                "simulated controller".into(),
            ));
        }
        state.advertise_starts.push(advertise_data.clone());
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<()> {
        self.state.lock().advertise_stops += 1;
        Ok(())
    }

    fn push_notification(
        &mut self,
        central: &Central,
        characteristic: &CharacteristicRef,
        value: &[u8],
        mode: NotifyMode,
    ) -> PushOutcome {
        let mut state = self.state.lock();
        if state.reject_pushes {
            return PushOutcome::Rejected("simulated rejection".into());
        }
        state.pushes.push(RecordedPush {
            address: central.address.clone(),
            characteristic: *characteristic,
            value: Bytes::copy_from_slice(value),
            mode,
        });
        PushOutcome::Accepted
    }
}

/// Sink that records every event
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<UiEvent>>>,
}

impl RecordingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Events so far, oldest first
    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().clone()
    }

    /// Events with the given wire name
    pub fn events_named(&self, name: &str) -> Vec<UiEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    /// Forget recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: UiEvent) {
        self.events.lock().push(event);
    }
}

/// Owned state behind a [`ServiceContext`] for calling handlers directly
pub struct TestContext {
    /// Transport pushes go to
    pub transport: MockTransport,
    /// Sink events go to
    pub sink: RecordingSink,
    /// Connected centrals
    pub registry: ConnectionRegistry,
    /// Subscriptions handlers see
    pub subscriptions: SubscriptionTable,
    /// Ticks armed by handler schedulers
    pub ticks: mpsc::UnboundedReceiver<Tick>,
    /// Counters updated by pushes
    pub stats: ServerStats,
    timer: TickTimer,
    rejected: VecDeque<RejectedPush>,
}

impl TestContext {
    /// Create an empty context
    pub fn new() -> Self {
        let (timer, ticks) = TickTimer::channel();
        Self {
            transport: MockTransport::new(),
            sink: RecordingSink::new(),
            registry: ConnectionRegistry::new(),
            subscriptions: SubscriptionTable::new(),
            ticks,
            stats: ServerStats::default(),
            timer,
            rejected: VecDeque::new(),
        }
    }

    /// Borrow a context for one handler call
    pub fn ctx(&mut self) -> ServiceContext<'_> {
        ServiceContext {
            transport: &mut self.transport,
            registry: &self.registry,
            subscriptions: &self.subscriptions,
            sink: &self.sink,
            timer: &self.timer,
            rejected: &mut self.rejected,
            stats: &mut self.stats,
        }
    }

    /// Connect a central on an open link
    pub fn connect(&mut self, address: &str) -> Central {
        let central = Central::new(address);
        self.registry.add(central.clone());
        central
    }

    /// Disconnect a central and drop its subscriptions
    pub fn disconnect(&mut self, address: &str) {
        self.registry.remove(address);
        self.subscriptions.remove_central(address);
    }

    /// Record a subscription
    pub fn subscribe(&mut self, address: &str, characteristic: CharacteristicRef, mode: NotifyMode) {
        self.subscriptions.enable(address, characteristic, mode);
    }

    /// Remove a subscription
    pub fn unsubscribe(&mut self, address: &str, characteristic: CharacteristicRef) {
        self.subscriptions.disable(address, characteristic);
    }

    /// Number of pushes refused so far
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Server wired to a mock transport and a recording sink
pub struct TestFixture {
    /// Server under test, driven through its synchronous callbacks
    pub server: PeripheralServer<MockTransport>,
    /// Handle for the server's command queue
    pub handle: ServerHandle,
    /// Shared view of the server's transport
    pub transport: MockTransport,
    /// Shared view of the server's sink
    pub sink: RecordingSink,
    /// Configuration the server was built with
    pub config: PeripheralConfig,
}

impl TestFixture {
    /// Server without services
    pub fn new() -> Self {
        Self::with_config(PeripheralConfigBuilder::new().device_name("test").build())
    }

    /// Server without services using `config`
    pub fn with_config(config: PeripheralConfig) -> Self {
        let transport = MockTransport::new();
        let sink = RecordingSink::new();
        let (server, handle) = PeripheralServer::new(transport.clone(), sink.clone(), config.clone());
        Self {
            server,
            handle,
            transport,
            sink,
            config,
        }
    }

    /// Server with the four built-in services registered
    pub fn with_default_services() -> Self {
        let mut fixture = Self::new();
        for service in default_services(&fixture.config) {
            // Built-in services never collide
            if let Err(e) = fixture.server.register_service(service) {
                panic!("built-in service failed to register: {}", e);
            }
        }
        fixture
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuids;

    #[test]
    fn test_mock_transport_shared_state() {
        let mock = MockTransport::new();
        let mut owned = mock.clone();
        let central = Central::new("AA");
        let characteristic = CharacteristicRef::new(uuids::HEART_RATE_SERVICE, uuids::HEART_RATE_MEASUREMENT);

        assert!(owned
            .push_notification(&central, &characteristic, &[0, 60], NotifyMode::Notify)
            .is_accepted());
        assert_eq!(mock.pushes().len(), 1);

        mock.reject_pushes(true);
        assert!(!owned
            .push_notification(&central, &characteristic, &[0, 61], NotifyMode::Notify)
            .is_accepted());
        assert_eq!(mock.pushes().len(), 1);
    }

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.emit(UiEvent::HeartRate("70".into()));
        sink.emit(UiEvent::ModelName("x".into()));
        assert_eq!(sink.events_named("heart-rate").len(), 1);
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_fixture_registers_services() {
        let fixture = TestFixture::with_default_services();
        assert_eq!(fixture.server.service_count(), 4);
        assert_eq!(fixture.transport.services().len(), 4);
    }
}
