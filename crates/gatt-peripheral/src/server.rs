//! PeripheralServer - GATT request routing and lifecycle
//!
//! The server owns every registered [`ServiceHandler`], the set of
//! connected centrals and the subscription table. All transport callbacks
//! and all scheduler ticks are processed one at a time on the server's
//! event loop, so handler state needs no locking.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  ServerCommand   ┌───────────────────────────────┐
//! │  Transport   │ ───────────────► │       PeripheralServer        │
//! │  callbacks   │  (ServerHandle)  │                               │
//! └──────────────┘                  │  routes: CharacteristicRef ─┐ │
//!        ▲                          │  registry / subscriptions   │ │
//!        │ push_notification        │                             ▼ │
//!        └───────────────────────── │  ServiceHandler (ctx) ◄─ Tick │
//!                                   └───────────────┬───────────────┘
//!                                                   │ UiEvent
//!                                                   ▼
//!                                              EventSink
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gatt_peripheral::{PeripheralServer, PeripheralConfig, BroadcastSink};
//! use gatt_peripheral::services::default_services;
//!
//! let config = PeripheralConfig::default();
//! let (mut server, handle) = PeripheralServer::new(transport, BroadcastSink::default(), config.clone());
//! for service in default_services(&config) {
//!     server.register_service(service)?;
//! }
//! server.start_advertising(HEART_RATE_SERVICE, &[])?;
//! tokio::spawn(server.run());
//! ```

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::central::{Central, ConnectionRegistry};
use crate::config::PeripheralConfig;
use crate::error::{PeripheralError, Result};
use crate::events::{AdvertiserState, EventSink, UiEvent};
use crate::gatt::{CharacteristicRef, DescriptorRef, GattStatus, ReadOutcome};
use crate::handler::{RejectedPush, ServiceContext, ServiceHandler};
use crate::scheduler::{Tick, TickTimer};
use crate::subscription::{CccdValue, NotifyMode, SubscriptionTable};
use crate::transport::{
    AdvertiseData, AdvertiseError, Transport, ADVERTISE_FLAGS_LEN, MAX_LEGACY_ADVERTISE_LEN,
};
use crate::uuids;

/// Commands delivered to the server's event loop
pub enum ServerCommand {
    /// Add a service before advertising
    RegisterService {
        /// Handler owning the service
        handler: Box<dyn ServiceHandler>,
        /// Registration result
        reply: oneshot::Sender<Result<()>>,
    },
    /// Start (or extend) advertising
    StartAdvertising {
        /// Service to advertise
        primary: Uuid,
        /// Further services to advertise
        extras: Vec<Uuid>,
        /// Request result
        reply: oneshot::Sender<Result<()>>,
    },
    /// Stop advertising
    StopAdvertising(oneshot::Sender<Result<()>>),
    /// A central reads a characteristic
    CharacteristicRead {
        /// Requesting central
        central: Central,
        /// Target
        characteristic: CharacteristicRef,
        /// Value or failure
        reply: oneshot::Sender<ReadOutcome>,
    },
    /// A central writes a characteristic
    CharacteristicWrite {
        /// Requesting central
        central: Central,
        /// Target
        characteristic: CharacteristicRef,
        /// Written bytes
        value: Bytes,
        /// Status for the central
        reply: oneshot::Sender<GattStatus>,
    },
    /// A characteristic write finished
    CharacteristicWriteCompleted {
        /// Writing central
        central: Central,
        /// Target
        characteristic: CharacteristicRef,
        /// Written bytes
        value: Bytes,
    },
    /// A central reads a descriptor
    DescriptorRead {
        /// Requesting central
        central: Central,
        /// Target
        descriptor: DescriptorRef,
        /// Value or failure
        reply: oneshot::Sender<ReadOutcome>,
    },
    /// A central writes a descriptor
    DescriptorWrite {
        /// Requesting central
        central: Central,
        /// Target
        descriptor: DescriptorRef,
        /// Written bytes
        value: Bytes,
        /// Status for the central
        reply: oneshot::Sender<GattStatus>,
    },
    /// The transport saw a central enable pushes
    NotifyingEnabled {
        /// Subscribing central
        central: Central,
        /// Target
        characteristic: CharacteristicRef,
        /// Enabled mode
        mode: NotifyMode,
    },
    /// The transport saw a central disable pushes
    NotifyingDisabled {
        /// Unsubscribing central
        central: Central,
        /// Target
        characteristic: CharacteristicRef,
    },
    /// A queued push completed
    NotificationSent {
        /// Receiving central
        central: Central,
        /// Source characteristic
        characteristic: CharacteristicRef,
        /// Pushed bytes
        value: Bytes,
        /// Delivery status
        status: GattStatus,
    },
    /// A central connected
    CentralConnected(Central),
    /// A central disconnected
    CentralDisconnected(Central),
    /// The controller started advertising
    AdvertisingStarted,
    /// The controller could not advertise
    AdvertisingFailed(AdvertiseError),
    /// The controller stopped advertising
    AdvertisingStopped,
    /// Get server statistics
    GetStats(oneshot::Sender<ServerStats>),
    /// Shutdown the server
    Shutdown,
}

/// Server statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    /// Characteristic and descriptor reads
    pub reads: u64,
    /// Characteristic and descriptor writes
    pub writes: u64,
    /// Requests for attributes no handler owns
    pub routing_misses: u64,
    /// Pushes the transport accepted
    pub notifications_pushed: u64,
    /// Pushes the transport refused
    pub notifications_rejected: u64,
    /// Scheduler ticks processed
    pub ticks: u64,
    /// Central connections
    pub connections: u64,
    /// Central disconnections
    pub disconnections: u64,
    /// Advertising failures reported by the controller
    pub advertise_failures: u64,
}

/// Handle for feeding transport callbacks into a [`PeripheralServer`]
#[derive(Clone)]
pub struct ServerHandle {
    command_tx: mpsc::Sender<ServerCommand>,
}

impl ServerHandle {
    async fn send(&self, command: ServerCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| PeripheralError::ServerNotRunning)
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> ServerCommand) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.map_err(|_| PeripheralError::ChannelClosed)
    }

    /// Register a service
    pub async fn register_service(&self, handler: Box<dyn ServiceHandler>) -> Result<()> {
        self.request(|reply| ServerCommand::RegisterService { handler, reply })
            .await?
    }

    /// Start or extend advertising
    pub async fn start_advertising(&self, primary: Uuid, extras: Vec<Uuid>) -> Result<()> {
        self.request(|reply| ServerCommand::StartAdvertising {
            primary,
            extras,
            reply,
        })
        .await?
    }

    /// Stop advertising
    pub async fn stop_advertising(&self) -> Result<()> {
        self.request(ServerCommand::StopAdvertising).await?
    }

    /// Forward a characteristic read
    pub async fn characteristic_read(
        &self,
        central: Central,
        characteristic: CharacteristicRef,
    ) -> Result<ReadOutcome> {
        self.request(|reply| ServerCommand::CharacteristicRead {
            central,
            characteristic,
            reply,
        })
        .await
    }

    /// Forward a characteristic write
    pub async fn characteristic_write(
        &self,
        central: Central,
        characteristic: CharacteristicRef,
        value: impl Into<Bytes>,
    ) -> Result<GattStatus> {
        let value = value.into();
        self.request(|reply| ServerCommand::CharacteristicWrite {
            central,
            characteristic,
            value,
            reply,
        })
        .await
    }

    /// Forward a write completion
    pub async fn characteristic_write_completed(
        &self,
        central: Central,
        characteristic: CharacteristicRef,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        self.send(ServerCommand::CharacteristicWriteCompleted {
            central,
            characteristic,
            value: value.into(),
        })
        .await
    }

    /// Forward a descriptor read
    pub async fn descriptor_read(&self, central: Central, descriptor: DescriptorRef) -> Result<ReadOutcome> {
        self.request(|reply| ServerCommand::DescriptorRead {
            central,
            descriptor,
            reply,
        })
        .await
    }

    /// Forward a descriptor write
    pub async fn descriptor_write(
        &self,
        central: Central,
        descriptor: DescriptorRef,
        value: impl Into<Bytes>,
    ) -> Result<GattStatus> {
        let value = value.into();
        self.request(|reply| ServerCommand::DescriptorWrite {
            central,
            descriptor,
            value,
            reply,
        })
        .await
    }

    /// Report a transport-managed subscription
    pub async fn notifying_enabled(
        &self,
        central: Central,
        characteristic: CharacteristicRef,
        mode: NotifyMode,
    ) -> Result<()> {
        self.send(ServerCommand::NotifyingEnabled {
            central,
            characteristic,
            mode,
        })
        .await
    }

    /// Report a transport-managed unsubscription
    pub async fn notifying_disabled(&self, central: Central, characteristic: CharacteristicRef) -> Result<()> {
        self.send(ServerCommand::NotifyingDisabled {
            central,
            characteristic,
        })
        .await
    }

    /// Report a completed push
    pub async fn notification_sent(
        &self,
        central: Central,
        characteristic: CharacteristicRef,
        value: impl Into<Bytes>,
        status: GattStatus,
    ) -> Result<()> {
        self.send(ServerCommand::NotificationSent {
            central,
            characteristic,
            value: value.into(),
            status,
        })
        .await
    }

    /// Report a connection
    pub async fn central_connected(&self, central: Central) -> Result<()> {
        self.send(ServerCommand::CentralConnected(central)).await
    }

    /// Report a disconnection
    pub async fn central_disconnected(&self, central: Central) -> Result<()> {
        self.send(ServerCommand::CentralDisconnected(central)).await
    }

    /// Report that advertising started
    pub async fn advertising_started(&self) -> Result<()> {
        self.send(ServerCommand::AdvertisingStarted).await
    }

    /// Report an advertising failure
    pub async fn advertising_failed(&self, error: AdvertiseError) -> Result<()> {
        self.send(ServerCommand::AdvertisingFailed(error)).await
    }

    /// Report that advertising stopped
    pub async fn advertising_stopped(&self) -> Result<()> {
        self.send(ServerCommand::AdvertisingStopped).await
    }

    /// Get server statistics
    pub async fn stats(&self) -> Result<ServerStats> {
        self.request(ServerCommand::GetStats).await
    }

    /// Shutdown the server
    pub async fn shutdown(&self) -> Result<()> {
        self.send(ServerCommand::Shutdown).await
    }
}

/// Everything a handler callback may borrow besides the handler itself
struct ServerCore<T: Transport> {
    transport: T,
    registry: ConnectionRegistry,
    subscriptions: SubscriptionTable,
    sink: Box<dyn EventSink>,
    timer: TickTimer,
    rejected: VecDeque<RejectedPush>,
    stats: ServerStats,
}

impl<T: Transport> ServerCore<T> {
    fn context(&mut self) -> ServiceContext<'_> {
        ServiceContext {
            transport: &mut self.transport,
            registry: &self.registry,
            subscriptions: &self.subscriptions,
            sink: self.sink.as_ref(),
            timer: &self.timer,
            rejected: &mut self.rejected,
            stats: &mut self.stats,
        }
    }
}

/// GATT peripheral server
pub struct PeripheralServer<T: Transport> {
    core: ServerCore<T>,
    /// Registered handlers, in registration order
    handlers: Vec<Box<dyn ServiceHandler>>,
    /// Characteristic -> index into `handlers`
    routes: HashMap<CharacteristicRef, usize>,
    config: PeripheralConfig,
    /// Services in the current advertisement, in request order
    advertised: Vec<Uuid>,
    /// Set by the first advertising request; registration is closed after
    frozen: bool,
    /// Between a start and a stop request
    advertise_requested: bool,
    /// As last reported by the controller
    advertiser_on: bool,
    command_rx: mpsc::Receiver<ServerCommand>,
    tick_rx: mpsc::UnboundedReceiver<Tick>,
}

impl<T: Transport + 'static> PeripheralServer<T> {
    /// Create a server and the handle feeding it
    pub fn new<S: EventSink + 'static>(transport: T, sink: S, config: PeripheralConfig) -> (Self, ServerHandle) {
        let (command_tx, command_rx) = mpsc::channel(config.server.command_queue_size.max(1));
        let (timer, tick_rx) = TickTimer::channel();
        let handle = ServerHandle { command_tx };

        let server = Self {
            core: ServerCore {
                transport,
                registry: ConnectionRegistry::new(),
                subscriptions: SubscriptionTable::new(),
                sink: Box::new(sink),
                timer,
                rejected: VecDeque::new(),
                stats: ServerStats::default(),
            },
            handlers: Vec::new(),
            routes: HashMap::new(),
            config,
            advertised: Vec::new(),
            frozen: false,
            advertise_requested: false,
            advertiser_on: false,
            command_rx,
            tick_rx,
        };

        (server, handle)
    }

    /// Current statistics
    pub fn stats(&self) -> &ServerStats {
        &self.core.stats
    }

    /// The transport
    pub fn transport(&self) -> &T {
        &self.core.transport
    }

    /// Connected centrals
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.core.registry
    }

    /// Current subscriptions
    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.core.subscriptions
    }

    /// Services in the current advertisement
    pub fn advertised_services(&self) -> &[Uuid] {
        &self.advertised
    }

    /// Whether the controller last reported advertising as on
    pub fn is_advertising(&self) -> bool {
        self.advertiser_on
    }

    /// Number of registered services
    pub fn service_count(&self) -> usize {
        self.handlers.len()
    }

    /// Run the server event loop until shutdown
    ///
    /// Exits on a `Shutdown` command or when every handle is dropped.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "Starting peripheral server on {} with {} services",
            self.core.transport.name(),
            self.handlers.len()
        );

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command) {
                                info!("Peripheral server shutdown requested");
                                break;
                            }
                        }
                        None => {
                            debug!("All server handles dropped");
                            break;
                        }
                    }
                }

                Some(tick) = self.tick_rx.recv() => {
                    self.on_tick(&tick);
                }
            }
        }

        self.shutdown();
        info!(
            "Peripheral server stopped: reads={}, writes={}, pushed={}, rejected={}",
            self.core.stats.reads,
            self.core.stats.writes,
            self.core.stats.notifications_pushed,
            self.core.stats.notifications_rejected
        );
        Ok(())
    }

    /// Process one command; `false` ends the loop
    fn handle_command(&mut self, command: ServerCommand) -> bool {
        match command {
            ServerCommand::RegisterService { handler, reply } => {
                let _ = reply.send(self.register_service(handler));
            }
            ServerCommand::StartAdvertising {
                primary,
                extras,
                reply,
            } => {
                let _ = reply.send(self.start_advertising(primary, &extras));
            }
            ServerCommand::StopAdvertising(reply) => {
                let _ = reply.send(self.stop_advertising());
            }
            ServerCommand::CharacteristicRead {
                central,
                characteristic,
                reply,
            } => {
                let _ = reply.send(self.on_characteristic_read(&central, characteristic));
            }
            ServerCommand::CharacteristicWrite {
                central,
                characteristic,
                value,
                reply,
            } => {
                let _ = reply.send(self.on_characteristic_write(&central, characteristic, &value));
            }
            ServerCommand::CharacteristicWriteCompleted {
                central,
                characteristic,
                value,
            } => self.on_characteristic_write_completed(&central, characteristic, &value),
            ServerCommand::DescriptorRead {
                central,
                descriptor,
                reply,
            } => {
                let _ = reply.send(self.on_descriptor_read(&central, descriptor));
            }
            ServerCommand::DescriptorWrite {
                central,
                descriptor,
                value,
                reply,
            } => {
                let _ = reply.send(self.on_descriptor_write(&central, descriptor, &value));
            }
            ServerCommand::NotifyingEnabled {
                central,
                characteristic,
                mode,
            } => self.on_notifying_enabled(&central, characteristic, mode),
            ServerCommand::NotifyingDisabled {
                central,
                characteristic,
            } => self.on_notifying_disabled(&central, characteristic),
            ServerCommand::NotificationSent {
                central,
                characteristic,
                value,
                status,
            } => self.on_notification_sent(&central, characteristic, &value, status),
            ServerCommand::CentralConnected(central) => self.on_central_connected(central),
            ServerCommand::CentralDisconnected(central) => self.on_central_disconnected(&central),
            ServerCommand::AdvertisingStarted => self.on_advertising_started(),
            ServerCommand::AdvertisingFailed(error) => self.on_advertising_failed(&error),
            ServerCommand::AdvertisingStopped => self.on_advertising_stopped(),
            ServerCommand::GetStats(reply) => {
                let _ = reply.send(self.core.stats.clone());
            }
            ServerCommand::Shutdown => return false,
        }
        true
    }

    // ===== Registration =====

    /// Add a service to the transport and the routing table
    pub fn register_service(&mut self, handler: Box<dyn ServiceHandler>) -> Result<()> {
        if self.frozen {
            return Err(PeripheralError::AlreadyAdvertising);
        }

        let service = handler.service();
        if self.handlers.iter().any(|h| h.service().uuid == service.uuid) {
            return Err(PeripheralError::DuplicateService(service.uuid));
        }
        service.validate()?;
        self.core.transport.add_service(service)?;

        let index = self.handlers.len();
        for characteristic in &service.characteristics {
            self.routes
                .insert(service.characteristic_ref(characteristic.uuid), index);
        }
        info!(
            "Registered service {} ({}) with {} characteristics",
            handler.name(),
            service.uuid,
            service.characteristics.len()
        );
        self.handlers.push(handler);
        Ok(())
    }

    // ===== Advertising =====

    /// Advertise `primary` and `extras`
    ///
    /// While already advertising, the new services are added to the
    /// advertised set and advertising restarts with the union.
    pub fn start_advertising(&mut self, primary: Uuid, extras: &[Uuid]) -> Result<()> {
        let mut services = self.advertised.clone();
        for uuid in std::iter::once(&primary).chain(extras) {
            if !services.contains(uuid) {
                services.push(*uuid);
            }
            if !self.handlers.iter().any(|h| h.service().uuid == *uuid) {
                warn!("Advertising unregistered service {}", uuid);
            }
        }

        let settings = &self.config.advertising;
        let name = &self.config.device.name;
        let advertise_data = AdvertiseData {
            include_tx_power: true,
            include_device_name: false,
            service_uuids: services.clone(),
        };
        let scan_response = AdvertiseData {
            include_tx_power: false,
            include_device_name: true,
            service_uuids: Vec::new(),
        };

        let flags = if settings.connectable { ADVERTISE_FLAGS_LEN } else { 0 };
        for size in [
            flags + advertise_data.encoded_len(name),
            scan_response.encoded_len(name),
        ] {
            if size > MAX_LEGACY_ADVERTISE_LEN {
                return Err(PeripheralError::AdvertiseDataTooLarge {
                    size,
                    max: MAX_LEGACY_ADVERTISE_LEN,
                });
            }
        }

        self.frozen = true;
        if self.advertise_requested {
            debug!("Restarting advertising with {} services", services.len());
            self.core.transport.stop_advertising()?;
        }
        self.core
            .transport
            .start_advertising(settings, &advertise_data, &scan_response)?;

        info!(
            "Advertising requested for {:?} as '{}'",
            services.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
            name
        );
        self.advertised = services;
        self.advertise_requested = true;
        Ok(())
    }

    /// Stop advertising; a no-op when not advertising
    pub fn stop_advertising(&mut self) -> Result<()> {
        if !self.advertise_requested {
            return Ok(());
        }
        self.core.transport.stop_advertising()?;
        self.advertise_requested = false;
        self.advertised.clear();
        info!("Advertising stop requested");
        Ok(())
    }

    /// Controller confirmed advertising
    pub fn on_advertising_started(&mut self) {
        self.advertiser_on = true;
        info!("Advertising started");
        self.core.sink.emit(UiEvent::AdvertiserState(AdvertiserState::On));
    }

    /// Controller refused to advertise
    pub fn on_advertising_failed(&mut self, error: &AdvertiseError) {
        self.advertiser_on = false;
        self.core.stats.advertise_failures += 1;
        warn!("Advertising failed: {}", error);
        self.core.sink.emit(UiEvent::AdvertiserState(AdvertiserState::Off));
    }

    /// Controller stopped advertising
    pub fn on_advertising_stopped(&mut self) {
        self.advertiser_on = false;
        info!("Advertising stopped");
        self.core.sink.emit(UiEvent::AdvertiserState(AdvertiserState::Off));
    }

    // ===== Routing =====

    fn route(&mut self, characteristic: CharacteristicRef) -> Option<usize> {
        let index = self.routes.get(&characteristic).copied();
        if index.is_none() {
            self.core.stats.routing_misses += 1;
            debug!("No service handles {}", characteristic);
        }
        index
    }

    /// Run one handler callback, then deliver refused pushes
    fn dispatch<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut dyn ServiceHandler, &mut ServiceContext<'_>) -> R,
    ) -> R {
        let mut ctx = self.core.context();
        let result = f(self.handlers[index].as_mut(), &mut ctx);
        self.flush_rejections();
        result
    }

    /// Report synchronously refused pushes as failed notifications
    fn flush_rejections(&mut self) {
        while let Some(rejected) = self.core.rejected.pop_front() {
            let Some(&index) = self.routes.get(&rejected.characteristic) else {
                continue;
            };
            trace!(
                "Delivering rejected push on {} to {}: {}",
                rejected.characteristic,
                self.handlers[index].name(),
                rejected.reason
            );
            let mut ctx = self.core.context();
            self.handlers[index].on_notification_sent(
                &mut ctx,
                &rejected.central,
                rejected.characteristic,
                &rejected.value,
                GattStatus::UnlikelyError,
            );
        }
    }

    // ===== Characteristic callbacks =====

    /// A central reads a characteristic
    pub fn on_characteristic_read(&mut self, central: &Central, characteristic: CharacteristicRef) -> ReadOutcome {
        self.core.stats.reads += 1;
        let Some(index) = self.route(characteristic) else {
            return ReadOutcome::not_supported();
        };

        let status = self.handlers[index]
            .service()
            .characteristic(&characteristic.characteristic)
            .map(|c| c.check_read(central.security))
            .unwrap_or(GattStatus::InvalidHandle);
        if !status.is_success() {
            debug!("Read of {} by {} refused: {}", characteristic, central, status);
            return ReadOutcome::Failure(status);
        }

        self.dispatch(index, |handler, ctx| {
            handler.on_characteristic_read(ctx, central, characteristic)
        })
    }

    /// A central writes a characteristic
    pub fn on_characteristic_write(
        &mut self,
        central: &Central,
        characteristic: CharacteristicRef,
        value: &[u8],
    ) -> GattStatus {
        self.core.stats.writes += 1;
        let Some(index) = self.route(characteristic) else {
            return GattStatus::RequestNotSupported;
        };

        if characteristic.characteristic == uuids::MODEL_NUMBER {
            let model = String::from_utf8_lossy(value).into_owned();
            debug!("Model name written by {}: {}", central, model);
            self.core.sink.emit(UiEvent::ModelName(model));
        }

        let status = self.handlers[index]
            .service()
            .characteristic(&characteristic.characteristic)
            .map(|c| c.check_write(central.security))
            .unwrap_or(GattStatus::InvalidHandle);
        if !status.is_success() {
            debug!("Write of {} by {} refused: {}", characteristic, central, status);
            return status;
        }

        self.dispatch(index, |handler, ctx| {
            handler.on_characteristic_write(ctx, central, characteristic, value)
        })
    }

    /// A characteristic write finished
    pub fn on_characteristic_write_completed(
        &mut self,
        central: &Central,
        characteristic: CharacteristicRef,
        value: &[u8],
    ) {
        let Some(index) = self.route(characteristic) else {
            return;
        };
        self.dispatch(index, |handler, ctx| {
            handler.on_characteristic_write_completed(ctx, central, characteristic, value)
        })
    }

    // ===== Descriptor callbacks =====

    /// Resolve a descriptor to its handler, checking it is declared
    fn route_descriptor(&mut self, descriptor: DescriptorRef) -> std::result::Result<usize, GattStatus> {
        let index = self
            .route(descriptor.characteristic)
            .ok_or(GattStatus::RequestNotSupported)?;

        let declared = self.handlers[index]
            .service()
            .characteristic(&descriptor.characteristic.characteristic)
            .and_then(|c| c.descriptor(&descriptor.descriptor))
            .is_some();
        if !declared {
            error!(
                "Descriptor {} not declared on {}",
                descriptor.descriptor, descriptor.characteristic
            );
            return Err(GattStatus::InvalidHandle);
        }
        Ok(index)
    }

    fn descriptor_status(
        &self,
        index: usize,
        descriptor: DescriptorRef,
        check: impl Fn(&crate::gatt::Descriptor) -> GattStatus,
    ) -> GattStatus {
        self.handlers[index]
            .service()
            .characteristic(&descriptor.characteristic.characteristic)
            .and_then(|c| c.descriptor(&descriptor.descriptor))
            .map(check)
            .unwrap_or(GattStatus::InvalidHandle)
    }

    /// A central reads a descriptor
    pub fn on_descriptor_read(&mut self, central: &Central, descriptor: DescriptorRef) -> ReadOutcome {
        self.core.stats.reads += 1;
        let index = match self.route_descriptor(descriptor) {
            Ok(index) => index,
            Err(status) => return ReadOutcome::Failure(status),
        };

        let status = self.descriptor_status(index, descriptor, |d| d.check_read(central.security));
        if !status.is_success() {
            return ReadOutcome::Failure(status);
        }

        self.dispatch(index, |handler, ctx| {
            handler.on_descriptor_read(ctx, central, descriptor)
        })
    }

    /// A central writes a descriptor
    ///
    /// CCCD writes are validated and recorded before the handler sees
    /// them; a change of state is then reported as notifying enabled or
    /// disabled.
    pub fn on_descriptor_write(&mut self, central: &Central, descriptor: DescriptorRef, value: &[u8]) -> GattStatus {
        self.core.stats.writes += 1;
        let index = match self.route_descriptor(descriptor) {
            Ok(index) => index,
            Err(status) => return status,
        };

        let status = self.descriptor_status(index, descriptor, |d| d.check_write(central.security));
        if !status.is_success() {
            return status;
        }

        if !descriptor.is_cccd() {
            return self.dispatch(index, |handler, ctx| {
                handler.on_descriptor_write(ctx, central, descriptor, value)
            });
        }

        let cccd = match CccdValue::parse(value) {
            Ok(cccd) => cccd,
            Err(status) => {
                debug!("Bad CCCD value {:02X?} from {}", value, central);
                return status;
            }
        };
        let characteristic = descriptor.characteristic;
        let supported = self.handlers[index]
            .service()
            .characteristic(&characteristic.characteristic)
            .map(|c| cccd.supported_by(c))
            .unwrap_or(false);
        if !supported {
            debug!("{:?} not supported by {}", cccd, characteristic);
            return GattStatus::RequestNotSupported;
        }
        // Subscriptions live only as long as a connection
        if !self.core.registry.contains(&central.address) {
            warn!("CCCD write on {} from unconnected {}", characteristic, central);
            return GattStatus::UnlikelyError;
        }

        let previous = self.core.subscriptions.mode(&central.address, characteristic);
        self.apply_cccd(&central.address, characteristic, cccd);

        let status = self.dispatch(index, |handler, ctx| {
            handler.on_descriptor_write(ctx, central, descriptor, value)
        });
        if !status.is_success() {
            // Handler refused; restore the previous subscription
            self.apply_cccd(&central.address, characteristic, CccdValue::from(previous));
            return status;
        }

        match (previous, cccd) {
            (None, CccdValue::Enabled(mode)) => {
                info!("{} enabled {:?} on {}", central, mode, characteristic);
                self.dispatch(index, |handler, ctx| {
                    handler.on_notifying_enabled(ctx, central, characteristic, mode)
                });
            }
            (Some(_), CccdValue::Disabled) => {
                info!("{} disabled pushes on {}", central, characteristic);
                self.dispatch(index, |handler, ctx| {
                    handler.on_notifying_disabled(ctx, central, characteristic)
                });
            }
            _ => {}
        }
        status
    }

    fn apply_cccd(&mut self, address: &str, characteristic: CharacteristicRef, cccd: CccdValue) {
        match cccd {
            CccdValue::Enabled(mode) => {
                self.core.subscriptions.enable(address, characteristic, mode);
            }
            CccdValue::Disabled => {
                self.core.subscriptions.disable(address, characteristic);
            }
        }
    }

    // ===== Subscription callbacks =====

    /// The transport saw a central enable pushes
    pub fn on_notifying_enabled(&mut self, central: &Central, characteristic: CharacteristicRef, mode: NotifyMode) {
        let Some(index) = self.route(characteristic) else {
            return;
        };
        let supported = self.handlers[index]
            .service()
            .characteristic(&characteristic.characteristic)
            .map(|c| CccdValue::Enabled(mode).supported_by(c))
            .unwrap_or(false);
        if !supported {
            warn!("{} enabled {:?} on {} which does not support it", central, mode, characteristic);
            return;
        }
        if !self.core.registry.contains(&central.address) {
            warn!("{} enabled {:?} on {} while not connected", central, mode, characteristic);
            return;
        }

        if self.core.subscriptions.enable(&central.address, characteristic, mode) {
            info!("{} enabled {:?} on {}", central, mode, characteristic);
            self.dispatch(index, |handler, ctx| {
                handler.on_notifying_enabled(ctx, central, characteristic, mode)
            });
        }
    }

    /// The transport saw a central disable pushes
    pub fn on_notifying_disabled(&mut self, central: &Central, characteristic: CharacteristicRef) {
        let Some(index) = self.route(characteristic) else {
            return;
        };
        if self.core.subscriptions.disable(&central.address, characteristic) {
            info!("{} disabled pushes on {}", central, characteristic);
            self.dispatch(index, |handler, ctx| {
                handler.on_notifying_disabled(ctx, central, characteristic)
            });
        }
    }

    /// A queued push completed
    pub fn on_notification_sent(
        &mut self,
        central: &Central,
        characteristic: CharacteristicRef,
        value: &[u8],
        status: GattStatus,
    ) {
        let Some(index) = self.route(characteristic) else {
            return;
        };
        self.dispatch(index, |handler, ctx| {
            handler.on_notification_sent(ctx, central, characteristic, value, status)
        })
    }

    // ===== Connection callbacks =====

    /// A central connected
    pub fn on_central_connected(&mut self, central: Central) {
        self.core.stats.connections += 1;
        if !self.core.registry.add(central.clone()) {
            debug!("{} connected again", central);
        }
        info!("Central connected: {}", central);

        for handler in self.handlers.iter_mut() {
            let mut ctx = self.core.context();
            handler.on_central_connected(&mut ctx, &central);
        }
        self.flush_rejections();

        self.core
            .sink
            .emit(UiEvent::ConnectionState(format!("connected to MAC: {}", central.address)));
    }

    /// A central disconnected
    pub fn on_central_disconnected(&mut self, central: &Central) {
        self.core.stats.disconnections += 1;
        self.core.registry.remove(&central.address);
        let dropped = self.core.subscriptions.remove_central(&central.address);
        info!(
            "Central disconnected: {} ({} subscriptions dropped)",
            central,
            dropped.len()
        );

        for handler in self.handlers.iter_mut() {
            let mut ctx = self.core.context();
            handler.on_central_disconnected(&mut ctx, central);
        }
        self.flush_rejections();

        self.core.sink.emit(UiEvent::ConnectionState(format!(
            "DISCONNECTED from MAC: {}",
            central.address
        )));
    }

    // ===== Timers =====

    /// Route a scheduler tick to its handler
    pub fn on_tick(&mut self, tick: &Tick) {
        self.core.stats.ticks += 1;
        let Some(&index) = self.routes.get(&tick.characteristic) else {
            trace!("Tick for unrouted {}", tick.characteristic);
            return;
        };
        self.dispatch(index, |handler, ctx| handler.on_tick(ctx, tick))
    }

    /// Stop every handler's timers
    pub fn shutdown(&mut self) {
        for handler in self.handlers.iter_mut() {
            handler.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{Characteristic, GattService, Permissions, Properties, SecurityLevel};
    use crate::services::device_information::MODEL_NUMBER_REF;
    use crate::services::heart_rate::HEART_RATE_MEASUREMENT_REF;
    use crate::services::DeviceInformationService;
    use crate::test_utils::TestFixture;
    use std::time::Duration;

    struct SecretService {
        service: GattService,
    }

    impl SecretService {
        fn new() -> Self {
            let uuid = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
            let secret = Uuid::parse_str("6e400002-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
            Self {
                service: GattService::new(uuid).with_characteristic(Characteristic::new(
                    secret,
                    Properties::READ,
                    Permissions::READ_ENCRYPTED_MITM,
                )),
            }
        }
    }

    impl ServiceHandler for SecretService {
        fn service(&self) -> &GattService {
            &self.service
        }

        fn name(&self) -> &str {
            "secret"
        }

        fn on_characteristic_read(
            &mut self,
            _ctx: &mut ServiceContext<'_>,
            _central: &Central,
            _characteristic: CharacteristicRef,
        ) -> ReadOutcome {
            ReadOutcome::success(&b"42"[..])
        }
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let mut fixture = TestFixture::new();
        let device = fixture.config.device.clone();
        fixture
            .server
            .register_service(Box::new(DeviceInformationService::new(&device)))
            .unwrap();
        let err = fixture
            .server
            .register_service(Box::new(DeviceInformationService::new(&device)))
            .unwrap_err();
        assert!(matches!(err, PeripheralError::DuplicateService(_)));
        assert!(err.is_fatal());
        assert_eq!(fixture.server.service_count(), 1);
        assert_eq!(fixture.transport.services().len(), 1);
    }

    #[test]
    fn test_registration_closed_after_advertising() {
        let mut fixture = TestFixture::new();
        fixture
            .server
            .start_advertising(uuids::HEART_RATE_SERVICE, &[])
            .unwrap();
        let device = fixture.config.device.clone();
        let err = fixture
            .server
            .register_service(Box::new(DeviceInformationService::new(&device)))
            .unwrap_err();
        assert!(matches!(err, PeripheralError::AlreadyAdvertising));
    }

    #[test]
    fn test_advertising_extends_set() {
        let mut fixture = TestFixture::with_default_services();
        fixture
            .server
            .start_advertising(uuids::HEART_RATE_SERVICE, &[])
            .unwrap();
        fixture
            .server
            .start_advertising(uuids::ENVIRONMENTAL_SENSING_SERVICE, &[uuids::HEART_RATE_SERVICE])
            .unwrap();

        assert_eq!(
            fixture.server.advertised_services(),
            &[uuids::HEART_RATE_SERVICE, uuids::ENVIRONMENTAL_SENSING_SERVICE]
        );
        let starts = fixture.transport.advertise_starts();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1].service_uuids.len(), 2);
        assert_eq!(fixture.transport.advertise_stops(), 1);
    }

    #[test]
    fn test_advertising_payload_limit() {
        let mut fixture = TestFixture::new();
        let a = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let b = Uuid::parse_str("6e400002-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let err = fixture.server.start_advertising(a, &[b]).unwrap_err();
        assert!(matches!(
            err,
            PeripheralError::AdvertiseDataTooLarge { max: 31, .. }
        ));
        assert!(fixture.transport.advertise_starts().is_empty());
    }

    #[test]
    fn test_stop_advertising_idempotent() {
        let mut fixture = TestFixture::new();
        fixture.server.stop_advertising().unwrap();
        assert_eq!(fixture.transport.advertise_stops(), 0);

        fixture
            .server
            .start_advertising(uuids::HEART_RATE_SERVICE, &[])
            .unwrap();
        fixture.server.stop_advertising().unwrap();
        fixture.server.stop_advertising().unwrap();
        assert_eq!(fixture.transport.advertise_stops(), 1);
    }

    #[test]
    fn test_advertiser_state_events() {
        let mut fixture = TestFixture::new();
        fixture.server.on_advertising_started();
        assert!(fixture.server.is_advertising());
        fixture
            .server
            .on_advertising_failed(&AdvertiseError::TooManyAdvertisers);
        assert!(!fixture.server.is_advertising());
        assert_eq!(fixture.server.stats().advertise_failures, 1);

        assert_eq!(
            fixture.sink.events(),
            vec![
                UiEvent::AdvertiserState(AdvertiserState::On),
                UiEvent::AdvertiserState(AdvertiserState::Off)
            ]
        );
    }

    #[test]
    fn test_routing_miss_not_supported() {
        let mut fixture = TestFixture::new();
        let central = Central::new("AA");

        assert_eq!(
            fixture
                .server
                .on_characteristic_read(&central, HEART_RATE_MEASUREMENT_REF),
            ReadOutcome::Failure(GattStatus::RequestNotSupported)
        );
        assert_eq!(
            fixture
                .server
                .on_characteristic_write(&central, HEART_RATE_MEASUREMENT_REF, &[1]),
            GattStatus::RequestNotSupported
        );
        assert_eq!(fixture.server.stats().routing_misses, 2);
    }

    #[test]
    fn test_permission_tiers_enforced() {
        let mut fixture = TestFixture::new();
        let handler = SecretService::new();
        let secret = handler.service.characteristic_ref(handler.service.characteristics[0].uuid);
        fixture.server.register_service(Box::new(handler)).unwrap();

        let open = Central::new("AA");
        assert_eq!(
            fixture.server.on_characteristic_read(&open, secret),
            ReadOutcome::Failure(GattStatus::InsufficientAuthentication)
        );

        let bonded = Central::new("AA").with_security(SecurityLevel::Authenticated);
        assert_eq!(
            fixture.server.on_characteristic_read(&bonded, secret),
            ReadOutcome::success(&b"42"[..])
        );
    }

    #[test]
    fn test_model_write_emits_even_when_refused() {
        let mut fixture = TestFixture::with_default_services();
        let central = Central::new("AA");
        let oversized = vec![b'x'; 600];

        let status = fixture
            .server
            .on_characteristic_write(&central, MODEL_NUMBER_REF, &oversized);
        assert_eq!(status, GattStatus::InvalidAttributeValueLength);
        assert_eq!(
            fixture.sink.events(),
            vec![UiEvent::ModelName("x".repeat(600))]
        );
    }

    #[test]
    fn test_undeclared_descriptor_invalid_handle() {
        let mut fixture = TestFixture::with_default_services();
        let central = Central::new("AA");
        // Model number has no CCCD
        let status = fixture
            .server
            .on_descriptor_write(&central, MODEL_NUMBER_REF.cccd(), &[1, 0]);
        assert_eq!(status, GattStatus::InvalidHandle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_requires_connection() {
        let mut fixture = TestFixture::with_default_services();
        let stranger = Central::new("AA");
        let cccd = HEART_RATE_MEASUREMENT_REF.cccd();

        assert_eq!(
            fixture.server.on_descriptor_write(&stranger, cccd, &[1, 0]),
            GattStatus::UnlikelyError
        );
        fixture
            .server
            .on_notifying_enabled(&stranger, HEART_RATE_MEASUREMENT_REF, NotifyMode::Notify);
        assert!(fixture.server.subscriptions().is_empty());
        assert!(fixture.transport.pushes().is_empty());

        // A later connection starts unsubscribed
        fixture.server.on_central_connected(stranger.clone());
        assert_eq!(
            fixture.server.on_descriptor_read(&stranger, cccd),
            ReadOutcome::success(vec![0, 0])
        );
        tokio::time::sleep(Duration::from_millis(2500)).await;
        while let Ok(tick) = fixture.server.tick_rx.try_recv() {
            fixture.server.on_tick(&tick);
        }
        assert_eq!(fixture.server.stats().ticks, 0);
        assert!(fixture.transport.pushes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cccd_validation() {
        let mut fixture = TestFixture::with_default_services();
        let central = Central::new("AA");
        fixture.server.on_central_connected(central.clone());
        let cccd = HEART_RATE_MEASUREMENT_REF.cccd();

        assert_eq!(
            fixture.server.on_descriptor_write(&central, cccd, &[3, 0]),
            GattStatus::CccdImproperlyConfigured
        );
        // Heart rate notifies, it does not indicate
        assert_eq!(
            fixture.server.on_descriptor_write(&central, cccd, &[2, 0]),
            GattStatus::RequestNotSupported
        );
        assert!(fixture.server.subscriptions().is_empty());

        assert_eq!(
            fixture.server.on_descriptor_write(&central, cccd, &[1, 0]),
            GattStatus::Success
        );
        assert_eq!(
            fixture.server.on_descriptor_read(&central, cccd),
            ReadOutcome::success(vec![1, 0])
        );
        assert_eq!(fixture.transport.pushes().len(), 1);
    }
}
