//! Per-service behavior
//!
//! The server resolves every characteristic to the [`ServiceHandler`] that
//! declared it and calls that handler, and only that handler, for reads,
//! writes, subscription changes and timer ticks. Handlers keep their own
//! state and reach the rest of the system through a [`ServiceContext`]
//! built fresh for each callback.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::central::{Central, ConnectionRegistry};
use crate::events::{EventSink, UiEvent};
use crate::gatt::{CharacteristicRef, DescriptorRef, GattService, GattStatus, ReadOutcome};
use crate::scheduler::{Tick, TickTimer};
use crate::server::ServerStats;
use crate::subscription::{CccdValue, NotifyMode, SubscriptionTable};
use crate::transport::{PushOutcome, Transport};

/// A push the transport refused synchronously
#[derive(Debug, Clone)]
pub(crate) struct RejectedPush {
    pub central: Central,
    pub characteristic: CharacteristicRef,
    pub value: Bytes,
    pub reason: String,
}

/// What a handler may touch outside its own state
pub struct ServiceContext<'a> {
    pub(crate) transport: &'a mut dyn Transport,
    pub(crate) registry: &'a ConnectionRegistry,
    pub(crate) subscriptions: &'a SubscriptionTable,
    pub(crate) sink: &'a dyn EventSink,
    pub(crate) timer: &'a TickTimer,
    pub(crate) rejected: &'a mut VecDeque<RejectedPush>,
    pub(crate) stats: &'a mut ServerStats,
}

impl<'a> ServiceContext<'a> {
    /// Push `value` to every central subscribed to `characteristic`
    ///
    /// Each subscriber gets the mode it enabled. Returns how many pushes
    /// the transport accepted. Refused pushes are reported back to the
    /// handler as a failed notification-sent once this callback returns.
    pub fn notify(&mut self, characteristic: CharacteristicRef, value: &[u8]) -> usize {
        let mut accepted = 0;
        for (address, mode) in self.subscriptions.subscribers(characteristic) {
            let Some(central) = self.registry.get(&address) else {
                trace!("Skipping {} for {}: not connected", characteristic, address);
                continue;
            };

            match self
                .transport
                .push_notification(central, &characteristic, value, mode)
            {
                PushOutcome::Accepted => {
                    trace!(
                        "Pushed {} bytes to {} on {} ({:?})",
                        value.len(),
                        address,
                        characteristic,
                        mode
                    );
                    self.stats.notifications_pushed += 1;
                    accepted += 1;
                }
                PushOutcome::Rejected(reason) => {
                    debug!(
                        "Transport rejected push to {} on {}: {}",
                        address, characteristic, reason
                    );
                    self.stats.notifications_rejected += 1;
                    self.rejected.push_back(RejectedPush {
                        central: central.clone(),
                        characteristic,
                        value: Bytes::copy_from_slice(value),
                        reason,
                    });
                }
            }
        }
        accepted
    }

    /// Whether no central is connected
    pub fn no_centrals(&self) -> bool {
        self.registry.is_empty()
    }

    /// Number of connected centrals
    pub fn central_count(&self) -> usize {
        self.registry.len()
    }

    /// Mode `address` enabled on `characteristic`, if any
    pub fn subscription(&self, address: &str, characteristic: CharacteristicRef) -> Option<NotifyMode> {
        self.subscriptions.mode(address, characteristic)
    }

    /// Whether anyone is subscribed to `characteristic`
    pub fn has_subscribers(&self, characteristic: CharacteristicRef) -> bool {
        self.subscriptions.has_subscribers(characteristic)
    }

    /// Publish a UI event
    pub fn emit(&self, event: UiEvent) {
        self.sink.emit(event);
    }

    /// Timer for the handler's schedulers
    pub fn timer(&self) -> &TickTimer {
        self.timer
    }
}

/// Behavior of one GATT service
///
/// Every callback has a default: reads and writes answer
/// `RequestNotSupported`, notifications are ignored. A handler overrides
/// only what its service supports.
pub trait ServiceHandler: Send {
    /// Static service definition
    fn service(&self) -> &GattService;

    /// Handler name (for logging)
    fn name(&self) -> &str;

    /// Produce the value of a characteristic
    fn on_characteristic_read(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _central: &Central,
        _characteristic: CharacteristicRef,
    ) -> ReadOutcome {
        ReadOutcome::not_supported()
    }

    /// Validate (and stage) a written value
    fn on_characteristic_write(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _central: &Central,
        _characteristic: CharacteristicRef,
        _value: &[u8],
    ) -> GattStatus {
        GattStatus::RequestNotSupported
    }

    /// Commit a write the central finished
    fn on_characteristic_write_completed(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _central: &Central,
        _characteristic: CharacteristicRef,
        _value: &[u8],
    ) {
    }

    /// Produce the value of a descriptor
    ///
    /// A CCCD reads back the requesting central's subscription; any other
    /// descriptor with a static value reads that value.
    fn on_descriptor_read(
        &mut self,
        ctx: &mut ServiceContext<'_>,
        central: &Central,
        descriptor: DescriptorRef,
    ) -> ReadOutcome {
        if descriptor.is_cccd() {
            let value = CccdValue::from(ctx.subscription(&central.address, descriptor.characteristic));
            return ReadOutcome::success(value.encode().to_vec());
        }

        self.service()
            .characteristic(&descriptor.characteristic.characteristic)
            .and_then(|c| c.descriptor(&descriptor.descriptor))
            .and_then(|d| d.value.clone())
            .map(ReadOutcome::Success)
            .unwrap_or_else(ReadOutcome::not_supported)
    }

    /// Accept or refuse a descriptor write
    ///
    /// CCCD writes reaching a handler are already validated and recorded.
    fn on_descriptor_write(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _central: &Central,
        descriptor: DescriptorRef,
        _value: &[u8],
    ) -> GattStatus {
        if descriptor.is_cccd() {
            GattStatus::Success
        } else {
            GattStatus::RequestNotSupported
        }
    }

    /// A central enabled pushes on one of this service's characteristics
    fn on_notifying_enabled(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _central: &Central,
        _characteristic: CharacteristicRef,
        _mode: NotifyMode,
    ) {
    }

    /// A central disabled pushes on one of this service's characteristics
    fn on_notifying_disabled(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _central: &Central,
        _characteristic: CharacteristicRef,
    ) {
    }

    /// A push finished, successfully or not
    fn on_notification_sent(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _central: &Central,
        _characteristic: CharacteristicRef,
        _value: &[u8],
        _status: GattStatus,
    ) {
    }

    /// A central connected
    fn on_central_connected(&mut self, _ctx: &mut ServiceContext<'_>, _central: &Central) {}

    /// A central disconnected; its subscriptions are already gone
    fn on_central_disconnected(&mut self, _ctx: &mut ServiceContext<'_>, _central: &Central) {}

    /// One of this handler's schedulers fired
    fn on_tick(&mut self, _ctx: &mut ServiceContext<'_>, _tick: &Tick) {}

    /// Stop all timers; called once when the server exits
    fn shutdown(&mut self) {}
}
