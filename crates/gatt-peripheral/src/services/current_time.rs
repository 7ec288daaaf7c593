//! Current Time service (0x1805)
//!
//! Pushes the wall clock once per interval while any central subscribes
//! to Current Time.

use std::time::Duration;

use chrono::{Local, NaiveDateTime, Offset};
use tracing::{debug, info, warn};

use crate::central::Central;
use crate::codec::{self, ADJUST_NONE};
use crate::events::UiEvent;
use crate::gatt::{
    Characteristic, CharacteristicRef, Descriptor, GattService, GattStatus, Permissions,
    Properties, ReadOutcome,
};
use crate::handler::{ServiceContext, ServiceHandler};
use crate::scheduler::{NotificationScheduler, Tick};
use crate::subscription::NotifyMode;
use crate::uuids;

/// Current Time
pub const CURRENT_TIME_REF: CharacteristicRef =
    CharacteristicRef::new(uuids::CURRENT_TIME_SERVICE, uuids::CURRENT_TIME);

/// Local Time Information
pub const LOCAL_TIME_INFO_REF: CharacteristicRef =
    CharacteristicRef::new(uuids::CURRENT_TIME_SERVICE, uuids::LOCAL_TIME_INFORMATION);

/// DST offset value meaning "not known"
pub const DST_UNKNOWN: u8 = 255;

/// Format of the `current-time` UI event
pub const UI_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

/// Source of wall-clock time
pub type Clock = Box<dyn Fn() -> NaiveDateTime + Send>;

/// Current time with a local time information companion
pub struct CurrentTimeService {
    service: GattService,
    clock: Clock,
    utc_offset_secs: i32,
    scheduler: NotificationScheduler,
}

impl CurrentTimeService {
    /// Create the service reading the host's local clock
    pub fn new(interval: Duration) -> Self {
        let utc_offset_secs = Local::now().offset().fix().local_minus_utc();
        Self::with_clock(interval, Box::new(|| Local::now().naive_local()), utc_offset_secs)
    }

    /// Create the service with an explicit clock and UTC offset
    pub fn with_clock(interval: Duration, clock: Clock, utc_offset_secs: i32) -> Self {
        let service = GattService::new(uuids::CURRENT_TIME_SERVICE)
            .with_characteristic(
                Characteristic::new(
                    uuids::CURRENT_TIME,
                    Properties::READ | Properties::NOTIFY,
                    Permissions::READ,
                )
                .with_cccd()
                .with_descriptor(Descriptor::user_description("Current Time")),
            )
            .with_characteristic(Characteristic::new(
                uuids::LOCAL_TIME_INFORMATION,
                Properties::READ,
                Permissions::READ,
            ));

        Self {
            service,
            clock,
            utc_offset_secs,
            scheduler: NotificationScheduler::new(CURRENT_TIME_REF, interval),
        }
    }

    /// Whether the push scheduler is running
    pub fn is_notifying(&self) -> bool {
        self.scheduler.is_active()
    }

    fn current_time(&self) -> [u8; codec::CURRENT_TIME_LEN] {
        codec::encode_current_time(&(self.clock)(), ADJUST_NONE)
    }

    /// Time zone in 15-minute steps followed by the DST offset
    fn local_time_info(&self) -> [u8; 2] {
        let quarters = (self.utc_offset_secs / 900) as i8;
        [quarters as u8, DST_UNKNOWN]
    }

    fn push_time(&mut self, ctx: &mut ServiceContext<'_>) {
        let value = self.current_time();
        ctx.notify(CURRENT_TIME_REF, &value);
    }

    fn stop_notifying(&mut self) {
        if self.scheduler.stop() {
            debug!("Current time notifications stopped");
        }
    }
}

impl ServiceHandler for CurrentTimeService {
    fn service(&self) -> &GattService {
        &self.service
    }

    fn name(&self) -> &str {
        "current-time"
    }

    fn on_characteristic_read(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _central: &Central,
        characteristic: CharacteristicRef,
    ) -> ReadOutcome {
        match characteristic {
            CURRENT_TIME_REF => ReadOutcome::success(self.current_time().to_vec()),
            LOCAL_TIME_INFO_REF => ReadOutcome::success(self.local_time_info().to_vec()),
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
        if characteristic != CURRENT_TIME_REF || !self.scheduler.start() {
            return;
        }
        self.push_time(ctx);
        self.scheduler.schedule_next(ctx.timer());
    }

    fn on_notifying_disabled(
        &mut self,
        ctx: &mut ServiceContext<'_>,
        _central: &Central,
        characteristic: CharacteristicRef,
    ) {
        if characteristic == CURRENT_TIME_REF && !ctx.has_subscribers(CURRENT_TIME_REF) {
            self.stop_notifying();
        }
    }

    fn on_notification_sent(
        &mut self,
        ctx: &mut ServiceContext<'_>,
        central: &Central,
        characteristic: CharacteristicRef,
        value: &[u8],
        status: GattStatus,
    ) {
        if characteristic != CURRENT_TIME_REF {
            return;
        }
        if !status.is_success() {
            debug!("Current time to {} failed: {}", central, status);
            return;
        }
        match codec::decode_current_time(value) {
            Ok(time) => {
                let text = time.date_time.format(UI_TIME_FORMAT).to_string();
                ctx.emit(UiEvent::CurrentTime(text));
            }
            Err(e) => warn!("Sent current time did not decode: {}", e),
        }
    }

    fn on_central_disconnected(&mut self, ctx: &mut ServiceContext<'_>, _central: &Central) {
        if ctx.no_centrals() || !ctx.has_subscribers(CURRENT_TIME_REF) {
            self.stop_notifying();
        }
    }

    fn on_tick(&mut self, ctx: &mut ServiceContext<'_>, tick: &Tick) {
        if !self.scheduler.accept(tick) {
            return;
        }
        self.push_time(ctx);
        self.scheduler.schedule_next(ctx.timer());
    }

    fn shutdown(&mut self) {
        if self.scheduler.stop() {
            info!("Current time scheduler stopped on shutdown");
        }
    }
}
