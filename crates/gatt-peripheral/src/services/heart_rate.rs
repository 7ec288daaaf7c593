//! Heart Rate service (0x180D)
//!
//! Simulates a pulse with a bounded random walk and notifies it once per
//! interval while subscribed.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::central::Central;
use crate::codec::{self, BytesReader};
use crate::error::Result;
use crate::events::UiEvent;
use crate::gatt::{
    Characteristic, CharacteristicRef, GattService, GattStatus, Permissions, Properties,
    ReadOutcome,
};
use crate::handler::{ServiceContext, ServiceHandler};
use crate::scheduler::{NotificationScheduler, Tick};
use crate::subscription::NotifyMode;
use crate::uuids;

/// Heart Rate Measurement
pub const HEART_RATE_MEASUREMENT_REF: CharacteristicRef =
    CharacteristicRef::new(uuids::HEART_RATE_SERVICE, uuids::HEART_RATE_MEASUREMENT);

/// Value a read returns; live values are only notified
pub const READ_SNAPSHOT: [u8; 2] = [0x00, 0x40];

/// Above this the walk is pulled back to [`RESET_BPM`]
pub const MAX_BPM: i32 = 120;

/// Value the walk restarts from when it exceeds [`MAX_BPM`]
pub const RESET_BPM: i32 = 100;

/// Largest step per tick in either direction
pub const MAX_STEP: i32 = 5;

/// Flags bit 0: value is uint16
const FLAG_VALUE_U16: usize = 0;

/// Next walk value
pub fn next_heart_rate(current: i32, delta: i32) -> i32 {
    let next = current + delta;
    if next > MAX_BPM {
        RESET_BPM
    } else {
        next
    }
}

/// Measurement payload: flags (uint8 value) followed by the value
///
/// The value is truncated to its low byte.
pub fn encode_measurement(bpm: i32) -> [u8; 2] {
    [0x00, bpm as u8]
}

/// Heart rate in a measurement payload, honouring the format flag
pub fn decode_measurement(value: &[u8]) -> Result<u16> {
    let mut reader = BytesReader::new(value);
    let flags = reader.u8()?;
    if codec::test_bit(&[flags], FLAG_VALUE_U16) {
        reader.u16()
    } else {
        reader.u8().map(u16::from)
    }
}

/// Simulated heart rate sensor
pub struct HeartRateService {
    service: GattService,
    bpm: i32,
    rng: StdRng,
    scheduler: NotificationScheduler,
}

impl HeartRateService {
    /// Create the service seeded at `initial_bpm`
    pub fn new(interval: Duration, initial_bpm: i32) -> Self {
        Self::with_rng(interval, initial_bpm, StdRng::from_entropy())
    }

    /// Create the service with an explicit random source
    pub fn with_rng(interval: Duration, initial_bpm: i32, rng: StdRng) -> Self {
        let service = GattService::new(uuids::HEART_RATE_SERVICE).with_characteristic(
            Characteristic::new(
                uuids::HEART_RATE_MEASUREMENT,
                Properties::READ | Properties::NOTIFY,
                Permissions::READ,
            )
            .with_cccd(),
        );

        Self {
            service,
            bpm: initial_bpm,
            rng,
            scheduler: NotificationScheduler::new(HEART_RATE_MEASUREMENT_REF, interval),
        }
    }

    /// Current simulated value
    pub fn bpm(&self) -> i32 {
        self.bpm
    }

    /// Whether the push scheduler is running
    pub fn is_notifying(&self) -> bool {
        self.scheduler.is_active()
    }

    fn push_next(&mut self, ctx: &mut ServiceContext<'_>) {
        let delta = self.rng.gen_range(-MAX_STEP..=MAX_STEP);
        self.bpm = next_heart_rate(self.bpm, delta);
        ctx.notify(HEART_RATE_MEASUREMENT_REF, &encode_measurement(self.bpm));
        debug!("new hr: {}", self.bpm);
    }

    fn stop_notifying(&mut self) {
        if self.scheduler.stop() {
            debug!("Heart rate notifications stopped");
        }
    }
}

impl ServiceHandler for HeartRateService {
    fn service(&self) -> &GattService {
        &self.service
    }

    fn name(&self) -> &str {
        "heart-rate"
    }

    fn on_characteristic_read(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _central: &Central,
        characteristic: CharacteristicRef,
    ) -> ReadOutcome {
        if characteristic == HEART_RATE_MEASUREMENT_REF {
            ReadOutcome::success(READ_SNAPSHOT.to_vec())
        } else {
            ReadOutcome::not_supported()
        }
    }

    fn on_notifying_enabled(
        &mut self,
        ctx: &mut ServiceContext<'_>,
        _central: &Central,
        characteristic: CharacteristicRef,
        _mode: NotifyMode,
    ) {
        if characteristic != HEART_RATE_MEASUREMENT_REF || !self.scheduler.start() {
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
        if characteristic == HEART_RATE_MEASUREMENT_REF
            && !ctx.has_subscribers(HEART_RATE_MEASUREMENT_REF)
        {
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
        if characteristic != HEART_RATE_MEASUREMENT_REF {
            return;
        }
        if !status.is_success() {
            debug!("Heart rate to {} failed: {}", central, status);
            return;
        }
        match decode_measurement(value) {
            Ok(bpm) => ctx.emit(UiEvent::HeartRate(bpm.to_string())),
            Err(e) => warn!("Sent heart rate did not decode: {}", e),
        }
    }

    fn on_central_disconnected(&mut self, ctx: &mut ServiceContext<'_>, _central: &Central) {
        if ctx.no_centrals() || !ctx.has_subscribers(HEART_RATE_MEASUREMENT_REF) {
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
            info!("Heart rate scheduler stopped on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;

    #[test]
    fn test_walk_resets_above_ceiling() {
        assert_eq!(next_heart_rate(80, 5), 85);
        assert_eq!(next_heart_rate(80, -5), 75);
        assert_eq!(next_heart_rate(120, 0), 120);
        assert_eq!(next_heart_rate(118, 3), RESET_BPM);
    }

    #[test]
    fn test_walk_stays_in_band() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut bpm = 80;
        for _ in 0..10_000 {
            bpm = next_heart_rate(bpm, rng.gen_range(-MAX_STEP..=MAX_STEP));
            assert!(bpm <= MAX_BPM);
        }
    }

    #[test]
    fn test_measurement_format() {
        assert_eq!(encode_measurement(72), [0x00, 72]);
        assert_eq!(decode_measurement(&[0x00, 72]).unwrap(), 72);
        // 16-bit value when flags bit 0 is set
        assert_eq!(decode_measurement(&[0x01, 0x2C, 0x01]).unwrap(), 300);
        assert!(decode_measurement(&[0x01, 0x2C]).is_err());
    }

    #[test]
    fn test_read_returns_snapshot() {
        let mut harness = TestContext::new();
        let mut svc = HeartRateService::with_rng(Duration::from_secs(1), 80, StdRng::seed_from_u64(1));
        let outcome = svc.on_characteristic_read(&mut harness.ctx(), &Central::new("AA"), HEART_RATE_MEASUREMENT_REF);
        assert_eq!(outcome, ReadOutcome::success(vec![0x00, 0x40]));
    }

    #[test]
    fn test_notification_sent_emits_decimal() {
        let mut harness = TestContext::new();
        let mut svc = HeartRateService::with_rng(Duration::from_secs(1), 80, StdRng::seed_from_u64(1));
        svc.on_notification_sent(
            &mut harness.ctx(),
            &Central::new("AA"),
            HEART_RATE_MEASUREMENT_REF,
            &[0x00, 77],
            GattStatus::Success,
        );
        assert_eq!(harness.sink.events(), vec![UiEvent::HeartRate("77".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_of_last_central_stops() {
        let mut harness = TestContext::new();
        let central = harness.connect("AA");
        harness.subscribe("AA", HEART_RATE_MEASUREMENT_REF, NotifyMode::Notify);

        let mut svc = HeartRateService::with_rng(Duration::from_secs(1), 80, StdRng::seed_from_u64(3));
        svc.on_notifying_enabled(&mut harness.ctx(), &central, HEART_RATE_MEASUREMENT_REF, NotifyMode::Notify);
        assert!(svc.is_notifying());

        let pushes = harness.transport.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].value[0], 0x00);
        assert_eq!(i32::from(pushes[0].value[1]), svc.bpm());

        harness.disconnect("AA");
        svc.on_central_disconnected(&mut harness.ctx(), &central);
        assert!(!svc.is_notifying());
    }
}
