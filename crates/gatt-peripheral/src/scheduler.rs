//! Periodic notification driver
//!
//! A [`NotificationScheduler`] does not call anyone back. Each period it
//! posts a [`Tick`] onto the server's tick channel and the server routes
//! the tick to the owning handler on the same loop as every transport
//! callback. Cancellation therefore races nothing: once `stop()` has
//! returned, a tick that was already queued carries a stale generation
//! and is dropped by [`NotificationScheduler::accept`].
//!
//! ```text
//!   Idle --start()--> Active --stop()--> Idle
//!                      |  ^
//!      schedule_next() |  | accept(tick)
//!                      v  |
//!                sleep(interval) -> Tick posted
//! ```

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::gatt::CharacteristicRef;

/// Default push period
pub const DEFAULT_NOTIFY_INTERVAL: Duration = Duration::from_secs(1);

/// Timer expiry for one scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Characteristic the scheduler drives
    pub characteristic: CharacteristicRef,
    /// Scheduler generation the tick was armed in
    pub generation: u64,
}

/// Timer primitive posting [`Tick`]s onto the server's queue
#[derive(Debug, Clone)]
pub struct TickTimer {
    tx: mpsc::UnboundedSender<Tick>,
}

impl TickTimer {
    /// Wrap an existing tick sender
    pub fn new(tx: mpsc::UnboundedSender<Tick>) -> Self {
        Self { tx }
    }

    /// Create a timer together with the receiving end of its queue
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Tick>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Post `tick` after `after` has elapsed
    pub fn schedule(&self, after: Duration, tick: Tick) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // Receiver gone means the server has shut down
            let _ = tx.send(tick);
        })
    }
}

/// Per-characteristic periodic push state
#[derive(Debug)]
pub struct NotificationScheduler {
    characteristic: CharacteristicRef,
    interval: Duration,
    generation: u64,
    active: bool,
    pending: Option<JoinHandle<()>>,
}

impl NotificationScheduler {
    /// Create an idle scheduler
    pub fn new(characteristic: CharacteristicRef, interval: Duration) -> Self {
        Self {
            characteristic,
            interval,
            generation: 0,
            active: false,
            pending: None,
        }
    }

    /// Characteristic this scheduler drives
    pub fn characteristic(&self) -> CharacteristicRef {
        self.characteristic
    }

    /// Push period
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the scheduler is active
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Move to Active
    ///
    /// Returns `false` if already active, in which case nothing changes.
    /// On `true` the owner pushes the first value and calls
    /// [`schedule_next`](Self::schedule_next).
    pub fn start(&mut self) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        trace!("Scheduler for {} started (generation {})", self.characteristic, self.generation);
        true
    }

    /// Arm the next tick one interval from now
    pub fn schedule_next(&mut self, timer: &TickTimer) {
        if !self.active {
            return;
        }
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        let tick = Tick {
            characteristic: self.characteristic,
            generation: self.generation,
        };
        self.pending = Some(timer.schedule(self.interval, tick));
    }

    /// Whether `tick` belongs to the current run of this scheduler
    pub fn accept(&mut self, tick: &Tick) -> bool {
        let current =
            self.active && tick.characteristic == self.characteristic && tick.generation == self.generation;
        if current {
            self.pending = None;
        }
        current
    }

    /// Move to Idle, cancelling the pending tick
    ///
    /// Returns `false` if already idle.
    pub fn stop(&mut self) -> bool {
        if !self.active {
            return false;
        }
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        self.generation = self.generation.wrapping_add(1);
        self.active = false;
        trace!("Scheduler for {} stopped", self.characteristic);
        true
    }
}

impl Drop for NotificationScheduler {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}
