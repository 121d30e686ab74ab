//! Wall-clock sampling and per-task tick accounting.
//!
//! A task never learns how long it may run in wall time. It is granted a
//! number of abstract *ticks* instead, sized from a smoothed estimate of what
//! one tick has cost it so far. Every suspension feeds the measured elapsed
//! time back into that estimate.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time, in microseconds.
///
/// Readings may go backwards (system clock adjustments); the accounting in
/// this module tolerates it.
pub trait Clock {
    /// Current time in microseconds since an arbitrary fixed origin.
    fn now_micros(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => i64::try_from(since.as_micros()).unwrap_or(i64::MAX),
            Err(before) => i64::try_from(before.duration().as_micros())
                .map(|us| -us)
                .unwrap_or(i64::MIN),
        }
    }
}

/// Manually advanced clock.
///
/// Clones share the same reading, so a host (or a test) can keep one handle
/// and pass another to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<i64>>,
}

impl ManualClock {
    /// Create a clock reading `start_us`.
    pub fn new(start_us: i64) -> Self {
        Self {
            now: Rc::new(Cell::new(start_us)),
        }
    }

    /// Move the clock forward by `us` microseconds (negative moves it back).
    pub fn advance(&self, us: i64) {
        self.now.set(self.now.get().saturating_add(us));
    }

    /// Set the absolute reading.
    pub fn set(&self, us: i64) {
        self.now.set(us);
    }

    /// Current reading.
    pub fn now(&self) -> i64 {
        self.now.get()
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.now.get()
    }
}

/// Timing statistics of one task.
#[derive(Debug, Clone, Default)]
pub(crate) struct Timing {
    /// Clock reading when the task was last resumed.
    pub(crate) start_us: i64,
    /// Ticks granted for the current invocation.
    pub(crate) ticks: u32,
    /// Ticks the current invocation reports having used.
    pub(crate) ticks_used: u32,
    /// Ticks used by the invocation `elapsed_us` was measured on.
    pub(crate) prev_ticks: u32,
    /// Elapsed time of the last invocation.
    pub(crate) elapsed_us: i64,
    /// Accumulated wall-clock run time, in ms.
    pub(crate) wtime_ms: u64,
    /// Smoothed cost of one tick, in µs. Zero means unknown.
    pub(crate) tick_cost: f64,
}

impl Timing {
    /// Number of ticks to grant so the invocation lasts about `target_us`.
    ///
    /// Without a cost estimate a single tick is granted. Otherwise the
    /// allotment may not move by more than `delta_factor` in either
    /// direction from the previous invocation, so one noisy measurement
    /// cannot make it oscillate.
    pub(crate) fn allot(&self, target_us: u64, delta_factor: u32) -> u32 {
        if self.tick_cost <= 0.0 {
            return 1;
        }

        let wanted = 1.0 + target_us as f64 / self.tick_cost;
        let mut ticks = if wanted >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            wanted as u32
        };

        if self.prev_ticks > 0 {
            let factor = delta_factor.max(1);
            let ceiling = self.prev_ticks.saturating_mul(factor);
            if ticks > ceiling {
                ticks = ceiling;
            } else if ticks.saturating_mul(factor) < self.prev_ticks {
                ticks = self.prev_ticks / factor;
            }
        }

        ticks.max(1)
    }

    /// Record the allotment for the coming invocation.
    pub(crate) fn grant(&mut self, ticks: u32) {
        self.ticks = ticks;
        self.ticks_used = ticks;
    }

    pub(crate) fn begin(&mut self, now_us: i64) {
        self.start_us = now_us;
    }

    /// Close the current invocation at `now_us` and return its elapsed time.
    ///
    /// A negative delta means the clock was stepped back while the task ran;
    /// the previous measurement is reused instead, rescaled by the ratio of
    /// ticks used now versus then. When `learn` is set the tick cost moves
    /// one fifth of the way toward the cost observed in this invocation.
    pub(crate) fn finish(&mut self, now_us: i64, learn: bool) -> i64 {
        let mut elapsed = now_us.saturating_sub(self.start_us);

        if elapsed < 0 {
            elapsed = self.elapsed_us;
            if self.prev_ticks != 0 {
                elapsed = elapsed.saturating_mul(i64::from(self.ticks_used))
                    / i64::from(self.prev_ticks);
            }
        }

        self.elapsed_us = elapsed;
        self.wtime_ms = self
            .wtime_ms
            .saturating_add(u64::try_from((elapsed + 500) / 1000).unwrap_or(0));
        self.prev_ticks = self.ticks_used;

        if learn && self.ticks_used > 0 {
            let observed = elapsed as f64 / f64::from(self.ticks_used);
            self.tick_cost = (4.0 * self.tick_cost + observed) / 5.0;
        }

        elapsed
    }

    /// Drop the cost estimate; the next invocation starts again at one tick.
    pub(crate) fn forget_cost(&mut self) {
        self.tick_cost = 0.0;
    }
}
