// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Monotonic clock calibration.
//!
//! The scheduler and the cascading timer queue both operate on raw monotonic
//! cycle counts (`u64`), not [`std::time::Instant`], so that the timer wheel's
//! arithmetic (`phase`, `baseTime`, bin-width multiplication) stays in cheap
//! integer operations. [`Clock`] is the one place that translates between
//! wall/monotonic time and those cycle counts.

use std::time::{Duration, Instant as StdInstant};

/// A raw monotonic timestamp, in [`Clock::resolution`]-sized units.
///
/// Cycles are only meaningful relative to other cycles produced by the same
/// [`Clock`]; they carry no epoch.
pub type Cycles = u64;

/// Calibrates [`Cycles`] against the operating system's monotonic clock.
///
/// A `Clock` is created once per [`Reactor`](crate::reactor::Reactor) and
/// shared by the scheduler and the [`Ctq`](crate::ctq::Ctq). `resolution` is
/// the duration represented by a single cycle -- this is the same value as
/// the reactor's `timer_granularity` option, since CTQ level-0 bins are one
/// cycle wide.
#[derive(Debug, Clone)]
pub struct Clock {
    epoch: StdInstant,
    resolution: Duration,
}

impl Clock {
    /// Creates a clock whose epoch is "now" and whose cycle width is `resolution`.
    ///
    /// # Panics
    ///
    /// Panics if `resolution` is zero.
    #[must_use]
    pub fn new(resolution: Duration) -> Self {
        assert!(!resolution.is_zero(), "clock resolution must be non-zero");
        Self {
            epoch: StdInstant::now(),
            resolution,
        }
    }

    /// The duration represented by a single cycle.
    #[must_use]
    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// Returns the current time as a cycle count since this clock's epoch.
    #[must_use]
    pub fn now_cycles(&self) -> Cycles {
        self.duration_to_cycles(self.epoch.elapsed())
    }

    /// Converts a [`Duration`] relative to the epoch into whole cycles, rounding down.
    #[must_use]
    pub fn duration_to_cycles(&self, d: Duration) -> Cycles {
        (d.as_nanos() / self.resolution.as_nanos().max(1)) as Cycles
    }

    /// Converts a cycle count back into a [`Duration`] since the epoch.
    #[must_use]
    pub fn cycles_to_duration(&self, cycles: Cycles) -> Duration {
        let nanos = self.resolution.as_nanos().saturating_mul(u128::from(cycles));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Returns the deadline, in cycles, for `duration` from now.
    #[must_use]
    pub fn deadline_in(&self, duration: Duration) -> Cycles {
        self.now_cycles() + self.duration_to_cycles(duration).max(1)
    }

    /// Returns a deadline so far in the future it will never practically fire,
    /// used as the "infinite" timeout sentinel.
    #[must_use]
    pub fn far_future(&self) -> Cycles {
        Cycles::MAX / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_round_trip_monotonic() {
        let clock = Clock::new(Duration::from_millis(1));
        let a = clock.now_cycles();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.now_cycles();
        assert!(b > a);
        assert!(b - a >= 3);
    }

    #[test]
    fn deadline_in_is_ahead_of_now() {
        let clock = Clock::new(Duration::from_millis(1));
        let now = clock.now_cycles();
        let deadline = clock.deadline_in(Duration::from_millis(10));
        assert!(deadline > now);
    }
}
