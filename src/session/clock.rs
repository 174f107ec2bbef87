// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reference clock for RTP/NTP timestamp derivation.
//!
//! The session never calls `Instant::now()`/`WallTime::now()` directly;
//! everything goes through a [`ReferenceClock`] so tests can drive time.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::{NtpTimestamp, WallTime};

pub trait ReferenceClock: Send + Sync {
    /// A monotonic instant, used for intervals (RTCP scheduling, timeouts,
    /// RTX windows, jitter arrival times).
    fn now(&self) -> Instant;

    /// The wall-clock time, used for NTP timestamps in sender reports and
    /// for presentation times.
    fn now_wall(&self) -> WallTime;

    fn now_ntp(&self) -> NtpTimestamp {
        self.now_wall().to_ntp()
    }
}

/// The process clocks, unmodified.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl ReferenceClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_wall(&self) -> WallTime {
        WallTime::now()
    }
}

/// A clock that only moves when told to. Both the monotonic and wall views
/// advance together.
pub struct ManualClock {
    base: Instant,
    base_wall: WallTime,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            base_wall: WallTime::now(),
            offset: Mutex::new(Duration::from_secs(0)),
        }
    }

    pub fn advance(&self, d: Duration) {
        *self.offset.lock().unwrap() += d;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceClock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }

    fn now_wall(&self) -> WallTime {
        self.base_wall
            .offset_secs(self.offset.lock().unwrap().as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_both_views() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        let w0 = clock.now_wall();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - t0, Duration::from_millis(1500));
        assert!(clock.now_wall() > w0);
    }
}
