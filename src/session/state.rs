// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mutable per-session identity: local SSRCs, sequence counters, and the
//! randomized RTP timestamp base.

use std::time::Instant;

use rand::Rng;

use crate::session::clock::ReferenceClock;

pub struct SessionState {
    ssrc: u32,
    rtx_ssrc: u32,
    next_sequence_number: u16,
    next_rtx_sequence_number: u16,
    timestamp_base: u32,
    epoch: Instant,
}

impl SessionState {
    /// Creates fresh identity with randomized SSRCs, initial sequence
    /// numbers, and timestamp base, per RFC 3550 §5.1.
    pub fn new(clock: &dyn ReferenceClock) -> Self {
        let mut rng = rand::thread_rng();
        let ssrc = rng.gen();
        let mut rtx_ssrc: u32 = rng.gen();
        while rtx_ssrc == ssrc {
            rtx_ssrc = rng.gen();
        }
        Self {
            ssrc,
            rtx_ssrc,
            next_sequence_number: rng.gen(),
            next_rtx_sequence_number: rng.gen(),
            timestamp_base: rng.gen(),
            epoch: clock.now(),
        }
    }

    /// Fixed identity for tests.
    #[doc(hidden)]
    pub fn with_identity(ssrc: u32, rtx_ssrc: u32, start_seq: u16, clock: &dyn ReferenceClock) -> Self {
        Self {
            ssrc,
            rtx_ssrc,
            next_sequence_number: start_seq,
            next_rtx_sequence_number: 0,
            timestamp_base: 0,
            epoch: clock.now(),
        }
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    #[inline]
    pub fn rtx_ssrc(&self) -> u32 {
        self.rtx_ssrc
    }

    #[inline]
    pub fn timestamp_base(&self) -> u32 {
        self.timestamp_base
    }

    pub(crate) fn next_sequence_number(&mut self) -> u16 {
        let sn = self.next_sequence_number;
        self.next_sequence_number = sn.wrapping_add(1);
        sn
    }

    pub(crate) fn next_rtx_sequence_number(&mut self) -> u16 {
        let sn = self.next_rtx_sequence_number;
        self.next_rtx_sequence_number = sn.wrapping_add(1);
        sn
    }

    /// The RTP timestamp corresponding to `now` for the given clock rate:
    /// the randomized base plus elapsed session time in clock-rate units.
    pub fn media_timestamp(&self, now: Instant, clock_rate: u32) -> u32 {
        let elapsed = now.saturating_duration_since(self.epoch);
        let units = (elapsed.as_secs_f64() * f64::from(clock_rate)) as u64;
        self.timestamp_base.wrapping_add(units as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::clock::ManualClock;
    use std::time::Duration;

    #[test]
    fn sequence_counters_wrap_independently() {
        let clock = ManualClock::new();
        let mut state = SessionState::with_identity(1, 2, 65535, &clock);
        assert_eq!(state.next_sequence_number(), 65535);
        assert_eq!(state.next_sequence_number(), 0);
        assert_eq!(state.next_rtx_sequence_number(), 0);
        assert_eq!(state.next_rtx_sequence_number(), 1);
    }

    #[test]
    fn media_timestamp_advances_at_clock_rate() {
        let clock = ManualClock::new();
        let state = SessionState::with_identity(1, 2, 0, &clock);
        let t0 = state.media_timestamp(clock.now(), 90_000);
        clock.advance(Duration::from_secs(2));
        let t1 = state.media_timestamp(clock.now(), 90_000);
        assert_eq!(t1.wrapping_sub(t0), 180_000);
    }
}
