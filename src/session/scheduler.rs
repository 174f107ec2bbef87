// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP transmission scheduling; see
//! [RFC 3550 section 6.3](https://datatracker.ietf.org/doc/html/rfc3550#section-6.3)
//! and Appendix A.7.

use std::time::{Duration, Instant};

use log::trace;
use rand::Rng;

/// Minimum RTCP transmission interval. Halved for the very first report and
/// in reduced-minimum mode.
pub(crate) const RTCP_MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Fraction of the session bandwidth allotted to RTCP.
pub(crate) const RTCP_BANDWIDTH_FRACTION: f64 = 0.05;

/// Divisor compensating for the fact that the timer reconsideration
/// algorithm converges to a value below the intended average: e - 3/2.
pub(crate) const COMPENSATION: f64 = std::f64::consts::E - 1.5;

/// Above this many members, a departing participant reschedules its BYE
/// instead of sending immediately (§6.3.7).
pub(crate) const IMMEDIATE_BYE_LIMIT: u32 = 50;

/// Member-database figures feeding the interval computation.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SchedulerInputs {
    pub we_sent: bool,
    pub senders: u32,
    pub members: u32,
    /// Average compound packet size, including IP/UDP overhead.
    pub avg_rtcp_size: f64,
}

/// Computes the RTCP transmission interval per RFC 3550 A.7.
pub(crate) fn compute_rtcp_interval(
    inputs: &SchedulerInputs,
    session_bw_kbps: u32,
    use_reduced_minimum: bool,
    initial: bool,
    randomize: bool,
) -> Duration {
    let mut min_time = RTCP_MIN_INTERVAL.as_secs_f64();
    if initial || use_reduced_minimum {
        min_time /= 2.0;
    }
    // RTCP bandwidth in octets per second.
    let mut rtcp_bw = f64::from(session_bw_kbps) * RTCP_BANDWIDTH_FRACTION * 125.0;
    let mut n = f64::from(inputs.members.max(1));
    if f64::from(inputs.senders) <= n * 0.25 {
        // Senders get a quarter of the RTCP bandwidth among themselves;
        // above that fraction everyone shares proportionally.
        if inputs.we_sent {
            rtcp_bw *= 0.25;
            n = f64::from(inputs.senders.max(1));
        } else {
            rtcp_bw *= 0.75;
            n -= f64::from(inputs.senders);
        }
    }
    let mut t = if rtcp_bw > 0.0 {
        inputs.avg_rtcp_size * n / rtcp_bw
    } else {
        min_time
    };
    if t < min_time {
        t = min_time;
    }
    if randomize {
        t *= rand::thread_rng().gen_range(0.5..1.5);
        t /= COMPENSATION;
    }
    Duration::from_secs_f64(t)
}

/// What to do when the RTCP timer fires.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TimerVerdict {
    /// Transmit now, then call [`RtcpScheduler::schedule_next`].
    Send,
    /// Membership or packet-size growth pushed the interval out; wait again.
    Reschedule(Instant),
}

/// Reconsideration-based transmission timer state: `tp` (last transmission),
/// `tn` (next scheduled), and `pmembers` (member count at scheduling time).
pub(crate) struct RtcpScheduler {
    tp: Instant,
    tn: Instant,
    pmembers: u32,
    initial: bool,
    session_bw_kbps: u32,
    use_reduced_minimum: bool,
}

impl RtcpScheduler {
    pub fn new(now: Instant, session_bw_kbps: u32, use_reduced_minimum: bool) -> Self {
        Self {
            tp: now,
            tn: now,
            pmembers: 1,
            initial: true,
            session_bw_kbps,
            use_reduced_minimum,
        }
    }

    #[inline]
    pub fn next_deadline(&self) -> Instant {
        self.tn
    }

    #[inline]
    pub fn is_initial(&self) -> bool {
        self.initial
    }

    /// Schedules the next transmission relative to `now`, typically right
    /// after a transmission (or at session start).
    pub fn schedule_next(&mut self, now: Instant, inputs: &SchedulerInputs) -> Instant {
        let t = compute_rtcp_interval(
            inputs,
            self.session_bw_kbps,
            self.use_reduced_minimum,
            self.initial,
            true,
        );
        trace!("next RTCP interval expires in {:?}", t);
        self.tn = now + t;
        self.pmembers = inputs.members.max(1);
        self.tn
    }

    /// Applies timer reconsideration at expiry: the interval is recomputed
    /// from current membership, and if it now ends later than `now`, the
    /// transmission is deferred rather than sent (§6.3.6).
    pub fn on_timer(&mut self, now: Instant, inputs: &SchedulerInputs) -> TimerVerdict {
        let t = compute_rtcp_interval(
            inputs,
            self.session_bw_kbps,
            self.use_reduced_minimum,
            self.initial,
            true,
        );
        let tn = self.tp + t;
        self.pmembers = inputs.members.max(1);
        if tn <= now {
            self.tp = now;
            self.initial = false;
            TimerVerdict::Send
        } else {
            trace!("RTCP reconsideration deferred transmission by {:?}", tn - now);
            self.tn = tn;
            TimerVerdict::Reschedule(tn)
        }
    }

    /// Reverse reconsideration (§6.3.4): a BYE shrank the membership below
    /// `pmembers`, so the next transmission moves earlier.
    pub fn reverse_reconsider(&mut self, now: Instant, members: u32) {
        if self.pmembers == 0 || members >= self.pmembers {
            return;
        }
        let ratio = f64::from(members) / f64::from(self.pmembers);
        if self.tn > now {
            let remaining = (self.tn - now).as_secs_f64() * ratio;
            self.tn = now + Duration::from_secs_f64(remaining);
        } else {
            self.tn = now;
        }
        let since_tp = now.saturating_duration_since(self.tp).as_secs_f64() * ratio;
        self.tp = now
            .checked_sub(Duration::from_secs_f64(since_tp))
            .unwrap_or(now);
        self.pmembers = members.max(1);
    }

    /// The delay before the terminating BYE per §6.3.7: members and senders
    /// reset to the lone departing participant, `initial` set, and the
    /// average size taken from the BYE compound itself.
    pub fn bye_interval(&self, bye_size_with_overhead: f64) -> Duration {
        compute_rtcp_interval(
            &SchedulerInputs {
                we_sent: false,
                senders: 0,
                members: 1,
                avg_rtcp_size: bye_size_with_overhead,
            },
            self.session_bw_kbps,
            self.use_reduced_minimum,
            true,
            true,
        )
    }

    /// The deterministic (unrandomized, receiver-role) interval Td used for
    /// member and sender timeouts (§6.3.5).
    pub fn deterministic_interval(&self, inputs: &SchedulerInputs) -> Duration {
        compute_rtcp_interval(
            &SchedulerInputs {
                we_sent: false,
                ..*inputs
            },
            self.session_bw_kbps,
            self.use_reduced_minimum,
            false,
            false,
        )
    }
}
