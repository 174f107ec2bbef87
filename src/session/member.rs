// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-source session membership; see
//! [RFC 3550 section 6.2.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.2.1)
//! and Appendix A.
//!
//! The [`MemberDb`] is the sole authority on whether an incoming RTP packet
//! counts, what its extended sequence number is, and whether the local
//! participant is currently a sender. It owns one [`MemberEntry`] per SSRC,
//! including the local one(s).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, trace};
use smallvec::SmallVec;

use crate::rtcp::{self, DlrrBlock, Packet, ReportBlock};
use crate::rtp::RtpPacket;
use crate::{NtpTimestamp, PacketContext, WallTime};

/// Sequential packets required before a source is considered valid.
pub(crate) const MIN_SEQUENTIAL: u32 = 2;

/// Maximum forward jump accepted as in-order, in packets.
pub(crate) const MAX_DROPOUT: u32 = 3000;

/// Maximum backwards distance accepted as reordering, in packets.
pub(crate) const MAX_MISORDER: u32 = 100;

const RTP_SEQ_MOD: u32 = 1 << 16;

/// How long a BYE'd member lingers so stragglers don't recreate it.
pub(crate) const BYE_GRACE: Duration = Duration::from_secs(2);

/// Member timeout, in deterministic reporting intervals.
const TIMEOUT_MULTIPLIER: u32 = 5;

/// Sender-status timeout, in deterministic reporting intervals.
const SENDER_TIMEOUT_MULTIPLIER: u32 = 2;

/// What the member database learned from one incoming RTP packet.
#[derive(Copy, Clone, Debug)]
pub struct Observation {
    /// `cycles << 16 | seq`; strictly increasing for in-order packets.
    pub extended_sequence_number: u32,
    /// Mapped presentation time: wall-clock based before the source's first
    /// SR, NTP-anchored after.
    pub presentation: WallTime,
    /// Whether the source has passed probation (or was fast-validated).
    pub source_valid: bool,
    /// Whether an SR has been seen from this source.
    pub rtcp_synchronized: bool,
}

/// A change in the remote view of a local source, derived from an RR block
/// (or DLRR response) naming a local SSRC.
#[derive(Clone, Debug)]
pub struct MemberUpdate {
    /// The reporting member.
    pub ssrc: u32,
    pub round_trip_time: Option<Duration>,
    pub jitter: u32,
    pub cumulative_lost: i32,
    pub fraction_lost: u8,
    pub extended_highest_seq: u32,
}

/// SDES items learned from a member, each updated independently as reports
/// arrive.
#[derive(Clone, Debug, Default)]
pub struct SdesData {
    pub cname: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub loc: Option<String>,
    pub tool: Option<String>,
    pub note: Option<String>,
}

pub struct MemberEntry {
    ssrc: u32,
    created: Instant,
    initialized: bool,
    probation: u32,
    validated_without_probation: bool,
    sender: bool,
    rtcp_synchronized: bool,
    inactive: bool,
    marked_inactive: Option<Instant>,
    sdes: SdesData,

    rtp_packets_in_interval: u32,
    rtcp_packets_in_interval: u32,

    // RFC 3550 Appendix A.1 state.
    max_seq: u16,
    cycles: u32,
    base_seq: u32,
    bad_seq: u32,
    received: u32,
    expected_prior: u32,
    received_prior: u32,
    max_misorder: u32,

    // Interarrival jitter per §6.4.1, in clock-rate units.
    jitter: u32,
    prev_diff: i32,
    prev_rtp_timestamp: u32,

    // From this source's last SR, for the LSR/DLSR fields of our reports.
    lsr: u32,
    lsr_received: Option<Instant>,

    // This member's view of the path from us, from RR blocks naming a local
    // SSRC.
    reported_jitter: u32,
    reported_lost: i32,
    reported_fraction: u8,
    round_trip_time: Option<Duration>,

    // Presentation-time mapping; re-anchored by each SR.
    sync_rtp_timestamp: u32,
    sync_wall: Option<WallTime>,

    // Last RRT XR block received, for DLRR responses.
    last_rrt: Option<(u32, Instant)>,

    last_rtp_active: Option<Instant>,
    last_active: Option<Instant>,
}

impl MemberEntry {
    pub(crate) fn new(ssrc: u32, now: Instant) -> Self {
        Self {
            ssrc,
            created: now,
            initialized: false,
            probation: MIN_SEQUENTIAL,
            validated_without_probation: false,
            sender: false,
            rtcp_synchronized: false,
            inactive: false,
            marked_inactive: None,
            sdes: SdesData::default(),
            rtp_packets_in_interval: 0,
            rtcp_packets_in_interval: 0,
            max_seq: 0,
            cycles: 0,
            base_seq: 0,
            bad_seq: RTP_SEQ_MOD + 1,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            max_misorder: MAX_MISORDER,
            jitter: 0,
            prev_diff: 0,
            prev_rtp_timestamp: 0,
            lsr: 0,
            lsr_received: None,
            reported_jitter: 0,
            reported_lost: 0,
            reported_fraction: 0,
            round_trip_time: None,
            sync_rtp_timestamp: 0,
            sync_wall: None,
            last_rrt: None,
            last_rtp_active: None,
            last_active: None,
        }
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// A source is valid once `MIN_SEQUENTIAL` consecutive packets have been
    /// seen after the initial one, or immediately upon an SDES CNAME.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.probation == 0 && !self.inactive
    }

    /// Whether the sequence space has been initialised from an RTP packet.
    #[inline]
    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn is_sender(&self) -> bool {
        self.sender
    }

    #[inline]
    pub fn is_inactive(&self) -> bool {
        self.inactive
    }

    #[inline]
    pub fn is_rtcp_synchronized(&self) -> bool {
        self.rtcp_synchronized
    }

    #[inline]
    pub fn jitter(&self) -> u32 {
        self.jitter
    }

    #[inline]
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    #[inline]
    pub fn cname(&self) -> Option<&str> {
        self.sdes.cname.as_deref()
    }

    #[inline]
    pub fn sdes(&self) -> &SdesData {
        &self.sdes
    }

    /// RTP and RTCP packets seen from this member in the current reporting
    /// interval.
    pub fn packets_in_interval(&self) -> (u32, u32) {
        (self.rtp_packets_in_interval, self.rtcp_packets_in_interval)
    }

    #[cfg(test)]
    pub(crate) fn sequence_state(&self) -> (u32, u16, u32, u32) {
        (self.base_seq, self.max_seq, self.cycles, self.received)
    }

    /// Marks valid without probation (own SSRC, or CNAME received).
    fn set_validated(&mut self) {
        self.probation = 0;
        self.validated_without_probation = true;
    }

    /// Initialises the sequence space from the first RTP packet seen.
    pub(crate) fn init_sequence(&mut self, seq: u16) {
        self.init_seq(seq);
        self.received = 1;
        if !self.validated_without_probation {
            self.probation = MIN_SEQUENTIAL;
        }
        self.initialized = true;
        trace!(
            "ssrc={:08x} start seq={} probation={}",
            self.ssrc,
            seq,
            self.probation
        );
    }

    fn init_seq(&mut self, seq: u16) {
        self.base_seq = u32::from(seq);
        self.max_seq = seq;
        self.bad_seq = RTP_SEQ_MOD + 1; // so seq == bad_seq is false
        self.cycles = 0;
        self.received = 0;
        self.received_prior = 0;
        self.expected_prior = 0;
    }

    /// The sequence update algorithm of RFC 3550 Appendix A.1. Returns true
    /// if the packet counts as received.
    fn update_seq(&mut self, seq: u16) -> bool {
        let udelta = u32::from(seq.wrapping_sub(self.max_seq));
        if self.probation > 0 {
            // Probation decrements only on strictly consecutive packets.
            if seq == self.max_seq.wrapping_add(1) {
                self.probation -= 1;
                self.max_seq = seq;
                self.received += 1;
                if self.probation == 0 {
                    debug!("ssrc={:08x} validated at seq={}", self.ssrc, seq);
                }
                return true;
            }
            self.probation = MIN_SEQUENTIAL - 1;
            self.base_seq = u32::from(seq);
            self.max_seq = seq;
            self.received = 1;
            return false;
        } else if udelta < MAX_DROPOUT {
            // in order, with permissible gap
            if seq < self.max_seq {
                // sequence number wrapped; count another 64K cycle.
                trace!("ssrc={:08x} seq wrap at {} (max {})", self.ssrc, seq, self.max_seq);
                self.cycles = self.cycles.wrapping_add(RTP_SEQ_MOD);
            }
            self.max_seq = seq;
        } else if udelta <= RTP_SEQ_MOD - self.max_misorder {
            // the sequence number made a very large jump
            if u32::from(seq) == self.bad_seq {
                // Two sequential packets: assume the other side restarted
                // without telling us, so just re-sync.
                debug!("ssrc={:08x} restart at seq={}", self.ssrc, seq);
                self.init_seq(seq);
            } else {
                self.bad_seq = (u32::from(seq) + 1) & (RTP_SEQ_MOD - 1);
                debug!("ssrc={:08x} bad seq {}", self.ssrc, seq);
                return false;
            }
        } else {
            // duplicate or reordered packet
            trace!("ssrc={:08x} duplicate or reordered seq={}", self.ssrc, seq);
        }
        self.received += 1;
        true
    }

    /// Records one incoming RTP packet: sequence update, jitter, liveness.
    /// `arrival_rtp` is the arrival time expressed in clock-rate units.
    pub(crate) fn record_rtp(&mut self, seq: u16, rtp_timestamp: u32, arrival_rtp: u32, now: Instant) {
        self.last_rtp_active = Some(now);
        self.last_active = Some(now);
        self.sender = true;
        self.rtp_packets_in_interval += 1;
        self.update_seq(seq);

        // Interarrival jitter, integer arithmetic per §6.4.1. Skipped when
        // the timestamp repeats (several packets of one frame).
        let transit = arrival_rtp.wrapping_sub(rtp_timestamp) as i32;
        if self.received > 1 && rtp_timestamp != self.prev_rtp_timestamp {
            let d = i64::from(transit.wrapping_sub(self.prev_diff)).abs();
            let adjustment = ((d - i64::from(self.jitter)) / 16) as i32;
            self.jitter = (self.jitter as i32).wrapping_add(adjustment) as u32;
        }
        self.prev_diff = transit;
        self.prev_rtp_timestamp = rtp_timestamp;
    }

    /// Maps an RTP timestamp to a presentation wall time and advances the
    /// sync reference. Before the source's first SR the local arrival clock
    /// anchors the mapping; each SR re-anchors it to the sender's NTP time.
    fn presentation_time(&mut self, rtp_timestamp: u32, clock_rate: u32, wall: WallTime) -> WallTime {
        let (sync_rtp, sync_wall) = match self.sync_wall {
            Some(w) => (self.sync_rtp_timestamp, w),
            None => (rtp_timestamp, wall),
        };
        let delta_units = rtp_timestamp.wrapping_sub(sync_rtp) as i32;
        let presentation = sync_wall.offset_secs(f64::from(delta_units) / f64::from(clock_rate));
        self.sync_rtp_timestamp = rtp_timestamp;
        self.sync_wall = Some(presentation);
        presentation
    }

    fn note_rtcp(&mut self, now: Instant) {
        self.last_active = Some(now);
        self.rtcp_packets_in_interval += 1;
    }

    fn on_sender_report(&mut self, rtp_timestamp: u32, ntp: NtpTimestamp, now: Instant, wall: WallTime) {
        self.note_rtcp(now);
        self.sender = true;
        self.rtcp_synchronized = true;
        // Re-anchor presentation mapping on the sender's NTP<->RTP pair. The
        // NTP value is trusted only for its offset from our wall clock at
        // arrival.
        let sr_wall_secs =
            (ntp.0 as i64).wrapping_sub(wall.to_ntp().0 as i64) as f64 / (1u64 << 32) as f64;
        self.sync_rtp_timestamp = rtp_timestamp;
        self.sync_wall = Some(wall.offset_secs(sr_wall_secs));
        self.lsr = ntp.mid32();
        self.lsr_received = Some(now);
    }

    /// Applies one RR block naming a local SSRC: RTT plus the remote's view
    /// of our stream.
    fn apply_report_block(
        &mut self,
        block: &rtcp::ReportBlockRef<'_>,
        arrival_ntp: NtpTimestamp,
    ) -> Option<MemberUpdate> {
        let last_sr = block.last_sr();
        if last_sr == 0 {
            return None;
        }
        let rtt_units = arrival_ntp
            .mid32()
            .wrapping_sub(block.delay_since_last_sr())
            .wrapping_sub(last_sr) as i32;
        self.round_trip_time = if rtt_units >= 0 {
            Some(Duration::from_secs_f64(f64::from(rtt_units as u32) / 65536.0))
        } else {
            Some(Duration::from_secs(0))
        };
        self.reported_jitter = block.jitter();
        self.reported_lost = block.cumulative_lost();
        self.reported_fraction = block.fraction_lost();
        Some(MemberUpdate {
            ssrc: self.ssrc,
            round_trip_time: self.round_trip_time,
            jitter: self.reported_jitter,
            cumulative_lost: self.reported_lost,
            fraction_lost: self.reported_fraction,
            extended_highest_seq: block.extended_highest_seq(),
        })
    }

    /// Updates non-empty SDES fields; CNAME receipt validates the source
    /// immediately (RFC 3550 §6.2.1).
    fn update_sdes(&mut self, items: impl Iterator<Item = (u8, Vec<u8>)>) {
        for (ty, value) in items {
            let value = match String::from_utf8(value) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if value.is_empty() {
                continue;
            }
            match ty {
                rtcp::SDES_CNAME => {
                    self.sdes.cname = Some(value);
                    self.set_validated();
                }
                rtcp::SDES_NAME => self.sdes.name = Some(value),
                rtcp::SDES_EMAIL => self.sdes.email = Some(value),
                rtcp::SDES_PHONE => self.sdes.phone = Some(value),
                rtcp::SDES_LOC => self.sdes.loc = Some(value),
                rtcp::SDES_TOOL => self.sdes.tool = Some(value),
                rtcp::SDES_NOTE => self.sdes.note = Some(value),
                _ => {}
            }
        }
    }

    fn on_bye(&mut self, now: Instant) {
        self.note_rtcp(now);
        if !self.inactive {
            debug!("ssrc={:08x} marked inactive by BYE", self.ssrc);
            self.inactive = true;
            self.marked_inactive = Some(now);
        }
    }

    /// RFC 3550 §6.2.1: a BYE'd entry lingers for a grace period so that
    /// straggler data packets don't recreate it.
    fn can_remove(&self, now: Instant) -> bool {
        match self.marked_inactive {
            Some(t) => self.inactive && now.saturating_duration_since(t) >= BYE_GRACE,
            None => false,
        }
    }

    /// The cumulative number of packets lost, clamped to the signed 24-bit
    /// range carried in report blocks (RFC 3550 A.3).
    pub fn cumulative_lost(&self) -> i32 {
        let extended_max = self.cycles.wrapping_add(u32::from(self.max_seq));
        let expected = extended_max.wrapping_sub(self.base_seq).wrapping_add(1);
        let lost = expected.wrapping_sub(self.received) as i32;
        lost.max(-0x80_0000).min(0x7F_FFFF)
    }

    /// The loss fraction over the last reporting interval (RFC 3550 A.3).
    /// Advances the interval state.
    fn lost_fraction(&mut self) -> u8 {
        let extended_max = self.cycles.wrapping_add(u32::from(self.max_seq));
        let expected = extended_max.wrapping_sub(self.base_seq).wrapping_add(1);
        let expected_interval = expected.wrapping_sub(self.expected_prior);
        self.expected_prior = expected;
        let received_interval = self.received.wrapping_sub(self.received_prior);
        self.received_prior = self.received;
        let lost_interval = expected_interval.wrapping_sub(received_interval) as i32;
        if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i32) as u8
        }
    }

    pub fn extended_highest_seq(&self) -> u32 {
        self.cycles.wrapping_add(u32::from(self.max_seq))
    }

    /// Builds this member's reception report block and resets the interval.
    pub(crate) fn finalize_report_block(&mut self, now: Instant) -> ReportBlock {
        let dlsr = match self.lsr_received {
            Some(t) => (now.saturating_duration_since(t).as_secs_f64() * 65536.0) as u32,
            None => 0,
        };
        ReportBlock {
            ssrc: self.ssrc,
            fraction_lost: self.lost_fraction(),
            cumulative_lost: self.cumulative_lost(),
            extended_highest_seq: self.extended_highest_seq(),
            jitter: self.jitter,
            last_sr: self.lsr,
            delay_since_last_sr: dlsr,
        }
    }

    fn new_reporting_interval(&mut self) {
        self.rtp_packets_in_interval = 0;
        self.rtcp_packets_in_interval = 0;
    }
}

/// Data gathered for one RTCP transmission; see
/// [`MemberDb::take_report_data`].
pub(crate) struct ReportData {
    pub we_sent: bool,
    /// One block per remote member that sent RTP this interval.
    pub sender_blocks: Vec<ReportBlock>,
    /// DLRR sub-blocks answering stored receiver-reference-time samples.
    pub receiver_dlrr: Vec<DlrrBlock>,
}

/// Everything the member database learned from one compound RTCP packet.
#[derive(Default)]
pub(crate) struct RtcpSummary {
    pub updates: Vec<MemberUpdate>,
    /// Members newly marked inactive by BYE.
    pub byes: u32,
}

pub(crate) struct MemberDb {
    members: HashMap<u32, MemberEntry>,
    local_ssrcs: SmallVec<[u32; 2]>,
    epoch: Instant,
    avg_rtcp_size: f64,
    xr_enabled: bool,
}

impl MemberDb {
    /// Creates the database with the local SSRC(s) inserted pre-validated,
    /// and the average RTCP size seeded from an estimate of our own empty
    /// compound packet (RR + SDES CNAME + IP/UDP overhead).
    pub fn new(local_ssrcs: &[u32], cname_len: usize, xr_enabled: bool, now: Instant) -> Self {
        let len = 2 + cname_len;
        let words = (len >> 2) + usize::from(len % 4 != 0);
        let estimate = (20 + 8 + ((8 + 2 + words) << 2)) as f64;
        let mut db = Self {
            members: HashMap::new(),
            local_ssrcs: SmallVec::from_slice(local_ssrcs),
            epoch: now,
            avg_rtcp_size: estimate,
            xr_enabled,
        };
        for &ssrc in local_ssrcs {
            let entry = db.members.entry(ssrc).or_insert_with(|| MemberEntry::new(ssrc, now));
            entry.set_validated();
        }
        db
    }

    fn is_local(&self, ssrc: u32) -> bool {
        self.local_ssrcs.contains(&ssrc)
    }

    fn entry_mut(&mut self, ssrc: u32, now: Instant) -> &mut MemberEntry {
        self.members.entry(ssrc).or_insert_with(|| {
            debug!("inserting new ssrc={:08x} into member db", ssrc);
            MemberEntry::new(ssrc, now)
        })
    }

    pub fn entry(&self, ssrc: u32) -> Option<&MemberEntry> {
        self.members.get(&ssrc)
    }

    fn arrival_rtp_units(&self, now: Instant, clock_rate: u32) -> u32 {
        let elapsed = now.saturating_duration_since(self.epoch);
        (elapsed.as_secs_f64() * f64::from(clock_rate)) as u64 as u32
    }

    /// Observes one incoming RTP packet: inserts the entry if absent, runs
    /// the sequence update algorithm, updates jitter and liveness, and
    /// computes the extended sequence number and presentation time. CSRCs
    /// are inserted as (non-sender) participants.
    pub fn observe_rtp(
        &mut self,
        packet: &RtpPacket,
        clock_rate: u32,
        ctx: &PacketContext,
    ) -> Observation {
        let now = ctx.received();
        let wall = ctx.received_wall();
        let arrival_rtp = self.arrival_rtp_units(now, clock_rate);
        let entry = self.entry_mut(packet.ssrc, now);
        if !entry.initialized {
            entry.init_sequence(packet.sequence_number);
            entry.last_rtp_active = Some(now);
            entry.last_active = Some(now);
            entry.sender = true;
            entry.rtp_packets_in_interval += 1;
            // seed the transit baseline for the jitter estimator
            entry.prev_diff = arrival_rtp.wrapping_sub(packet.timestamp) as i32;
            entry.prev_rtp_timestamp = packet.timestamp;
        } else {
            entry.record_rtp(packet.sequence_number, packet.timestamp, arrival_rtp, now);
        }
        let extended = entry.cycles | u32::from(packet.sequence_number);
        let observation = Observation {
            extended_sequence_number: extended,
            presentation: entry.presentation_time(packet.timestamp, clock_rate, wall),
            source_valid: entry.is_valid(),
            rtcp_synchronized: entry.rtcp_synchronized,
        };
        for &csrc in &packet.csrcs {
            let e = self.entry_mut(csrc, now);
            e.last_active = Some(now);
        }
        observation
    }

    /// Records a locally sent RTP packet against the local member entry.
    pub fn note_sent_rtp(&mut self, ssrc: u32, now: Instant) {
        let entry = self.entry_mut(ssrc, now);
        entry.sender = true;
        entry.last_rtp_active = Some(now);
        entry.last_active = Some(now);
    }

    /// Folds one sent or received compound RTCP packet size (including
    /// IP/UDP overhead) into the running average, per §6.3.3.
    pub fn note_rtcp_size(&mut self, size_with_overhead: usize) {
        self.avg_rtcp_size = 0.0625 * size_with_overhead as f64 + 0.9375 * self.avg_rtcp_size;
    }

    /// Dispatches each packet of a compound RTCP bundle to the per-type
    /// handlers. The average-size update happens regardless of content.
    pub fn observe_rtcp(
        &mut self,
        data: &[u8],
        ctx: &PacketContext,
    ) -> Result<RtcpSummary, String> {
        let now = ctx.received();
        let wall = ctx.received_wall();
        let arrival_ntp = wall.to_ntp();
        self.note_rtcp_size(data.len() + rtcp::IP_UDP_OVERHEAD);
        let mut summary = RtcpSummary::default();
        let mut rest = data;
        while !rest.is_empty() {
            let (pkt, after) = Packet::parse(rest)?;
            rest = after;
            match pkt {
                Packet::SenderReport(sr) => {
                    let ssrc = sr.ssrc();
                    let mut updates = SmallVec::<[MemberUpdate; 2]>::new();
                    {
                        let local = &self.local_ssrcs;
                        let entry = self.members.entry(ssrc).or_insert_with(|| {
                            debug!("inserting new ssrc={:08x} into member db", ssrc);
                            MemberEntry::new(ssrc, now)
                        });
                        entry.on_sender_report(sr.rtp_timestamp(), sr.ntp_timestamp(), now, wall);
                        for block in sr.report_blocks() {
                            if local.contains(&block.ssrc()) {
                                if let Some(u) = entry.apply_report_block(&block, arrival_ntp) {
                                    updates.push(u);
                                }
                            }
                        }
                    }
                    summary.updates.extend(updates);
                }
                Packet::ReceiverReport(rr) => {
                    let ssrc = rr.ssrc();
                    let mut updates = SmallVec::<[MemberUpdate; 2]>::new();
                    {
                        let local = &self.local_ssrcs;
                        let entry = self.members.entry(ssrc).or_insert_with(|| {
                            debug!("inserting new ssrc={:08x} into member db", ssrc);
                            MemberEntry::new(ssrc, now)
                        });
                        entry.note_rtcp(now);
                        for block in rr.report_blocks() {
                            if local.contains(&block.ssrc()) {
                                if let Some(u) = entry.apply_report_block(&block, arrival_ntp) {
                                    updates.push(u);
                                }
                            }
                        }
                    }
                    summary.updates.extend(updates);
                }
                Packet::SourceDescription(sdes) => {
                    for chunk in sdes.chunks() {
                        if let Some(entry) = self.members.get_mut(&chunk.ssrc) {
                            entry.update_sdes(chunk.items().map(|(t, v)| (t, v.to_vec())));
                        }
                    }
                }
                Packet::Bye(bye) => {
                    for ssrc in bye.ssrcs() {
                        if let Some(entry) = self.members.get_mut(&ssrc) {
                            if !entry.inactive {
                                summary.byes += 1;
                            }
                            entry.on_bye(now);
                        }
                    }
                }
                Packet::ExtendedReport(xr) => {
                    if !self.xr_enabled {
                        debug!("XR received but XRs are not enabled for this session");
                        continue;
                    }
                    let ssrc = xr.ssrc();
                    let mut rtt = None;
                    for block in xr.blocks() {
                        if let Some(ntp) = block.rrt_ntp() {
                            let entry = self.entry_mut(ssrc, now);
                            entry.last_rrt = Some((ntp.mid32(), now));
                        }
                        for (reportee, last_rr, dlrr) in block.dlrr_sub_blocks() {
                            if self.is_local(reportee) && last_rr != 0 {
                                let units = arrival_ntp
                                    .mid32()
                                    .wrapping_sub(dlrr)
                                    .wrapping_sub(last_rr)
                                    as i32;
                                rtt = Some(if units >= 0 {
                                    Duration::from_secs_f64(f64::from(units as u32) / 65536.0)
                                } else {
                                    Duration::from_secs(0)
                                });
                            }
                        }
                    }
                    let entry = self.entry_mut(ssrc, now);
                    entry.note_rtcp(now);
                    if let Some(rtt) = rtt {
                        entry.round_trip_time = Some(rtt);
                    }
                }
                Packet::TransportFeedback(_) | Packet::PayloadFeedback(_) | Packet::App(_) => {
                    // Routed by the session; only liveness matters here.
                }
                Packet::Unknown(pkt) => debug!("rtcp: unknown pt {:?}", pkt.payload_type()),
            }
        }
        Ok(summary)
    }

    /// Gathers report data for one RTCP transmission and begins a new
    /// reporting interval. Call exactly once per transmission.
    pub fn take_report_data(&mut self, now: Instant) -> ReportData {
        let we_sent = self
            .local_ssrcs
            .first()
            .and_then(|s| self.members.get(s))
            .map(|e| e.sender)
            .unwrap_or(false);
        let local = self.local_ssrcs.clone();
        let mut sender_blocks = Vec::new();
        let mut receiver_dlrr = Vec::new();
        for (&ssrc, entry) in self.members.iter_mut() {
            if !local.contains(&ssrc) {
                if entry.sender {
                    sender_blocks.push(entry.finalize_report_block(now));
                } else if let Some((last_rr, received)) = entry.last_rrt {
                    receiver_dlrr.push(DlrrBlock {
                        ssrc,
                        last_rr,
                        delay_since_last_rr: (now.saturating_duration_since(received).as_secs_f64()
                            * 65536.0) as u32,
                    });
                }
            }
            entry.new_reporting_interval();
        }
        sender_blocks.sort_unstable_by_key(|b| b.ssrc);
        receiver_dlrr.sort_unstable_by_key(|b| b.ssrc);
        ReportData {
            we_sent,
            sender_blocks,
            receiver_dlrr,
        }
    }

    /// Times out silent members and ages sender status, per §6.3.5.
    /// `deterministic_interval` is Td computed without randomization.
    pub fn sweep(&mut self, now: Instant, deterministic_interval: Duration) {
        let timeout = deterministic_interval * TIMEOUT_MULTIPLIER;
        let sender_timeout = deterministic_interval * SENDER_TIMEOUT_MULTIPLIER;
        let local = self.local_ssrcs.clone();
        let mut removals = Vec::new();
        for (&ssrc, entry) in self.members.iter_mut() {
            let last = entry.last_active.unwrap_or(entry.created);
            if !local.contains(&ssrc)
                && (now.saturating_duration_since(last) >= timeout || entry.can_remove(now))
            {
                removals.push(ssrc);
                continue;
            }
            let last_rtp = entry.last_rtp_active.unwrap_or(entry.created);
            if entry.sender && now.saturating_duration_since(last_rtp) >= sender_timeout {
                debug!("ssrc={:08x} is no longer a sender", ssrc);
                entry.sender = false;
            }
        }
        for ssrc in removals {
            debug!("removing timed-out ssrc={:08x} from member db", ssrc);
            self.members.remove(&ssrc);
        }
    }

    pub fn active_members(&self) -> u32 {
        self.members.values().filter(|e| e.is_valid()).count() as u32
    }

    pub fn senders(&self) -> u32 {
        self.members.values().filter(|e| e.sender).count() as u32
    }

    pub fn is_local_sender(&self) -> bool {
        self.local_ssrcs
            .first()
            .and_then(|s| self.members.get(s))
            .map(|e| e.sender)
            .unwrap_or(false)
    }

    pub fn avg_rtcp_size(&self) -> f64 {
        self.avg_rtcp_size
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }
}
