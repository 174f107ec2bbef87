// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multipath RTP: a per-subflow sequence space carried in a one-byte RTP
//! header extension, per-flow reception accounting, and `(flow id, FSSN)`
//! feedback routing.
//!
//! Everything here compiles out when the `mprtp` cargo feature is off.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use log::trace;

use crate::ext::ExtensionBlock;
use crate::rtcp::ReportBlock;
use crate::rtp::RtpPacket;
use crate::session::member::MemberEntry;

/// Retransmission lookups keep this many recent (flow, FSSN) → sequence
/// mappings.
const SN_MAP_CAPACITY: usize = 4096;

/// The subflow header element: flow id and flow-specific sequence number,
/// both big-endian 16-bit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubflowHeader {
    pub flow_id: u16,
    pub sequence_number: u16,
}

impl SubflowHeader {
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        Some(Self {
            flow_id: u16::from_be_bytes([data[0], data[1]]),
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    pub fn encode(&self) -> [u8; 4] {
        let f = self.flow_id.to_be_bytes();
        let s = self.sequence_number.to_be_bytes();
        [f[0], f[1], s[0], s[1]]
    }
}

/// Per-session multipath state: send-side FSSN counters and receive-side
/// per-flow accounting (reusing the member entry's sequence machinery with
/// the flow id standing in for the SSRC).
pub(crate) struct MpRtpState {
    extension_id: u8,
    tx_next_fssn: HashMap<u16, u16>,
    rx_flows: HashMap<u16, MemberEntry>,
    sn_map: HashMap<(u16, u16), u16>,
    sn_order: VecDeque<(u16, u16)>,
}

impl MpRtpState {
    pub fn new(extension_id: u8) -> Self {
        Self {
            extension_id,
            tx_next_fssn: HashMap::new(),
            rx_flows: HashMap::new(),
            sn_map: HashMap::new(),
            sn_order: VecDeque::new(),
        }
    }

    #[inline]
    pub fn extension_id(&self) -> u8 {
        self.extension_id
    }

    /// Assigns the next FSSN on `flow_id` and writes the subflow header
    /// extension element into the packet.
    pub fn stamp(&mut self, packet: &mut RtpPacket, flow_id: u16) -> SubflowHeader {
        let next = self.tx_next_fssn.entry(flow_id).or_insert(0);
        let header = SubflowHeader {
            flow_id,
            sequence_number: *next,
        };
        *next = next.wrapping_add(1);
        let ext = packet.extension.get_or_insert_with(ExtensionBlock::one_byte);
        ext.push(self.extension_id, &header.encode());
        if self.sn_order.len() == SN_MAP_CAPACITY {
            if let Some(old) = self.sn_order.pop_front() {
                self.sn_map.remove(&old);
            }
        }
        self.sn_map
            .insert((flow_id, header.sequence_number), packet.sequence_number);
        self.sn_order.push_back((flow_id, header.sequence_number));
        trace!(
            "stamped flow={} fssn={} (seq={})",
            flow_id,
            header.sequence_number,
            packet.sequence_number
        );
        header
    }

    /// Decodes the subflow header of an incoming packet, if present, and
    /// updates the flow's sequence space. `arrival_rtp` is the arrival time
    /// in clock-rate units, as for the aggregate member entry.
    pub fn observe(
        &mut self,
        packet: &RtpPacket,
        arrival_rtp: u32,
        now: Instant,
    ) -> Option<SubflowHeader> {
        let data = packet.extension.as_ref()?.get(self.extension_id)?;
        let header = SubflowHeader::decode(data)?;
        let entry = self
            .rx_flows
            .entry(header.flow_id)
            .or_insert_with(|| MemberEntry::new(u32::from(header.flow_id), now));
        if !entry.is_initialized() {
            entry.init_sequence(header.sequence_number);
        } else {
            entry.record_rtp(header.sequence_number, packet.timestamp, arrival_rtp, now);
        }
        Some(header)
    }

    /// The original transport sequence number for a `(flow, FSSN)` pair
    /// named by multipath feedback.
    pub fn lookup_sequence_number(&self, flow_id: u16, fssn: u16) -> Option<u16> {
        self.sn_map.get(&(flow_id, fssn)).copied()
    }

    /// Per-flow report blocks for the additional per-subflow receiver
    /// reports, ordered by flow id.
    pub fn flow_report_blocks(&mut self, now: Instant) -> Vec<(u16, ReportBlock)> {
        let mut blocks: Vec<(u16, ReportBlock)> = self
            .rx_flows
            .iter_mut()
            .map(|(&flow, entry)| (flow, entry.finalize_report_block(now)))
            .collect();
        blocks.sort_unstable_by_key(|(flow, _)| *flow);
        blocks
    }

    /// Receive-side flow ids seen so far.
    pub fn flow_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.rx_flows.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::clock::{ManualClock, ReferenceClock};
    use bytes::Bytes;
    use smallvec::SmallVec;

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket {
            marker: false,
            payload_type: 96,
            sequence_number: seq,
            timestamp: 0,
            ssrc: 0x42,
            csrcs: SmallVec::new(),
            extension: None,
            payload: Bytes::from_static(b"p"),
        }
    }

    #[test]
    fn stamp_assigns_independent_fssn_spaces() {
        let mut mp = MpRtpState::new(5);
        let mut p1 = packet(100);
        let mut p2 = packet(101);
        let mut p3 = packet(102);
        assert_eq!(mp.stamp(&mut p1, 0).sequence_number, 0);
        assert_eq!(mp.stamp(&mut p2, 1).sequence_number, 0);
        assert_eq!(mp.stamp(&mut p3, 0).sequence_number, 1);
        assert_eq!(mp.lookup_sequence_number(0, 1), Some(102));
        assert_eq!(mp.lookup_sequence_number(1, 0), Some(101));
        assert_eq!(mp.lookup_sequence_number(1, 1), None);
    }

    #[test]
    fn stamp_then_observe_round_trip() {
        let clock = ManualClock::new();
        let mut tx = MpRtpState::new(5);
        let mut rx = MpRtpState::new(5);
        for seq in 0u16..3 {
            let mut p = packet(seq);
            tx.stamp(&mut p, 2);
            let wire = p.serialize();
            let parsed = RtpPacket::parse(wire).unwrap();
            let header = rx.observe(&parsed, 0, clock.now()).unwrap();
            assert_eq!(header.flow_id, 2);
            assert_eq!(header.sequence_number, seq);
        }
        assert_eq!(rx.flow_ids(), vec![2]);
        let blocks = rx.flow_report_blocks(clock.now());
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].1.extended_highest_seq, 2);
    }

    #[test]
    fn observe_without_subflow_header_is_none() {
        let clock = ManualClock::new();
        let mut rx = MpRtpState::new(5);
        assert!(rx.observe(&packet(1), 0, clock.now()).is_none());
    }
}
