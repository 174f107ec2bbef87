// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Send-side retransmission buffering per
//! [RFC 4588](https://datatracker.ietf.org/doc/html/rfc4588) (SSRC
//! multiplexing), plus the receive-side recent-arrival window used to build
//! feedback.
//!
//! Three mutually exclusive retention modes, selected at session start:
//! a bounded ring, per-packet eviction timers (drained by the session
//! task), or explicit ACK-driven eviction. Stored payloads are refcounted
//! [`Bytes`], so retaining and retransmitting never copies media bytes.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, trace};

use crate::rtp::RtpPacket;
use crate::session::parameters::RtxPolicy;
use crate::session::state::SessionState;

/// Receive-side arrivals remembered for feedback generation.
const DEFAULT_RECENT_ARRIVALS: usize = 1000;

struct StoredPacket {
    packet: RtpPacket,
    stored_at: Instant,
    acked_at: Option<Instant>,
    nacked_at: Option<Instant>,
}

/// An incoming retransmission mapped back onto the original stream.
#[derive(Debug)]
pub struct RecoveredPacket {
    /// The packet with its original sequence number restored and the RTX
    /// prefix stripped from the payload.
    pub packet: RtpPacket,
    pub original_sequence_number: u16,
    /// Original (flow id, flow-specific sequence number), for multipath
    /// retransmissions.
    pub subflow: Option<(u16, u16)>,
}

pub struct TransmissionManager {
    policy: RtxPolicy,
    rtx_payload_type: u8,
    /// When set, stored packets carry a subflow header under this extension
    /// id and RTX packets use the 6-byte multipath prefix.
    subflow_extension_id: Option<u8>,
    store: HashMap<u16, StoredPacket>,
    order: VecDeque<u16>,
    /// Eviction deadlines in insertion order (monotonic), NACK-timed mode.
    deadlines: VecDeque<(Instant, u16)>,
    recent_arrivals: VecDeque<(u32, Instant)>,
    recent_capacity: usize,
}

impl TransmissionManager {
    pub fn new(policy: RtxPolicy, rtx_payload_type: u8, subflow_extension_id: Option<u8>) -> Self {
        debug!(
            "transmission manager: policy {:?}, rtx pt {}",
            policy, rtx_payload_type
        );
        Self {
            policy,
            rtx_payload_type,
            subflow_extension_id,
            store: HashMap::new(),
            order: VecDeque::new(),
            deadlines: VecDeque::new(),
            recent_arrivals: VecDeque::new(),
            recent_capacity: DEFAULT_RECENT_ARRIVALS,
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Retains a copy of an outgoing packet. Retransmissions themselves are
    /// never stored (no RTX-of-RTX).
    pub fn store(&mut self, packet: &RtpPacket, now: Instant) {
        if packet.payload_type == self.rtx_payload_type {
            return;
        }
        let seq = packet.sequence_number;
        trace!("storing seq={} for retransmission", seq);
        self.store.insert(
            seq,
            StoredPacket {
                packet: packet.clone(),
                stored_at: now,
                acked_at: None,
                nacked_at: None,
            },
        );
        self.order.push_back(seq);
        match self.policy {
            RtxPolicy::Circular { depth } => {
                while self.order.len() > depth {
                    if let Some(oldest) = self.order.pop_front() {
                        self.store.remove(&oldest);
                    }
                }
            }
            RtxPolicy::NackTimed { window } => {
                self.deadlines.push_back((now + window, seq));
            }
            RtxPolicy::AckDriven => {}
        }
    }

    /// Builds the RTX packet for `original_seq`, if it is still retained:
    /// RTX payload type and SSRC, the next RTX sequence number, the
    /// original RTP timestamp, and the original sequence number (plus flow
    /// id and FSSN for multipath) prefixed to the payload.
    pub fn make_rtx(&self, state: &mut SessionState, original_seq: u16) -> Option<RtpPacket> {
        let stored = match self.store.get(&original_seq) {
            Some(s) => s,
            None => {
                debug!("no RTX for seq={}: not in buffer", original_seq);
                return None;
            }
        };
        let original = &stored.packet;
        let mut payload = BytesMut::with_capacity(original.payload.len() + 6);
        payload.put_u16(original_seq);
        if let Some(id) = self.subflow_extension_id {
            let subflow = original
                .extension
                .as_ref()
                .and_then(|e| e.get(id))
                .filter(|d| d.len() >= 4);
            match subflow {
                Some(d) => payload.put_slice(&d[..4]),
                // No subflow recorded; an all-zero pair keeps the prefix
                // length consistent for the peer.
                None => payload.put_u32(0),
            }
        }
        payload.put_slice(&original.payload);
        let rtx = RtpPacket {
            marker: original.marker,
            payload_type: self.rtx_payload_type,
            sequence_number: state.next_rtx_sequence_number(),
            timestamp: original.timestamp,
            ssrc: state.rtx_ssrc(),
            csrcs: original.csrcs.clone(),
            extension: original.extension.clone(),
            payload: payload.freeze(),
        };
        trace!(
            "generated RTX seq={} for original seq={} ({} payload bytes)",
            rtx.sequence_number,
            original_seq,
            rtx.payload.len()
        );
        Some(rtx)
    }

    /// Maps a received retransmission back onto the original stream,
    /// stripping the 2-byte (or 6-byte multipath) prefix.
    pub fn process_rtx(&self, mut packet: RtpPacket) -> Result<RecoveredPacket, String> {
        let prefix = if self.subflow_extension_id.is_some() { 6 } else { 2 };
        if packet.payload.len() < prefix {
            return Err(format!(
                "RTX payload of {} bytes is shorter than its {}-byte prefix",
                packet.payload.len(),
                prefix
            ));
        }
        let original_seq = u16::from_be_bytes([packet.payload[0], packet.payload[1]]);
        let subflow = if prefix == 6 {
            Some((
                u16::from_be_bytes([packet.payload[2], packet.payload[3]]),
                u16::from_be_bytes([packet.payload[4], packet.payload[5]]),
            ))
        } else {
            None
        };
        packet.payload.advance(prefix);
        packet.sequence_number = original_seq;
        Ok(RecoveredPacket {
            packet,
            original_sequence_number: original_seq,
            subflow,
        })
    }

    /// Records NACKed sequence numbers. The caller generates the actual
    /// retransmissions via [`Self::make_rtx`].
    pub fn nack(&mut self, seqs: &[u16], now: Instant) {
        for seq in seqs {
            if let Some(stored) = self.store.get_mut(seq) {
                stored.nacked_at = Some(now);
            }
        }
    }

    /// Records ACKed sequence numbers; in ACK-driven mode this evicts them.
    pub fn ack(&mut self, seqs: &[u16], now: Instant) {
        for seq in seqs {
            if let Some(stored) = self.store.get_mut(seq) {
                if stored.acked_at.is_none() {
                    stored.acked_at = Some(now);
                    trace!(
                        "seq={} acked after {:?}",
                        seq,
                        now.saturating_duration_since(stored.stored_at)
                    );
                }
            }
            if matches!(self.policy, RtxPolicy::AckDriven) {
                self.store.remove(seq);
            }
        }
    }

    /// The next NACK-timed eviction deadline, if any.
    pub fn next_eviction(&self) -> Option<Instant> {
        self.deadlines.front().map(|(t, _)| *t)
    }

    /// Drops packets whose retention window has elapsed (NACK-timed mode).
    pub fn evict_expired(&mut self, now: Instant) {
        while let Some(&(deadline, seq)) = self.deadlines.front() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_front();
            if self.store.remove(&seq).is_some() {
                trace!("evicting seq={} from the RTX buffer", seq);
            }
        }
    }

    /// Remembers an incoming packet's extended sequence number, for
    /// feedback generation.
    pub fn note_arrival(&mut self, extended_seq: u32, now: Instant) {
        if self.recent_arrivals.len() == self.recent_capacity {
            self.recent_arrivals.pop_front();
        }
        self.recent_arrivals.push_back((extended_seq, now));
    }

    /// The last `n` received extended sequence numbers, oldest first.
    pub fn recent_arrivals(&self, n: usize) -> Vec<u32> {
        let skip = self.recent_arrivals.len().saturating_sub(n);
        self.recent_arrivals.iter().skip(skip).map(|(s, _)| *s).collect()
    }

    /// Drops all retained packets and pending evictions.
    pub fn stop(&mut self) {
        debug!("dropping {} packets from the RTX buffer", self.store.len());
        self.store.clear();
        self.order.clear();
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::clock::{ManualClock, ReferenceClock};
    use bytes::Bytes;
    use smallvec::SmallVec;
    use std::time::Duration;

    const PRIMARY_PT: u8 = 96;
    const RTX_PT: u8 = 97;
    const RTX_SSRC: u32 = 0xABCD_0001;

    fn packet(seq: u16, payload: &'static [u8]) -> RtpPacket {
        RtpPacket {
            marker: false,
            payload_type: PRIMARY_PT,
            sequence_number: seq,
            timestamp: 123_456,
            ssrc: 0x1111_1111,
            csrcs: SmallVec::new(),
            extension: None,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn nack_timed_rtx_then_window_expiry() {
        let clock = ManualClock::new();
        let mut state = SessionState::with_identity(0x1111_1111, RTX_SSRC, 5000, &clock);
        let mut tm = TransmissionManager::new(
            RtxPolicy::NackTimed {
                window: Duration::from_millis(3000),
            },
            RTX_PT,
            None,
        );
        tm.store(&packet(1000, b"ABC"), clock.now());

        // NACK at t=500 ms yields a well-formed RTX packet.
        clock.advance(Duration::from_millis(500));
        tm.nack(&[1000], clock.now());
        let rtx = tm.make_rtx(&mut state, 1000).expect("still buffered");
        assert_eq!(rtx.payload_type, RTX_PT);
        assert_eq!(rtx.ssrc, RTX_SSRC);
        assert_eq!(rtx.sequence_number, 0); // first RTX sequence number
        assert_eq!(rtx.timestamp, 123_456);
        assert_eq!(&rtx.payload[..], &[0x03, 0xE8, b'A', b'B', b'C']);

        // A second NACK gets a fresh RTX sequence number.
        assert_eq!(tm.make_rtx(&mut state, 1000).unwrap().sequence_number, 1);

        // After the window, the buffer no longer yields an RTX.
        clock.advance(Duration::from_millis(2500));
        tm.evict_expired(clock.now());
        assert!(tm.make_rtx(&mut state, 1000).is_none());
        assert!(tm.is_empty());
    }

    #[test]
    fn rtx_packets_are_not_stored() {
        let clock = ManualClock::new();
        let mut tm = TransmissionManager::new(RtxPolicy::AckDriven, RTX_PT, None);
        let mut rtx_pkt = packet(77, b"zz");
        rtx_pkt.payload_type = RTX_PT;
        tm.store(&rtx_pkt, clock.now());
        assert!(tm.is_empty());
    }

    #[test]
    fn circular_mode_evicts_oldest() {
        let clock = ManualClock::new();
        let mut state = SessionState::with_identity(1, RTX_SSRC, 0, &clock);
        let mut tm = TransmissionManager::new(RtxPolicy::Circular { depth: 30 }, RTX_PT, None);
        for seq in 0u16..31 {
            tm.store(&packet(seq, b"p"), clock.now());
        }
        assert_eq!(tm.len(), 30);
        assert!(tm.make_rtx(&mut state, 0).is_none());
        assert!(tm.make_rtx(&mut state, 1).is_some());
        assert!(tm.make_rtx(&mut state, 30).is_some());
    }

    #[test]
    fn ack_driven_eviction() {
        let clock = ManualClock::new();
        let mut state = SessionState::with_identity(1, RTX_SSRC, 0, &clock);
        let mut tm = TransmissionManager::new(RtxPolicy::AckDriven, RTX_PT, None);
        tm.store(&packet(10, b"a"), clock.now());
        tm.store(&packet(11, b"b"), clock.now());
        clock.advance(Duration::from_secs(60)); // no timer ever fires
        assert!(tm.next_eviction().is_none());
        tm.ack(&[10], clock.now());
        assert!(tm.make_rtx(&mut state, 10).is_none());
        assert!(tm.make_rtx(&mut state, 11).is_some());
    }

    #[test]
    fn process_rtx_restores_original() {
        let clock = ManualClock::new();
        let mut state = SessionState::with_identity(1, RTX_SSRC, 0, &clock);
        let mut tm = TransmissionManager::new(RtxPolicy::Circular { depth: 8 }, RTX_PT, None);
        tm.store(&packet(4242, b"payload"), clock.now());
        let rtx = tm.make_rtx(&mut state, 4242).unwrap();
        let recovered = tm.process_rtx(rtx).unwrap();
        assert_eq!(recovered.original_sequence_number, 4242);
        assert_eq!(recovered.packet.sequence_number, 4242);
        assert_eq!(recovered.subflow, None);
        assert_eq!(&recovered.packet.payload[..], b"payload");
    }

    #[test]
    fn process_rtx_rejects_short_payload() {
        let tm = TransmissionManager::new(RtxPolicy::AckDriven, RTX_PT, None);
        let mut p = packet(1, b"x");
        p.payload_type = RTX_PT;
        assert!(tm.process_rtx(p).is_err());
    }

    #[test]
    fn multipath_prefix_round_trip() {
        let clock = ManualClock::new();
        let mut state = SessionState::with_identity(1, RTX_SSRC, 0, &clock);
        let mut tm = TransmissionManager::new(RtxPolicy::Circular { depth: 8 }, RTX_PT, Some(5));
        let mut p = packet(7, b"mp");
        let mut ext = crate::ext::ExtensionBlock::one_byte();
        ext.push(5, &[0x00, 0x02, 0x01, 0x30]); // flow 2, fssn 0x130
        p.extension = Some(ext);
        tm.store(&p, clock.now());
        let rtx = tm.make_rtx(&mut state, 7).unwrap();
        assert_eq!(&rtx.payload[..6], &[0x00, 0x07, 0x00, 0x02, 0x01, 0x30]);
        let recovered = tm.process_rtx(rtx).unwrap();
        assert_eq!(recovered.subflow, Some((2, 0x130)));
        assert_eq!(&recovered.packet.payload[..], b"mp");
    }

    #[test]
    fn recent_arrival_window() {
        let clock = ManualClock::new();
        let mut tm = TransmissionManager::new(RtxPolicy::AckDriven, RTX_PT, None);
        for seq in 0u32..10 {
            tm.note_arrival(seq, clock.now());
        }
        assert_eq!(tm.recent_arrivals(3), vec![7, 8, 9]);
        assert_eq!(tm.recent_arrivals(100).len(), 10);
    }
}
