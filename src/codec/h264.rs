// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.264 packetization and depacketization per
//! [RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184).
//!
//! Supported packet types: Single NAL unit (1..=23), STAP-A (24), STAP-B
//! (25), FU-A (28), and FU-B (29). MTAP16/MTAP24 are not produced and are
//! rejected on receive.

use bytes::{BufMut, Bytes, BytesMut};
use log::trace;

use super::{DepacketizeError, GroupPacket, MediaSample, PacketGroup, PayloadChunk};
use crate::session::parameters::PacketizationMode;

pub(crate) const NAL_STAP_A: u8 = 24;
pub(crate) const NAL_STAP_B: u8 = 25;
pub(crate) const NAL_MTAP16: u8 = 26;
pub(crate) const NAL_MTAP24: u8 = 27;
pub(crate) const NAL_FU_A: u8 = 28;
pub(crate) const NAL_FU_B: u8 = 29;

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// The F and NRI bits of a NAL unit header.
const NAL_F_NRI_MASK: u8 = 0xE0;
const NAL_TYPE_MASK: u8 = 0x1F;

#[derive(Debug)]
pub struct Packetizer {
    mode: PacketizationMode,
    payload_budget: usize,
    aggregate: bool,
    info: Vec<Vec<usize>>,
    next_decoding_order: u16,
}

impl Packetizer {
    pub(super) fn new(
        mode: PacketizationMode,
        payload_budget: usize,
        aggregate: bool,
    ) -> Result<Self, String> {
        // FU-B carries 4 bytes of headers before any fragment data.
        if payload_budget < 8 {
            return Err(format!("payload budget {} is too small", payload_budget));
        }
        Ok(Self {
            mode,
            payload_budget,
            aggregate,
            info: Vec::new(),
            next_decoding_order: 0,
        })
    }

    pub(super) fn last_packetization_info(&self) -> &[Vec<usize>] {
        &self.info
    }

    pub(super) fn packetize(
        &mut self,
        samples: &[MediaSample],
    ) -> Result<Vec<PayloadChunk>, String> {
        for s in samples {
            if s.data.is_empty() {
                return Err("empty NAL unit".to_owned());
            }
        }
        self.info.clear();
        self.info.resize(samples.len(), Vec::new());
        match self.mode {
            PacketizationMode::SingleNal => self.packetize_single_nal(samples),
            PacketizationMode::NonInterleaved => self.packetize_non_interleaved(samples),
            PacketizationMode::Interleaved => self.packetize_interleaved(samples),
        }
    }

    fn packetize_single_nal(
        &mut self,
        samples: &[MediaSample],
    ) -> Result<Vec<PayloadChunk>, String> {
        let mut chunks = Vec::with_capacity(samples.len());
        for (i, sample) in samples.iter().enumerate() {
            if sample.data.len() > self.payload_budget {
                return Err(format!(
                    "{}-byte NAL unit exceeds the {}-byte budget in single NAL unit mode",
                    sample.data.len(),
                    self.payload_budget
                ));
            }
            self.info[i].push(chunks.len());
            chunks.push(PayloadChunk {
                data: sample.data.clone(),
                marker: sample.marker,
            });
        }
        Ok(chunks)
    }

    fn packetize_non_interleaved(
        &mut self,
        samples: &[MediaSample],
    ) -> Result<Vec<PayloadChunk>, String> {
        let mut chunks = Vec::new();
        let mut i = 0;
        while i < samples.len() {
            let sample = &samples[i];
            if sample.data.len() > self.payload_budget {
                self.fragment_fu_a(sample, i, &mut chunks);
                i += 1;
                continue;
            }
            let (count, f_bit, nri) = if self.aggregate {
                self.samples_to_aggregate(self.payload_budget, samples, i)
            } else {
                (1, false, 0)
            };
            if count < 2 {
                self.info[i].push(chunks.len());
                chunks.push(PayloadChunk {
                    data: sample.data.clone(),
                    marker: sample.marker,
                });
                i += 1;
            } else {
                // STAP-A: one header byte, then 16-bit-length-prefixed NALs.
                let mut data = BytesMut::with_capacity(self.payload_budget);
                data.put_u8((if f_bit { 0x80 } else { 0 }) | (nri << 5) | NAL_STAP_A);
                for sample in &samples[i..i + count] {
                    data.put_u16(sample.data.len() as u16);
                    data.put_slice(&sample.data);
                }
                for j in i..i + count {
                    self.info[j].push(chunks.len());
                }
                trace!("aggregated {} NAL units into a {}-byte STAP-A", count, data.len());
                chunks.push(PayloadChunk {
                    data: data.freeze(),
                    marker: samples[i + count - 1].marker,
                });
                i += count;
            }
        }
        Ok(chunks)
    }

    fn packetize_interleaved(
        &mut self,
        samples: &[MediaSample],
    ) -> Result<Vec<PayloadChunk>, String> {
        let mut chunks = Vec::new();
        let mut i = 0;
        while i < samples.len() {
            let sample = &samples[i];
            // STAP-B needs its header byte, 2 bytes of DON, and the 2-byte
            // NAL length before any payload.
            if sample.data.len() + 5 > self.payload_budget {
                self.fragment_fu_b(sample, i, &mut chunks);
                i += 1;
                continue;
            }
            let (count, f_bit, nri) = if self.aggregate {
                self.samples_to_aggregate(self.payload_budget - 2, samples, i)
            } else {
                (1, false, (sample.data[0] & 0x60) >> 5)
            };
            let don = self.decoding_order(&samples[i]);
            let count = count.max(1);
            let mut data = BytesMut::with_capacity(self.payload_budget);
            data.put_u8((if f_bit { 0x80 } else { 0 }) | (nri << 5) | NAL_STAP_B);
            data.put_u16(don);
            for sample in &samples[i..i + count] {
                data.put_u16(sample.data.len() as u16);
                data.put_slice(&sample.data);
            }
            for j in i..i + count {
                self.info[j].push(chunks.len());
            }
            chunks.push(PayloadChunk {
                data: data.freeze(),
                marker: samples[i + count - 1].marker,
            });
            i += count;
        }
        Ok(chunks)
    }

    /// How many samples starting at `start` fit into one STAP, along with
    /// the aggregate F bit and the maximum NRI.
    fn samples_to_aggregate(
        &self,
        budget: usize,
        samples: &[MediaSample],
        start: usize,
    ) -> (usize, bool, u8) {
        let mut available = budget - 1; // STAP header byte
        let mut count = 0;
        let mut f_bit = false;
        let mut nri = 0;
        for sample in &samples[start..] {
            let need = sample.data.len() + 2;
            if need > available {
                break;
            }
            let header = sample.data[0];
            f_bit |= (header & 0x80) != 0;
            nri = nri.max((header & 0x60) >> 5);
            count += 1;
            available -= need;
        }
        (count, f_bit, nri)
    }

    fn decoding_order(&mut self, sample: &MediaSample) -> u16 {
        match sample.decoding_order {
            Some(don) => {
                self.next_decoding_order = don.wrapping_add(1);
                don
            }
            None => {
                let don = self.next_decoding_order;
                self.next_decoding_order = don.wrapping_add(1);
                don
            }
        }
    }

    /// Fragments one oversized NAL unit into FU-A packets. The NAL unit
    /// header is consumed into the FU indicator/header pair.
    fn fragment_fu_a(&mut self, sample: &MediaSample, index: usize, chunks: &mut Vec<PayloadChunk>) {
        let header = sample.data[0];
        let indicator = (header & NAL_F_NRI_MASK) | NAL_FU_A;
        let nal_type = header & NAL_TYPE_MASK;
        let payload = &sample.data[1..];
        let max_fragment = self.payload_budget - 2;
        trace!(
            "fragmenting {}-byte NAL unit (type {}) into FU-A",
            sample.data.len(),
            nal_type
        );
        let mut offset = 0;
        let mut first = true;
        while offset < payload.len() {
            let remaining = payload.len() - offset;
            let take = remaining.min(max_fragment);
            let last = remaining <= max_fragment;
            let fu_header = (if first { FU_START } else { 0 })
                | (if last { FU_END } else { 0 })
                | nal_type;
            let mut data = BytesMut::with_capacity(2 + take);
            data.put_u8(indicator);
            data.put_u8(fu_header);
            data.put_slice(&payload[offset..offset + take]);
            self.info[index].push(chunks.len());
            chunks.push(PayloadChunk {
                data: data.freeze(),
                marker: last && sample.marker,
            });
            offset += take;
            first = false;
        }
    }

    /// Fragments for the interleaved mode: the first fragment is an FU-B
    /// carrying the DON; the remainder are plain FU-As (RFC 6184 §5.8).
    fn fragment_fu_b(&mut self, sample: &MediaSample, index: usize, chunks: &mut Vec<PayloadChunk>) {
        let header = sample.data[0];
        let nal_type = header & NAL_TYPE_MASK;
        let payload = &sample.data[1..];
        let don = self.decoding_order(sample);
        let mut offset = 0;
        let mut first = true;
        while offset < payload.len() {
            let max_fragment = self.payload_budget - if first { 4 } else { 2 };
            let remaining = payload.len() - offset;
            let take = remaining.min(max_fragment);
            let last = remaining <= max_fragment;
            let indicator =
                (header & NAL_F_NRI_MASK) | if first { NAL_FU_B } else { NAL_FU_A };
            let fu_header = (if first { FU_START } else { 0 })
                | (if last { FU_END } else { 0 })
                | nal_type;
            let mut data = BytesMut::with_capacity(4 + take);
            data.put_u8(indicator);
            data.put_u8(fu_header);
            if first {
                data.put_u16(don);
            }
            data.put_slice(&payload[offset..offset + take]);
            self.info[index].push(chunks.len());
            chunks.push(PayloadChunk {
                data: data.freeze(),
                marker: last && sample.marker,
            });
            offset += take;
            first = false;
        }
    }
}

#[derive(Debug)]
pub struct Depacketizer {
    mode: PacketizationMode,
}

impl Depacketizer {
    pub(super) fn new(mode: PacketizationMode) -> Self {
        Self { mode }
    }

    /// Reassembles the samples of one playout group. Any structural error
    /// drops the group: a gap inside a fragmentation unit abandons its
    /// partial payload.
    pub(super) fn depacketize(
        &mut self,
        group: &PacketGroup,
    ) -> Result<Vec<MediaSample>, DepacketizeError> {
        let mut samples = Vec::new();
        let mut i = 0;
        while i < group.packets.len() {
            i = self.extract_next(&group.packets, i, &mut samples)?;
        }
        Ok(samples)
    }

    fn extract_next(
        &mut self,
        packets: &[GroupPacket],
        index: usize,
        samples: &mut Vec<MediaSample>,
    ) -> Result<usize, DepacketizeError> {
        let packet = &packets[index];
        if packet.payload.is_empty() {
            return Err(DepacketizeError::InvalidHeader("empty payload".to_owned()));
        }
        let header = packet.payload[0];
        let nal_type = header & NAL_TYPE_MASK;
        match nal_type {
            1..=23 => {
                samples.push(MediaSample {
                    data: packet.payload.clone(),
                    marker: packet.marker,
                    decoding_order: None,
                });
                Ok(index + 1)
            }
            NAL_STAP_A if self.mode != PacketizationMode::SingleNal => {
                self.split_stap(packet, None, samples)?;
                Ok(index + 1)
            }
            NAL_STAP_B if self.mode == PacketizationMode::Interleaved => {
                if packet.payload.len() < 3 {
                    return Err(DepacketizeError::InvalidHeader(
                        "STAP-B truncated at DON".to_owned(),
                    ));
                }
                let don = u16::from_be_bytes([packet.payload[1], packet.payload[2]]);
                self.split_stap(packet, Some(don), samples)?;
                Ok(index + 1)
            }
            NAL_FU_A if self.mode != PacketizationMode::SingleNal => {
                self.reassemble_fu(packets, index, false, samples)
            }
            NAL_FU_B if self.mode == PacketizationMode::Interleaved => {
                self.reassemble_fu(packets, index, true, samples)
            }
            NAL_MTAP16 | NAL_MTAP24 => Err(DepacketizeError::InvalidHeader(format!(
                "MTAP packetization (type {}) is not supported",
                nal_type
            ))),
            _ => Err(DepacketizeError::InvalidHeader(format!(
                "NAL unit type {} is not allowed in {:?} mode",
                nal_type, self.mode
            ))),
        }
    }

    /// Splits a STAP-A/B into its length-prefixed NAL units. For STAP-B,
    /// inner samples get successive decoding order numbers.
    fn split_stap(
        &self,
        packet: &GroupPacket,
        mut don: Option<u16>,
        samples: &mut Vec<MediaSample>,
    ) -> Result<(), DepacketizeError> {
        let start = if don.is_some() { 3 } else { 1 };
        let mut off = start;
        let payload = &packet.payload;
        let mut inner = Vec::new();
        while off + 2 <= payload.len() {
            let size = usize::from(u16::from_be_bytes([payload[off], payload[off + 1]]));
            off += 2;
            if size == 0 {
                // zero size: padding
                continue;
            }
            if off + size > payload.len() {
                return Err(DepacketizeError::InvalidHeader(format!(
                    "STAP inner NAL of {} bytes overruns the payload",
                    size
                )));
            }
            inner.push(packet.payload.slice(off..off + size));
            off += size;
        }
        if off != payload.len() {
            return Err(DepacketizeError::InvalidHeader(
                "trailing bytes after the last STAP entry".to_owned(),
            ));
        }
        if inner.is_empty() {
            return Err(DepacketizeError::InvalidHeader("empty STAP".to_owned()));
        }
        let last = inner.len() - 1;
        for (i, data) in inner.into_iter().enumerate() {
            let decoding_order = don;
            if let Some(d) = don {
                don = Some(d.wrapping_add(1));
            }
            samples.push(MediaSample {
                data,
                marker: packet.marker && i == last,
                decoding_order,
            });
        }
        Ok(())
    }

    /// Accumulates FU-A/FU-B fragments until the end bit. The NAL unit
    /// header is rebuilt from the FU indicator's F/NRI and the FU header's
    /// type. A sequence gap abandons the partial payload.
    fn reassemble_fu(
        &mut self,
        packets: &[GroupPacket],
        index: usize,
        fu_b: bool,
        samples: &mut Vec<MediaSample>,
    ) -> Result<usize, DepacketizeError> {
        let first = &packets[index];
        let prefix = if fu_b { 4 } else { 2 };
        if first.payload.len() < prefix + 1 {
            return Err(DepacketizeError::InvalidHeader("FU truncated".to_owned()));
        }
        let indicator = first.payload[0];
        let fu_header = first.payload[1];
        if fu_header & FU_START == 0 {
            return Err(DepacketizeError::StartBitMissing {
                seq: first.extended_sequence_number,
            });
        }
        let decoding_order = if fu_b {
            Some(u16::from_be_bytes([first.payload[2], first.payload[3]]))
        } else {
            None
        };
        let mut data = BytesMut::with_capacity(first.payload.len() * 2);
        data.put_u8((indicator & NAL_F_NRI_MASK) | (fu_header & NAL_TYPE_MASK));
        data.put_slice(&first.payload[prefix..]);
        if fu_header & FU_END != 0 {
            samples.push(MediaSample {
                data: data.freeze(),
                marker: first.marker,
                decoding_order,
            });
            return Ok(index + 1);
        }
        let mut prev_seq = first.extended_sequence_number;
        let mut j = index + 1;
        loop {
            let next = match packets.get(j) {
                Some(p) => p,
                None => {
                    // the group ended mid-fragment
                    return Err(DepacketizeError::GapInFragmentation {
                        expected: prev_seq.wrapping_add(1),
                        got: None,
                    });
                }
            };
            if next.extended_sequence_number != prev_seq.wrapping_add(1) {
                return Err(DepacketizeError::GapInFragmentation {
                    expected: prev_seq.wrapping_add(1),
                    got: Some(next.extended_sequence_number),
                });
            }
            if next.payload.len() < 3 {
                return Err(DepacketizeError::InvalidHeader("FU truncated".to_owned()));
            }
            if next.payload[0] & NAL_TYPE_MASK != NAL_FU_A {
                return Err(DepacketizeError::InvalidHeader(format!(
                    "fragmentation unit interrupted by NAL type {}",
                    next.payload[0] & NAL_TYPE_MASK
                )));
            }
            let next_header = next.payload[1];
            if next_header & FU_START != 0 {
                return Err(DepacketizeError::InvalidHeader(
                    "unexpected start bit inside a fragmentation unit".to_owned(),
                ));
            }
            data.put_slice(&next.payload[2..]);
            if next_header & FU_END != 0 {
                samples.push(MediaSample {
                    data: data.freeze(),
                    marker: next.marker,
                    decoding_order,
                });
                return Ok(j + 1);
            }
            prev_seq = next.extended_sequence_number;
            j += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(data: Vec<u8>, marker: bool) -> MediaSample {
        MediaSample {
            data: Bytes::from(data),
            marker,
            decoding_order: None,
        }
    }

    fn group_of(chunks: &[PayloadChunk], start_seq: u32) -> PacketGroup {
        PacketGroup {
            ssrc: 1,
            timestamp: 1000,
            packets: chunks
                .iter()
                .enumerate()
                .map(|(i, c)| GroupPacket {
                    extended_sequence_number: start_seq + i as u32,
                    marker: c.marker,
                    payload: c.data.clone(),
                })
                .collect(),
        }
    }

    fn packetizer(mode: PacketizationMode, budget: usize) -> Packetizer {
        Packetizer::new(mode, budget, true).unwrap()
    }

    #[test]
    fn fu_a_round_trip_4000_byte_nal() {
        // One 4000-byte NAL, type 5, NRI 3, budget 1400: three FU-A packets.
        let mut nal = vec![0x65u8];
        nal.extend((0..3999).map(|i| (i % 251) as u8));
        let mut p = packetizer(PacketizationMode::NonInterleaved, 1400);
        let chunks = p.packetize(&[sample(nal.clone(), true)]).unwrap();
        assert_eq!(chunks.len(), 3);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.data[0] & NAL_TYPE_MASK, NAL_FU_A);
            assert_eq!((c.data[0] & 0x60) >> 5, 3); // NRI preserved
            let s = c.data[1] & FU_START != 0;
            let e = c.data[1] & FU_END != 0;
            assert_eq!(s, i == 0);
            assert_eq!(e, i == 2);
            assert_eq!(c.data[1] & NAL_TYPE_MASK, 5);
            assert_eq!(c.marker, i == 2);
        }
        assert_eq!(p.last_packetization_info(), &[vec![0, 1, 2]]);

        let mut d = Depacketizer::new(PacketizationMode::NonInterleaved);
        let out = d.depacketize(&group_of(&chunks, 7000)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], &nal[..]);
        assert!(out[0].marker);
    }

    #[test]
    fn stap_a_aggregation() {
        // Three small NALs aggregate into one STAP-A.
        let nals = vec![
            sample([0x61; 10].to_vec(), false),
            sample([0x62; 20].to_vec(), false),
            sample([0x65; 30].to_vec(), true),
        ];
        let mut p = packetizer(PacketizationMode::NonInterleaved, 1400);
        let chunks = p.packetize(&nals).unwrap();
        assert_eq!(chunks.len(), 1);
        let data = &chunks[0].data;
        assert_eq!(data[0] & NAL_TYPE_MASK, NAL_STAP_A);
        assert_eq!(data.len(), 1 + (2 + 10) + (2 + 20) + (2 + 30));
        assert_eq!(u16::from_be_bytes([data[1], data[2]]), 10);
        assert!(chunks[0].marker); // marker of the last aggregated sample
        assert_eq!(
            p.last_packetization_info(),
            &[vec![0], vec![0], vec![0]]
        );

        let mut d = Depacketizer::new(PacketizationMode::NonInterleaved);
        let out = d.depacketize(&group_of(&chunks, 1)).unwrap();
        assert_eq!(out.len(), 3);
        for (got, want) in out.iter().zip(&nals) {
            assert_eq!(got.data, want.data);
        }
        assert!(!out[0].marker);
        assert!(out[2].marker);
    }

    #[test]
    fn aggregation_disabled_yields_single_nal_packets() {
        let nals = vec![sample(vec![0x61, 1], false), sample(vec![0x61, 2], true)];
        let mut p = Packetizer::new(PacketizationMode::NonInterleaved, 1400, false).unwrap();
        let chunks = p.packetize(&nals).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data[0] & NAL_TYPE_MASK, 1);
    }

    #[test]
    fn single_nal_mode_rejects_oversized() {
        let mut p = packetizer(PacketizationMode::SingleNal, 100);
        assert!(p.packetize(&[sample(vec![0x61; 101], true)]).is_err());
        let chunks = p.packetize(&[sample(vec![0x61; 100], true)]).unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn mixed_access_unit_round_trip() {
        // SPS + PPS aggregate; the large IDR slice fragments.
        let sps = sample(vec![0x67, 0x42, 0x00, 0x1E], false);
        let pps = sample(vec![0x68, 0xCE, 0x38, 0x80], false);
        let mut idr = vec![0x65u8];
        idr.extend((0..5000).map(|i| (i % 249) as u8));
        let idr = sample(idr, true);
        let mut p = packetizer(PacketizationMode::NonInterleaved, 1400);
        let chunks = p
            .packetize(&[sps.clone(), pps.clone(), idr.clone()])
            .unwrap();
        let mut d = Depacketizer::new(PacketizationMode::NonInterleaved);
        let out = d.depacketize(&group_of(&chunks, 100)).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].data, sps.data);
        assert_eq!(out[1].data, pps.data);
        assert_eq!(out[2].data, idr.data);
    }

    #[test]
    fn fu_gap_abandons_partial() {
        let mut nal = vec![0x65u8];
        nal.extend(vec![0xAB; 4000]);
        let mut p = packetizer(PacketizationMode::NonInterleaved, 1400);
        let chunks = p.packetize(&[sample(nal, true)]).unwrap();
        let mut group = group_of(&chunks, 500);
        group.packets.remove(1); // lose the middle fragment
        let mut d = Depacketizer::new(PacketizationMode::NonInterleaved);
        let err = d.depacketize(&group).unwrap_err();
        assert_eq!(
            err,
            DepacketizeError::GapInFragmentation {
                expected: 501,
                got: Some(502),
            }
        );
    }

    #[test]
    fn fu_truncated_group_is_a_gap() {
        let mut nal = vec![0x65u8];
        nal.extend(vec![0xCD; 4000]);
        let mut p = packetizer(PacketizationMode::NonInterleaved, 1400);
        let chunks = p.packetize(&[sample(nal, true)]).unwrap();
        let mut group = group_of(&chunks, 500);
        group.packets.truncate(2);
        let mut d = Depacketizer::new(PacketizationMode::NonInterleaved);
        let err = d.depacketize(&group).unwrap_err();
        assert_eq!(
            err,
            DepacketizeError::GapInFragmentation {
                expected: 502,
                got: None,
            }
        );
    }

    #[test]
    fn fu_start_bit_missing() {
        let mut nal = vec![0x65u8];
        nal.extend(vec![0xEF; 4000]);
        let mut p = packetizer(PacketizationMode::NonInterleaved, 1400);
        let chunks = p.packetize(&[sample(nal, true)]).unwrap();
        let mut group = group_of(&chunks, 500);
        group.packets.remove(0); // first fragment lost; next lacks the S bit
        let mut d = Depacketizer::new(PacketizationMode::NonInterleaved);
        let err = d.depacketize(&group).unwrap_err();
        assert_eq!(err, DepacketizeError::StartBitMissing { seq: 501 });
    }

    #[test]
    fn interleaved_round_trip_carries_don() {
        let mut big = vec![0x65u8];
        big.extend(vec![0x11; 3000]);
        let samples = vec![
            MediaSample {
                data: Bytes::from(big.clone()),
                marker: false,
                decoding_order: Some(9),
            },
            MediaSample {
                data: Bytes::from(vec![0x61, 0xAA]),
                marker: true,
                decoding_order: Some(10),
            },
        ];
        let mut p = packetizer(PacketizationMode::Interleaved, 1400);
        let chunks = p.packetize(&samples).unwrap();
        assert_eq!(chunks[0].data[0] & NAL_TYPE_MASK, NAL_FU_B);
        let mut d = Depacketizer::new(PacketizationMode::Interleaved);
        let out = d.depacketize(&group_of(&chunks, 40)).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0].data[..], &big[..]);
        assert_eq!(out[0].decoding_order, Some(9));
        assert_eq!(out[1].decoding_order, Some(10));
    }

    #[test]
    fn interleaved_types_rejected_in_non_interleaved_mode() {
        let mut d = Depacketizer::new(PacketizationMode::NonInterleaved);
        let group = PacketGroup {
            ssrc: 1,
            timestamp: 0,
            packets: vec![GroupPacket {
                extended_sequence_number: 1,
                marker: false,
                payload: Bytes::from_static(&[NAL_STAP_B, 0, 1, 0, 1, 0x61]),
            }],
        };
        assert!(matches!(
            d.depacketize(&group),
            Err(DepacketizeError::InvalidHeader(_))
        ));
    }
}
