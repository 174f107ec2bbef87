// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP packet parsing and compound-packet assembly; see
//! [RFC 3550 section 6](https://datatracker.ietf.org/doc/html/rfc3550#section-6),
//! [RFC 4585](https://datatracker.ietf.org/doc/html/rfc4585) (feedback), and
//! [RFC 3611](https://datatracker.ietf.org/doc/html/rfc3611) (extended reports).
//!
//! Parsing is zero-copy: each packet type is a thin validated wrapper over
//! the compound buffer. Assembly goes the other way through
//! [`CompoundWriter`], which writes every packet into one pre-sized buffer
//! in a single pass.

use bytes::{BufMut, Bytes, BytesMut};

use crate::NtpTimestamp;

pub const TYPE_SENDER_REPORT: u8 = 200;
pub const TYPE_RECEIVER_REPORT: u8 = 201;
pub const TYPE_SOURCE_DESCRIPTION: u8 = 202;
pub const TYPE_BYE: u8 = 203;
pub const TYPE_APP: u8 = 204;
pub const TYPE_TRANSPORT_FEEDBACK: u8 = 205;
pub const TYPE_PAYLOAD_FEEDBACK: u8 = 206;
pub const TYPE_EXTENDED_REPORT: u8 = 207;

pub const SDES_CNAME: u8 = 1;
pub const SDES_NAME: u8 = 2;
pub const SDES_EMAIL: u8 = 3;
pub const SDES_PHONE: u8 = 4;
pub const SDES_LOC: u8 = 5;
pub const SDES_TOOL: u8 = 6;
pub const SDES_NOTE: u8 = 7;
pub const SDES_PRIV: u8 = 8;

/// RFC 4585 transport-layer feedback: generic NACK.
pub const FMT_GENERIC_NACK: u8 = 1;

/// Experimental transport-layer ACK with the same PID/BLP FCI shape as the
/// generic NACK. Outside the IANA-assigned range; only meaningful when both
/// ends negotiate the ACK-driven retransmission mode.
pub const FMT_GENERIC_ACK: u8 = 30;

/// Experimental multipath NACK: a flow-id word followed by PID/BLP entries
/// of flow-specific sequence numbers.
#[cfg(feature = "mprtp")]
pub const FMT_EXTENDED_NACK: u8 = 31;

/// RFC 4585 payload-specific feedback: application layer feedback.
pub const FMT_APPLICATION_LAYER_FEEDBACK: u8 = 15;

/// RFC 3611 receiver reference time report block.
pub const XR_BLOCK_RECEIVER_REFERENCE_TIME: u8 = 4;

/// RFC 3611 DLRR report block.
pub const XR_BLOCK_DLRR: u8 = 5;

/// IP+UDP overhead added when accounting RTCP bandwidth, per RFC 3550 §6.2.
pub const IP_UDP_OVERHEAD: usize = 28;

/// One parsed RTCP packet within a compound packet.
#[derive(Debug)]
pub enum Packet<'a> {
    SenderReport(SenderReportRef<'a>),
    ReceiverReport(ReceiverReportRef<'a>),
    SourceDescription(SourceDescriptionRef<'a>),
    Bye(ByeRef<'a>),
    App(AppRef<'a>),
    TransportFeedback(TransportFeedbackRef<'a>),
    PayloadFeedback(PayloadFeedbackRef<'a>),
    ExtendedReport(ExtendedReportRef<'a>),
    Unknown(UnknownRef<'a>),
}

impl<'a> Packet<'a> {
    /// Parses the next RTCP packet from `buf`, returning it and the
    /// remainder of the compound packet.
    pub fn parse(buf: &'a [u8]) -> Result<(Packet<'a>, &'a [u8]), String> {
        if buf.len() < 4 {
            return Err(format!("RTCP packets must be at least 4 bytes; have {}", buf.len()));
        }
        let ver = buf[0] >> 6;
        if ver != 2 {
            return Err(format!("RTCP packets must be version 2; got {}", ver));
        }
        let count = buf[0] & 0x1F;
        let pt = buf[1];
        let len = 4 * (usize::from(u16::from_be_bytes([buf[2], buf[3]])) + 1);
        if buf.len() < len {
            return Err(format!(
                "RTCP packet of pt={} claims {} bytes; have only {}",
                pt,
                len,
                buf.len()
            ));
        }
        let (mut this, rest) = buf.split_at(len);
        if (buf[0] & 0x20) != 0 {
            // padding: the last octet gives the number of padded bytes.
            let pad = usize::from(this[this.len() - 1]);
            if pad == 0 || pad > this.len() - 4 {
                return Err(format!("invalid RTCP padding length {}", pad));
            }
            this = &this[..this.len() - pad];
        }
        let pkt = match pt {
            TYPE_SENDER_REPORT => Packet::SenderReport(SenderReportRef::validate(this, count)?),
            TYPE_RECEIVER_REPORT => {
                Packet::ReceiverReport(ReceiverReportRef::validate(this, count)?)
            }
            TYPE_SOURCE_DESCRIPTION => {
                Packet::SourceDescription(SourceDescriptionRef::validate(this, count)?)
            }
            TYPE_BYE => Packet::Bye(ByeRef::validate(this, count)?),
            TYPE_APP => Packet::App(AppRef::validate(this)?),
            TYPE_TRANSPORT_FEEDBACK => {
                Packet::TransportFeedback(TransportFeedbackRef::validate(this, count)?)
            }
            TYPE_PAYLOAD_FEEDBACK => {
                Packet::PayloadFeedback(PayloadFeedbackRef::validate(this, count)?)
            }
            TYPE_EXTENDED_REPORT => Packet::ExtendedReport(ExtendedReportRef::validate(this)?),
            _ => Packet::Unknown(UnknownRef { buf: this }),
        };
        Ok((pkt, rest))
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            Packet::SenderReport(p) => p.buf[1],
            Packet::ReceiverReport(p) => p.buf[1],
            Packet::SourceDescription(p) => p.buf[1],
            Packet::Bye(p) => p.buf[1],
            Packet::App(p) => p.buf[1],
            Packet::TransportFeedback(p) => p.buf[1],
            Packet::PayloadFeedback(p) => p.buf[1],
            Packet::ExtendedReport(p) => p.buf[1],
            Packet::Unknown(p) => p.buf[1],
        }
    }
}

fn be32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn be16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

/// One 24-byte reception report block within an SR or RR.
#[derive(Copy, Clone)]
pub struct ReportBlockRef<'a> {
    buf: &'a [u8],
}

impl<'a> ReportBlockRef<'a> {
    pub fn ssrc(&self) -> u32 {
        be32(self.buf, 0)
    }
    pub fn fraction_lost(&self) -> u8 {
        self.buf[4]
    }
    pub fn cumulative_lost(&self) -> i32 {
        let raw = ((u32::from(self.buf[5]) << 16) | (u32::from(self.buf[6]) << 8)
            | u32::from(self.buf[7])) as i32;
        // sign-extend the 24-bit quantity
        (raw << 8) >> 8
    }
    pub fn extended_highest_seq(&self) -> u32 {
        be32(self.buf, 8)
    }
    pub fn jitter(&self) -> u32 {
        be32(self.buf, 12)
    }
    pub fn last_sr(&self) -> u32 {
        be32(self.buf, 16)
    }
    pub fn delay_since_last_sr(&self) -> u32 {
        be32(self.buf, 20)
    }
}

impl<'a> std::fmt::Debug for ReportBlockRef<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportBlock")
            .field("ssrc", &self.ssrc())
            .field("fraction_lost", &self.fraction_lost())
            .field("cumulative_lost", &self.cumulative_lost())
            .field("extended_highest_seq", &self.extended_highest_seq())
            .field("jitter", &self.jitter())
            .field("last_sr", &self.last_sr())
            .field("delay_since_last_sr", &self.delay_since_last_sr())
            .finish()
    }
}

#[derive(Debug)]
pub struct SenderReportRef<'a> {
    buf: &'a [u8],
    count: u8,
}

impl<'a> SenderReportRef<'a> {
    fn validate(buf: &'a [u8], count: u8) -> Result<Self, String> {
        let need = 28 + 24 * usize::from(count);
        if buf.len() < need {
            return Err(format!("SR with {} blocks needs {} bytes; have {}", count, need, buf.len()));
        }
        Ok(Self { buf, count })
    }

    pub fn ssrc(&self) -> u32 {
        be32(self.buf, 4)
    }
    pub fn ntp_timestamp(&self) -> NtpTimestamp {
        NtpTimestamp((u64::from(be32(self.buf, 8)) << 32) | u64::from(be32(self.buf, 12)))
    }
    pub fn rtp_timestamp(&self) -> u32 {
        be32(self.buf, 16)
    }
    pub fn sender_packet_count(&self) -> u32 {
        be32(self.buf, 20)
    }
    pub fn sender_octet_count(&self) -> u32 {
        be32(self.buf, 24)
    }
    pub fn report_blocks(&self) -> impl Iterator<Item = ReportBlockRef<'a>> {
        let buf = self.buf;
        (0..usize::from(self.count)).map(move |i| ReportBlockRef {
            buf: &buf[28 + 24 * i..28 + 24 * (i + 1)],
        })
    }
}

#[derive(Debug)]
pub struct ReceiverReportRef<'a> {
    buf: &'a [u8],
    count: u8,
}

impl<'a> ReceiverReportRef<'a> {
    fn validate(buf: &'a [u8], count: u8) -> Result<Self, String> {
        let need = 8 + 24 * usize::from(count);
        if buf.len() < need {
            return Err(format!("RR with {} blocks needs {} bytes; have {}", count, need, buf.len()));
        }
        Ok(Self { buf, count })
    }

    pub fn ssrc(&self) -> u32 {
        be32(self.buf, 4)
    }
    pub fn report_blocks(&self) -> impl Iterator<Item = ReportBlockRef<'a>> {
        let buf = self.buf;
        (0..usize::from(self.count)).map(move |i| ReportBlockRef {
            buf: &buf[8 + 24 * i..8 + 24 * (i + 1)],
        })
    }
}

#[derive(Debug)]
pub struct SourceDescriptionRef<'a> {
    buf: &'a [u8],
    count: u8,
}

/// One SDES chunk: an SSRC plus its items.
#[derive(Copy, Clone, Debug)]
pub struct SdesChunkRef<'a> {
    pub ssrc: u32,
    items: &'a [u8],
}

impl<'a> SdesChunkRef<'a> {
    /// Iterates over `(item_type, value)` pairs.
    pub fn items(&self) -> impl Iterator<Item = (u8, &'a [u8])> {
        let mut buf = self.items;
        std::iter::from_fn(move || {
            if buf.len() < 2 || buf[0] == 0 {
                return None;
            }
            let ty = buf[0];
            let len = usize::from(buf[1]);
            let val = &buf[2..2 + len];
            buf = &buf[2 + len..];
            Some((ty, val))
        })
    }

    pub fn cname(&self) -> Option<&'a [u8]> {
        self.items().find(|(t, _)| *t == SDES_CNAME).map(|(_, v)| v)
    }
}

impl<'a> SourceDescriptionRef<'a> {
    fn validate(buf: &'a [u8], count: u8) -> Result<Self, String> {
        // walk all chunks once so the iterators can't overrun.
        let mut off = 4;
        for _ in 0..count {
            if off + 4 > buf.len() {
                return Err("SDES chunk truncated at SSRC".to_owned());
            }
            off += 4;
            loop {
                if off >= buf.len() {
                    return Err("SDES chunk missing terminator".to_owned());
                }
                if buf[off] == 0 {
                    // terminator; skip padding to the next 32-bit boundary.
                    off += 1;
                    while off % 4 != 0 {
                        off += 1;
                    }
                    break;
                }
                if off + 2 > buf.len() || off + 2 + usize::from(buf[off + 1]) > buf.len() {
                    return Err("SDES item overruns chunk".to_owned());
                }
                off += 2 + usize::from(buf[off + 1]);
            }
        }
        Ok(Self { buf, count })
    }

    pub fn chunks(&self) -> impl Iterator<Item = SdesChunkRef<'a>> {
        let buf = self.buf;
        let count = self.count;
        let mut off = 4;
        let mut i = 0;
        std::iter::from_fn(move || {
            if i >= count {
                return None;
            }
            i += 1;
            let ssrc = be32(buf, off);
            let items_start = off + 4;
            let mut j = items_start;
            while buf[j] != 0 {
                j += 2 + usize::from(buf[j + 1]);
            }
            let chunk = SdesChunkRef {
                ssrc,
                items: &buf[items_start..j],
            };
            j += 1;
            while j % 4 != 0 {
                j += 1;
            }
            off = j;
            Some(chunk)
        })
    }
}

#[derive(Debug)]
pub struct ByeRef<'a> {
    buf: &'a [u8],
    count: u8,
}

impl<'a> ByeRef<'a> {
    fn validate(buf: &'a [u8], count: u8) -> Result<Self, String> {
        let need = 4 + 4 * usize::from(count);
        if buf.len() < need {
            return Err(format!("BYE with {} SSRCs needs {} bytes; have {}", count, need, buf.len()));
        }
        if buf.len() > need {
            let rlen = usize::from(buf[need]);
            if need + 1 + rlen > buf.len() {
                return Err("BYE reason overruns packet".to_owned());
            }
        }
        Ok(Self { buf, count })
    }

    pub fn ssrcs(&self) -> impl Iterator<Item = u32> + 'a {
        let buf = self.buf;
        (0..usize::from(self.count)).map(move |i| be32(buf, 4 + 4 * i))
    }

    pub fn reason(&self) -> Option<&'a [u8]> {
        let off = 4 + 4 * usize::from(self.count);
        if off >= self.buf.len() {
            return None;
        }
        let len = usize::from(self.buf[off]);
        Some(&self.buf[off + 1..off + 1 + len])
    }
}

#[derive(Debug)]
pub struct AppRef<'a> {
    buf: &'a [u8],
}

impl<'a> AppRef<'a> {
    fn validate(buf: &'a [u8]) -> Result<Self, String> {
        if buf.len() < 12 {
            return Err(format!("APP needs at least 12 bytes; have {}", buf.len()));
        }
        Ok(Self { buf })
    }

    pub fn subtype(&self) -> u8 {
        self.buf[0] & 0x1F
    }
    pub fn ssrc(&self) -> u32 {
        be32(self.buf, 4)
    }
    pub fn name(&self) -> [u8; 4] {
        [self.buf[8], self.buf[9], self.buf[10], self.buf[11]]
    }
    pub fn data(&self) -> &'a [u8] {
        &self.buf[12..]
    }
}

#[derive(Debug)]
pub struct TransportFeedbackRef<'a> {
    buf: &'a [u8],
    fmt: u8,
}

impl<'a> TransportFeedbackRef<'a> {
    fn validate(buf: &'a [u8], fmt: u8) -> Result<Self, String> {
        if buf.len() < 12 {
            return Err(format!("RTPFB needs at least 12 bytes; have {}", buf.len()));
        }
        Ok(Self { buf, fmt })
    }

    pub fn fmt(&self) -> u8 {
        self.fmt
    }
    pub fn sender_ssrc(&self) -> u32 {
        be32(self.buf, 4)
    }
    pub fn media_ssrc(&self) -> u32 {
        be32(self.buf, 8)
    }
    pub fn fci(&self) -> &'a [u8] {
        &self.buf[12..]
    }

    /// Expands the PID/BLP FCI entries into individual sequence numbers.
    /// Valid for the generic NACK and the experimental generic ACK.
    pub fn sequence_numbers(&self) -> Vec<u16> {
        expand_pid_blp(self.fci())
    }

    /// For the experimental multipath NACK: the flow id and its
    /// flow-specific sequence numbers.
    #[cfg(feature = "mprtp")]
    pub fn extended_nack(&self) -> Option<(u16, Vec<u16>)> {
        if self.fmt != FMT_EXTENDED_NACK || self.fci().len() < 4 {
            return None;
        }
        let flow_id = be16(self.fci(), 0);
        Some((flow_id, expand_pid_blp(&self.fci()[4..])))
    }
}

fn expand_pid_blp(fci: &[u8]) -> Vec<u16> {
    let mut seqs = Vec::with_capacity(fci.len() / 4);
    for entry in fci.chunks_exact(4) {
        let pid = u16::from_be_bytes([entry[0], entry[1]]);
        let blp = u16::from_be_bytes([entry[2], entry[3]]);
        seqs.push(pid);
        for bit in 0..16 {
            if (blp >> bit) & 1 != 0 {
                seqs.push(pid.wrapping_add(bit + 1));
            }
        }
    }
    seqs
}

#[derive(Debug)]
pub struct PayloadFeedbackRef<'a> {
    buf: &'a [u8],
    fmt: u8,
}

impl<'a> PayloadFeedbackRef<'a> {
    fn validate(buf: &'a [u8], fmt: u8) -> Result<Self, String> {
        if buf.len() < 12 {
            return Err(format!("PSFB needs at least 12 bytes; have {}", buf.len()));
        }
        Ok(Self { buf, fmt })
    }

    pub fn fmt(&self) -> u8 {
        self.fmt
    }
    pub fn sender_ssrc(&self) -> u32 {
        be32(self.buf, 4)
    }
    pub fn media_ssrc(&self) -> u32 {
        be32(self.buf, 8)
    }
    pub fn fci(&self) -> &'a [u8] {
        &self.buf[12..]
    }
}

#[derive(Debug)]
pub struct ExtendedReportRef<'a> {
    buf: &'a [u8],
}

/// One XR report block.
#[derive(Copy, Clone, Debug)]
pub struct XrBlockRef<'a> {
    pub block_type: u8,
    pub type_specific: u8,
    pub body: &'a [u8],
}

impl<'a> XrBlockRef<'a> {
    /// For a receiver reference time block: the full NTP timestamp.
    pub fn rrt_ntp(&self) -> Option<NtpTimestamp> {
        if self.block_type != XR_BLOCK_RECEIVER_REFERENCE_TIME || self.body.len() < 8 {
            return None;
        }
        Some(NtpTimestamp(
            (u64::from(be32(self.body, 0)) << 32) | u64::from(be32(self.body, 4)),
        ))
    }

    /// For a DLRR block: iterate `(ssrc, last_rr, dlrr)` sub-blocks.
    pub fn dlrr_sub_blocks(&self) -> impl Iterator<Item = (u32, u32, u32)> + 'a {
        let body = if self.block_type == XR_BLOCK_DLRR {
            self.body
        } else {
            &[]
        };
        body.chunks_exact(12)
            .map(|c| (be32(c, 0), be32(c, 4), be32(c, 8)))
    }
}

impl<'a> ExtendedReportRef<'a> {
    fn validate(buf: &'a [u8]) -> Result<Self, String> {
        if buf.len() < 8 {
            return Err(format!("XR needs at least 8 bytes; have {}", buf.len()));
        }
        let mut off = 8;
        while off < buf.len() {
            if off + 4 > buf.len() {
                return Err("XR block header truncated".to_owned());
            }
            let words = usize::from(be16(buf, off + 2));
            off += 4 + 4 * words;
        }
        if off != buf.len() {
            return Err("XR blocks overrun packet".to_owned());
        }
        Ok(Self { buf })
    }

    pub fn ssrc(&self) -> u32 {
        be32(self.buf, 4)
    }

    pub fn blocks(&self) -> impl Iterator<Item = XrBlockRef<'a>> {
        let buf = self.buf;
        let mut off = 8;
        std::iter::from_fn(move || {
            if off >= buf.len() {
                return None;
            }
            let block_type = buf[off];
            let type_specific = buf[off + 1];
            let words = usize::from(be16(buf, off + 2));
            let body = &buf[off + 4..off + 4 + 4 * words];
            off += 4 + 4 * words;
            Some(XrBlockRef {
                block_type,
                type_specific,
                body,
            })
        })
    }
}

#[derive(Debug)]
pub struct UnknownRef<'a> {
    buf: &'a [u8],
}

impl<'a> UnknownRef<'a> {
    pub fn payload_type(&self) -> u8 {
        self.buf[1]
    }
    pub fn data(&self) -> &'a [u8] {
        self.buf
    }
}

/// An owned reception report block, used when assembling SRs and RRs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: i32,
    pub extended_highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

/// A DLRR sub-block for XR assembly.
#[derive(Copy, Clone, Debug)]
pub struct DlrrBlock {
    pub ssrc: u32,
    pub last_rr: u32,
    pub delay_since_last_rr: u32,
}

/// Writes a compound RTCP packet into a single growable buffer.
pub struct CompoundWriter {
    buf: BytesMut,
}

impl CompoundWriter {
    pub fn new() -> Self {
        Self::with_capacity(128)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    fn put_header(&mut self, count: u8, pt: u8) -> usize {
        let start = self.buf.len();
        self.buf.put_u8(0x80 | (count & 0x1F));
        self.buf.put_u8(pt);
        self.buf.put_u16(0); // patched in finish_packet
        start
    }

    fn finish_packet(&mut self, start: usize) {
        debug_assert_eq!((self.buf.len() - start) % 4, 0);
        let words = ((self.buf.len() - start) / 4 - 1) as u16;
        self.buf[start + 2..start + 4].copy_from_slice(&words.to_be_bytes());
    }

    fn put_report_block(&mut self, b: &ReportBlock) {
        self.buf.put_u32(b.ssrc);
        self.buf.put_u8(b.fraction_lost);
        let lost = b.cumulative_lost.max(-0x80_0000).min(0x7F_FFFF) as u32;
        self.buf.put_u8((lost >> 16) as u8);
        self.buf.put_u8((lost >> 8) as u8);
        self.buf.put_u8(lost as u8);
        self.buf.put_u32(b.extended_highest_seq);
        self.buf.put_u32(b.jitter);
        self.buf.put_u32(b.last_sr);
        self.buf.put_u32(b.delay_since_last_sr);
    }

    /// Appends a sender report. At most 31 blocks; the caller splits
    /// overflow into additional RRs.
    pub fn put_sender_report(
        &mut self,
        ssrc: u32,
        ntp: NtpTimestamp,
        rtp_timestamp: u32,
        packet_count: u32,
        octet_count: u32,
        blocks: &[ReportBlock],
    ) {
        debug_assert!(blocks.len() <= 31);
        let start = self.put_header(blocks.len() as u8, TYPE_SENDER_REPORT);
        self.buf.put_u32(ssrc);
        self.buf.put_u32(ntp.msw());
        self.buf.put_u32(ntp.lsw());
        self.buf.put_u32(rtp_timestamp);
        self.buf.put_u32(packet_count);
        self.buf.put_u32(octet_count);
        for b in blocks {
            self.put_report_block(b);
        }
        self.finish_packet(start);
    }

    pub fn put_receiver_report(&mut self, ssrc: u32, blocks: &[ReportBlock]) {
        debug_assert!(blocks.len() <= 31);
        let start = self.put_header(blocks.len() as u8, TYPE_RECEIVER_REPORT);
        self.buf.put_u32(ssrc);
        for b in blocks {
            self.put_report_block(b);
        }
        self.finish_packet(start);
    }

    /// Appends an SDES packet with a single chunk.
    pub fn put_sdes(&mut self, ssrc: u32, items: &[(u8, &str)]) {
        let start = self.put_header(1, TYPE_SOURCE_DESCRIPTION);
        self.buf.put_u32(ssrc);
        for (ty, value) in items {
            debug_assert!(value.len() <= 255);
            self.buf.put_u8(*ty);
            self.buf.put_u8(value.len() as u8);
            self.buf.put_slice(value.as_bytes());
        }
        self.buf.put_u8(0); // terminator
        while (self.buf.len() - start) % 4 != 0 {
            self.buf.put_u8(0);
        }
        self.finish_packet(start);
    }

    pub fn put_bye(&mut self, ssrcs: &[u32], reason: Option<&str>) {
        debug_assert!(!ssrcs.is_empty() && ssrcs.len() <= 31);
        let start = self.put_header(ssrcs.len() as u8, TYPE_BYE);
        for ssrc in ssrcs {
            self.buf.put_u32(*ssrc);
        }
        if let Some(reason) = reason {
            debug_assert!(reason.len() <= 255);
            self.buf.put_u8(reason.len() as u8);
            self.buf.put_slice(reason.as_bytes());
            while (self.buf.len() - start) % 4 != 0 {
                self.buf.put_u8(0);
            }
        }
        self.finish_packet(start);
    }

    pub fn put_app(&mut self, subtype: u8, ssrc: u32, name: [u8; 4], data: &[u8]) {
        debug_assert_eq!(data.len() % 4, 0);
        let start = self.put_header(subtype, TYPE_APP);
        self.buf.put_u32(ssrc);
        self.buf.put_slice(&name);
        self.buf.put_slice(data);
        self.finish_packet(start);
    }

    /// Appends an XR with a single receiver reference time block.
    pub fn put_xr_receiver_reference_time(&mut self, ssrc: u32, ntp: NtpTimestamp) {
        let start = self.put_header(0, TYPE_EXTENDED_REPORT);
        self.buf.put_u32(ssrc);
        self.buf.put_u8(XR_BLOCK_RECEIVER_REFERENCE_TIME);
        self.buf.put_u8(0);
        self.buf.put_u16(2);
        self.buf.put_u32(ntp.msw());
        self.buf.put_u32(ntp.lsw());
        self.finish_packet(start);
    }

    /// Appends an XR with a single DLRR block.
    pub fn put_xr_dlrr(&mut self, ssrc: u32, sub_blocks: &[DlrrBlock]) {
        let start = self.put_header(0, TYPE_EXTENDED_REPORT);
        self.buf.put_u32(ssrc);
        self.buf.put_u8(XR_BLOCK_DLRR);
        self.buf.put_u8(0);
        self.buf.put_u16((3 * sub_blocks.len()) as u16);
        for b in sub_blocks {
            self.buf.put_u32(b.ssrc);
            self.buf.put_u32(b.last_rr);
            self.buf.put_u32(b.delay_since_last_rr);
        }
        self.finish_packet(start);
    }

    fn put_pid_blp_feedback(&mut self, fmt: u8, sender_ssrc: u32, media_ssrc: u32, seqs: &[u16]) {
        debug_assert!(!seqs.is_empty());
        let start = self.put_header(fmt, TYPE_TRANSPORT_FEEDBACK);
        self.buf.put_u32(sender_ssrc);
        self.buf.put_u32(media_ssrc);
        let mut i = 0;
        while i < seqs.len() {
            let pid = seqs[i];
            let mut blp: u16 = 0;
            let mut j = i + 1;
            while j < seqs.len() {
                let delta = seqs[j].wrapping_sub(pid);
                if delta == 0 {
                    j += 1; // duplicate
                    continue;
                }
                if delta > 16 {
                    break;
                }
                blp |= 1 << (delta - 1);
                j += 1;
            }
            self.buf.put_u16(pid);
            self.buf.put_u16(blp);
            i = j;
        }
        self.finish_packet(start);
    }

    /// Appends a generic NACK (RFC 4585 §6.2.1). `seqs` must be in
    /// ascending (wrapping) order.
    pub fn put_nack(&mut self, sender_ssrc: u32, media_ssrc: u32, seqs: &[u16]) {
        self.put_pid_blp_feedback(FMT_GENERIC_NACK, sender_ssrc, media_ssrc, seqs);
    }

    /// Appends an experimental generic ACK with the NACK's FCI shape.
    pub fn put_ack(&mut self, sender_ssrc: u32, media_ssrc: u32, seqs: &[u16]) {
        self.put_pid_blp_feedback(FMT_GENERIC_ACK, sender_ssrc, media_ssrc, seqs);
    }

    /// Appends an experimental multipath NACK carrying `(flow id, FSSN)`
    /// pairs for one subflow.
    #[cfg(feature = "mprtp")]
    pub fn put_extended_nack(
        &mut self,
        sender_ssrc: u32,
        media_ssrc: u32,
        flow_id: u16,
        fssns: &[u16],
    ) {
        debug_assert!(!fssns.is_empty());
        let start = self.put_header(FMT_EXTENDED_NACK, TYPE_TRANSPORT_FEEDBACK);
        self.buf.put_u32(sender_ssrc);
        self.buf.put_u32(media_ssrc);
        self.buf.put_u16(flow_id);
        self.buf.put_u16(0);
        let mut i = 0;
        while i < fssns.len() {
            let pid = fssns[i];
            let mut blp: u16 = 0;
            let mut j = i + 1;
            while j < fssns.len() {
                let delta = fssns[j].wrapping_sub(pid);
                if delta == 0 {
                    j += 1;
                    continue;
                }
                if delta > 16 {
                    break;
                }
                blp |= 1 << (delta - 1);
                j += 1;
            }
            self.buf.put_u16(pid);
            self.buf.put_u16(blp);
            i = j;
        }
        self.finish_packet(start);
    }

    /// Appends application layer feedback (RFC 4585 §6.4).
    pub fn put_application_layer_feedback(
        &mut self,
        sender_ssrc: u32,
        media_ssrc: u32,
        data: &[u8],
    ) {
        let start = self.put_header(FMT_APPLICATION_LAYER_FEEDBACK, TYPE_PAYLOAD_FEEDBACK);
        self.buf.put_u32(sender_ssrc);
        self.buf.put_u32(media_ssrc);
        self.buf.put_slice(data);
        while (self.buf.len() - start) % 4 != 0 {
            self.buf.put_u8(0);
        }
        self.finish_packet(start);
    }
}

impl Default for CompoundWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(mut data: &[u8]) -> Vec<u8> {
        let mut types = Vec::new();
        while !data.is_empty() {
            let (pkt, rest) = Packet::parse(data).unwrap();
            types.push(pkt.payload_type());
            data = rest;
        }
        types
    }

    #[test]
    fn sr_sdes_compound() {
        let mut w = CompoundWriter::new();
        let blocks = [ReportBlock {
            ssrc: 0x1111_2222,
            fraction_lost: 12,
            cumulative_lost: -5,
            extended_highest_seq: 0x0001_0005,
            jitter: 42,
            last_sr: 0xAABB_CCDD,
            delay_since_last_sr: 65536,
        }];
        w.put_sender_report(
            0xDEAD_BEEF,
            NtpTimestamp(0x0102_0304_0506_0708),
            90_000,
            1000,
            1_000_000,
            &blocks,
        );
        w.put_sdes(0xDEAD_BEEF, &[(SDES_CNAME, "user@host")]);
        let data = w.finish();

        let (pkt, rest) = Packet::parse(&data).unwrap();
        let sr = match pkt {
            Packet::SenderReport(sr) => sr,
            o => panic!("expected SR, got {:?}", o),
        };
        assert_eq!(sr.ssrc(), 0xDEAD_BEEF);
        assert_eq!(sr.ntp_timestamp(), NtpTimestamp(0x0102_0304_0506_0708));
        assert_eq!(sr.rtp_timestamp(), 90_000);
        assert_eq!(sr.sender_packet_count(), 1000);
        assert_eq!(sr.sender_octet_count(), 1_000_000);
        let blocks: Vec<_> = sr.report_blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].ssrc(), 0x1111_2222);
        assert_eq!(blocks[0].fraction_lost(), 12);
        assert_eq!(blocks[0].cumulative_lost(), -5);
        assert_eq!(blocks[0].extended_highest_seq(), 0x0001_0005);

        let (pkt, rest2) = Packet::parse(rest).unwrap();
        let sdes = match pkt {
            Packet::SourceDescription(s) => s,
            o => panic!("expected SDES, got {:?}", o),
        };
        let chunks: Vec<_> = sdes.chunks().collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ssrc, 0xDEAD_BEEF);
        assert_eq!(chunks[0].cname(), Some(&b"user@host"[..]));
        assert!(rest2.is_empty());
    }

    #[test]
    fn empty_rr_bye() {
        let mut w = CompoundWriter::new();
        w.put_receiver_report(0x42, &[]);
        w.put_bye(&[0x42, 0x43], Some("teardown"));
        let data = w.finish();
        assert_eq!(parse_all(&data), vec![TYPE_RECEIVER_REPORT, TYPE_BYE]);

        let (_, rest) = Packet::parse(&data).unwrap();
        let (pkt, _) = Packet::parse(rest).unwrap();
        let bye = match pkt {
            Packet::Bye(b) => b,
            o => panic!("expected BYE, got {:?}", o),
        };
        assert_eq!(bye.ssrcs().collect::<Vec<_>>(), vec![0x42, 0x43]);
        assert_eq!(bye.reason(), Some(&b"teardown"[..]));
    }

    #[test]
    fn nack_expansion_with_gap_over_16() {
        let mut w = CompoundWriter::new();
        // 1000 and 1005 share a PID/BLP entry; 1020 needs a second one.
        w.put_nack(1, 2, &[1000, 1005, 1020]);
        let data = w.finish();
        let (pkt, _) = Packet::parse(&data).unwrap();
        let fb = match pkt {
            Packet::TransportFeedback(fb) => fb,
            o => panic!("expected RTPFB, got {:?}", o),
        };
        assert_eq!(fb.fmt(), FMT_GENERIC_NACK);
        assert_eq!(fb.sender_ssrc(), 1);
        assert_eq!(fb.media_ssrc(), 2);
        assert_eq!(fb.fci().len(), 8);
        assert_eq!(fb.sequence_numbers(), vec![1000, 1005, 1020]);
    }

    #[test]
    fn nack_wraps_sequence_space() {
        let mut w = CompoundWriter::new();
        w.put_nack(1, 2, &[65534, 1]);
        let data = w.finish();
        let (pkt, _) = Packet::parse(&data).unwrap();
        let fb = match pkt {
            Packet::TransportFeedback(fb) => fb,
            _ => unreachable!(),
        };
        assert_eq!(fb.sequence_numbers(), vec![65534, 1]);
    }

    #[test]
    fn xr_round_trip() {
        let mut w = CompoundWriter::new();
        w.put_xr_receiver_reference_time(7, NtpTimestamp(0x1122_3344_5566_7788));
        w.put_xr_dlrr(
            8,
            &[DlrrBlock {
                ssrc: 9,
                last_rr: 0xAAAA,
                delay_since_last_rr: 0xBBBB,
            }],
        );
        let data = w.finish();
        let (pkt, rest) = Packet::parse(&data).unwrap();
        let xr = match pkt {
            Packet::ExtendedReport(xr) => xr,
            o => panic!("expected XR, got {:?}", o),
        };
        assert_eq!(xr.ssrc(), 7);
        let blocks: Vec<_> = xr.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].rrt_ntp(), Some(NtpTimestamp(0x1122_3344_5566_7788)));

        let (pkt, _) = Packet::parse(rest).unwrap();
        let xr = match pkt {
            Packet::ExtendedReport(xr) => xr,
            _ => unreachable!(),
        };
        let blocks: Vec<_> = xr.blocks().collect();
        let subs: Vec<_> = blocks[0].dlrr_sub_blocks().collect();
        assert_eq!(subs, vec![(9, 0xAAAA, 0xBBBB)]);
    }

    #[test]
    fn truncated_rejected() {
        assert!(Packet::parse(&[0x80, 200, 0x00, 0x10, 0, 0]).is_err());
        assert!(Packet::parse(&[0x00, 200, 0x00, 0x00]).is_err()); // version 0
    }
}
