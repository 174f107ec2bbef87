// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Payload-format logic: media samples ↔ RTP payloads.
//!
//! Currently H.264 ([RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184))
//! is the one built-in format. The dispatch enums are deliberately closed:
//! the set of formats is frozen when the session is constructed, so there is
//! no boxed indirection in the per-packet path.

use bytes::Bytes;
use thiserror::Error;

use crate::session::parameters::PacketizationMode;

pub mod h264;

/// One media sample (for H.264, a NAL unit). Samples sharing a presentation
/// time form an access unit.
#[derive(Clone, Debug)]
pub struct MediaSample {
    pub data: Bytes,
    /// Set on the access unit's final sample; propagated to the RTP marker
    /// bit of the last packet carrying it.
    pub marker: bool,
    /// Decoding order number, used by the interleaved packetization mode.
    pub decoding_order: Option<u16>,
}

/// One RTP payload produced by packetization, before header stamping.
#[derive(Clone, Debug)]
pub struct PayloadChunk {
    pub data: Bytes,
    pub marker: bool,
}

/// A received packet as a depacketizer sees it: ordering and payload only.
#[derive(Clone, Debug)]
pub struct GroupPacket {
    pub extended_sequence_number: u32,
    pub marker: bool,
    pub payload: Bytes,
}

/// All packets of one playout group: same SSRC, same RTP timestamp, sorted
/// by extended sequence number.
#[derive(Clone, Debug)]
pub struct PacketGroup {
    pub ssrc: u32,
    pub timestamp: u32,
    pub packets: Vec<GroupPacket>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DepacketizeError {
    #[error("invalid payload header: {0}")]
    InvalidHeader(String),

    #[error("sequence gap within fragmentation unit: expected {expected}")]
    GapInFragmentation { expected: u32, got: Option<u32> },

    #[error("first fragmentation unit lacks the start bit (seq {seq})")]
    StartBitMissing { seq: u32 },
}

/// Turns media samples into RTP payloads.
#[derive(Debug)]
pub enum Packetizer {
    H264(h264::Packetizer),
}

impl Packetizer {
    /// Creates a packetizer for the given media type and encoding name, as
    /// negotiated in the payload table.
    pub fn new(
        media: &str,
        encoding_name: &str,
        mode: PacketizationMode,
        payload_budget: usize,
        aggregate: bool,
    ) -> Result<Self, String> {
        match (media, encoding_name) {
            ("video", "h264") => Ok(Packetizer::H264(h264::Packetizer::new(
                mode,
                payload_budget,
                aggregate,
            )?)),
            (_, _) => Err(format!(
                "no packetizer for media/encoding_name {}/{}",
                media, encoding_name
            )),
        }
    }

    /// Packetizes one access unit. All returned chunks must be stamped with
    /// the same RTP timestamp.
    pub fn packetize(&mut self, samples: &[MediaSample]) -> Result<Vec<PayloadChunk>, String> {
        match self {
            Packetizer::H264(p) => p.packetize(samples),
        }
    }

    /// For each sample of the last packetized access unit, the indices of
    /// the chunks it contributed to.
    pub fn last_packetization_info(&self) -> &[Vec<usize>] {
        match self {
            Packetizer::H264(p) => p.last_packetization_info(),
        }
    }
}

/// Turns playout groups back into media samples.
#[derive(Debug)]
pub enum Depacketizer {
    H264(h264::Depacketizer),
}

impl Depacketizer {
    pub fn new(
        media: &str,
        encoding_name: &str,
        mode: PacketizationMode,
    ) -> Result<Self, String> {
        match (media, encoding_name) {
            ("video", "h264") => Ok(Depacketizer::H264(h264::Depacketizer::new(mode))),
            (_, _) => Err(format!(
                "no depacketizer for media/encoding_name {}/{}",
                media, encoding_name
            )),
        }
    }

    pub fn depacketize(&mut self, group: &PacketGroup) -> Result<Vec<MediaSample>, DepacketizeError> {
        match self {
            Depacketizer::H264(d) => d.depacketize(group),
        }
    }
}
