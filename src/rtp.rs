// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP packet model; see [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pretty_hex::PrettyHex;
use smallvec::SmallVec;

use crate::ext::ExtensionBlock;

/// An RTP packet, decoded enough for session processing. The payload is a
/// refcounted [`Bytes`] slice of the original datagram on the receive path,
/// and owned on the send path; cloning a packet never copies payload bytes.
#[derive(Clone)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: SmallVec<[u32; 4]>,
    pub extension: Option<ExtensionBlock>,
    pub payload: Bytes,
}

impl std::fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpPacket")
            .field("marker", &self.marker)
            .field("payload_type", &self.payload_type)
            .field("sequence_number", &self.sequence_number)
            .field("timestamp", &self.timestamp)
            .field("ssrc", &self.ssrc)
            .field("csrcs", &self.csrcs)
            .field("extension", &self.extension)
            .field("payload", &self.payload.hex_dump())
            .finish()
    }
}

impl RtpPacket {
    /// Parses a datagram. `data` should be exactly one RTP packet.
    ///
    /// Uses `rtp_rs` for header validation; the sequence number is read
    /// straight from the wire. (`rtp_rs::Seq` is more trouble than help.)
    pub fn parse(mut data: Bytes) -> Result<RtpPacket, String> {
        let reader = rtp_rs::RtpReader::new(&data[..])
            .map_err(|e| format!("corrupt RTP header: {:?}\n{:#?}", e, data.hex_dump()))?;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let cc = usize::from(data[0] & 0x0F);
        let mut csrcs = SmallVec::new();
        for i in 0..cc {
            let off = 12 + 4 * i;
            csrcs.push(u32::from_be_bytes([
                data[off],
                data[off + 1],
                data[off + 2],
                data[off + 3],
            ]));
        }
        let extension = match reader.extension() {
            None => None,
            Some((profile, ext_data)) => Some(ExtensionBlock::parse(profile, ext_data)?),
        };
        let marker = reader.mark();
        let payload_type = reader.payload_type();
        let timestamp = reader.timestamp();
        let ssrc = reader.ssrc();
        let payload = match crate::as_range(&data, reader.payload()) {
            Some(range) => {
                data.truncate(range.end);
                data.advance(range.start);
                data
            }
            None => Bytes::new(),
        };
        Ok(RtpPacket {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrcs,
            extension,
            payload,
        })
    }

    /// Serializes into a fresh datagram. Padding is never emitted.
    pub fn serialize(&self) -> Bytes {
        let ext_payload = self.extension.as_ref().map(|e| (e.profile(), e.payload_bytes()));
        let ext_len = ext_payload.as_ref().map(|(_, p)| 4 + p.len()).unwrap_or(0);
        let mut buf =
            BytesMut::with_capacity(12 + 4 * self.csrcs.len() + ext_len + self.payload.len());
        buf.put_u8(0x80 | (if ext_len > 0 { 0x10 } else { 0 }) | (self.csrcs.len() as u8));
        buf.put_u8((if self.marker { 0x80 } else { 0 }) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrcs {
            buf.put_u32(*csrc);
        }
        if let Some((profile, payload)) = ext_payload {
            debug_assert_eq!(payload.len() % 4, 0);
            buf.put_u16(profile);
            buf.put_u16((payload.len() / 4) as u16);
            buf.put_slice(&payload);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext::ONE_BYTE_PROFILE;

    #[test]
    fn parse_minimal() {
        // V=2, no CSRC/ext, marker set, PT 96, seq 0x1234, ts 0x11223344, ssrc 0xDEADBEEF.
        let data = Bytes::from_static(&[
            0x80, 0xE0, 0x12, 0x34, 0x11, 0x22, 0x33, 0x44, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02,
        ]);
        let pkt = RtpPacket::parse(data).unwrap();
        assert!(pkt.marker);
        assert_eq!(pkt.payload_type, 96);
        assert_eq!(pkt.sequence_number, 0x1234);
        assert_eq!(pkt.timestamp, 0x1122_3344);
        assert_eq!(pkt.ssrc, 0xDEAD_BEEF);
        assert!(pkt.csrcs.is_empty());
        assert!(pkt.extension.is_none());
        assert_eq!(&pkt.payload[..], &[0x01, 0x02]);
    }

    #[test]
    fn parse_rejects_bad_version() {
        let data = Bytes::from_static(&[
            0x40, 0x60, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 1, 0xFF,
        ]);
        assert!(RtpPacket::parse(data).is_err());
    }

    #[test]
    fn serialize_parse_round_trip_with_extension() {
        let mut ext = ExtensionBlock::one_byte();
        ext.push(4, &[0x12, 0x34, 0x56, 0x78]);
        let pkt = RtpPacket {
            marker: false,
            payload_type: 97,
            sequence_number: 65535,
            timestamp: 90_000,
            ssrc: 0x0102_0304,
            csrcs: SmallVec::from_slice(&[0xCAFE_F00D]),
            extension: Some(ext),
            payload: Bytes::from_static(b"abcdef"),
        };
        let wire = pkt.serialize();
        let parsed = RtpPacket::parse(wire).unwrap();
        assert_eq!(parsed.sequence_number, 65535);
        assert_eq!(parsed.csrcs[..], [0xCAFE_F00D]);
        let ext = parsed.extension.expect("extension present");
        assert_eq!(ext.profile(), ONE_BYTE_PROFILE);
        assert_eq!(ext.get(4), Some(&[0x12, 0x34, 0x56, 0x78][..]));
        assert_eq!(&parsed.payload[..], b"abcdef");
    }
}
