// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP header extensions; see [RFC 5285](https://datatracker.ietf.org/doc/html/rfc5285).
//!
//! Both the one-byte (`0xBEDE`) and two-byte (`0x100x`) profiles are
//! supported. Elements with ids the session has no handler for are preserved
//! verbatim but not dispatched; the set of handlers is frozen when the
//! session starts.

use smallvec::SmallVec;

/// "defined by profile" value for the one-byte element format.
pub const ONE_BYTE_PROFILE: u16 = 0xBEDE;

/// Base "defined by profile" value for the two-byte element format. The low
/// four bits are application-defined ("appbits").
pub const TWO_BYTE_PROFILE: u16 = 0x1000;

/// Extension name for the MPRTP subflow header, as negotiated via `a=extmap`.
pub const MPRTP_EXTENSION_NAME: &str = "urn:ietf:params:rtp-hdrext:mprtp";

/// A single decoded extension element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionElement {
    pub id: u8,
    pub data: SmallVec<[u8; 8]>,
}

/// A decoded header extension block: the profile word plus its elements, in
/// wire order.
///
/// Blocks with a profile other than the RFC 5285 ones are carried opaquely
/// (`raw`) so they re-serialize byte-identical.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionBlock {
    profile: u16,
    pub elements: SmallVec<[ExtensionElement; 2]>,
    raw: Option<Vec<u8>>,
}

impl ExtensionBlock {
    pub fn one_byte() -> Self {
        Self {
            profile: ONE_BYTE_PROFILE,
            elements: SmallVec::new(),
            raw: None,
        }
    }

    pub fn two_byte() -> Self {
        Self {
            profile: TWO_BYTE_PROFILE,
            elements: SmallVec::new(),
            raw: None,
        }
    }

    #[inline]
    pub fn profile(&self) -> u16 {
        self.profile
    }

    fn is_two_byte(&self) -> bool {
        (self.profile & 0xFFF0) == TWO_BYTE_PROFILE
    }

    /// Decodes the extension payload (the words following the 4-byte
    /// extension header) for the given profile value.
    ///
    /// Unknown profiles are kept opaque: no elements, raw bytes preserved.
    pub fn parse(profile: u16, data: &[u8]) -> Result<Self, String> {
        let mut raw = None;
        let mut elements = SmallVec::new();
        if profile == ONE_BYTE_PROFILE {
            let mut i = 0;
            while i < data.len() {
                let b = data[i];
                if b == 0 {
                    // padding
                    i += 1;
                    continue;
                }
                let id = b >> 4;
                if id == 15 {
                    // RFC 5285 §4.2: id 15 terminates parsing.
                    break;
                }
                let len = usize::from(b & 0x0F) + 1;
                i += 1;
                if i + len > data.len() {
                    return Err(format!(
                        "one-byte extension element id={} len={} overruns block of {} bytes",
                        id,
                        len,
                        data.len()
                    ));
                }
                elements.push(ExtensionElement {
                    id,
                    data: SmallVec::from_slice(&data[i..i + len]),
                });
                i += len;
            }
        } else if (profile & 0xFFF0) == TWO_BYTE_PROFILE {
            let mut i = 0;
            while i < data.len() {
                let id = data[i];
                if id == 0 {
                    i += 1;
                    continue;
                }
                if i + 1 >= data.len() {
                    return Err("two-byte extension element truncated at length".to_owned());
                }
                let len = usize::from(data[i + 1]);
                i += 2;
                if i + len > data.len() {
                    return Err(format!(
                        "two-byte extension element id={} len={} overruns block of {} bytes",
                        id,
                        len,
                        data.len()
                    ));
                }
                elements.push(ExtensionElement {
                    id,
                    data: SmallVec::from_slice(&data[i..i + len]),
                });
                i += len;
            }
        } else {
            raw = Some(data.to_vec());
        }
        Ok(Self {
            profile,
            elements,
            raw,
        })
    }

    /// Appends an element. One-byte blocks accept ids 1..=14 with 1..=16
    /// data bytes; out-of-range values are a caller bug.
    pub fn push(&mut self, id: u8, data: &[u8]) {
        debug_assert!(self.raw.is_none());
        if self.is_two_byte() {
            debug_assert!(id >= 1 && data.len() <= 255);
        } else {
            debug_assert!((1..=14).contains(&id) && (1..=16).contains(&data.len()));
        }
        self.elements.push(ExtensionElement {
            id,
            data: SmallVec::from_slice(data),
        });
    }

    /// Returns the data of the first element with the given id.
    pub fn get(&self, id: u8) -> Option<&[u8]> {
        self.elements
            .iter()
            .find(|e| e.id == id)
            .map(|e| &e.data[..])
    }

    /// Encodes the element payload, zero-padded to a 32-bit boundary. The
    /// caller writes the 4-byte extension header (profile + length in words).
    pub fn payload_bytes(&self) -> Vec<u8> {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        let two_byte = self.is_two_byte();
        let mut out = Vec::with_capacity(self.elements.len() * 8);
        for e in &self.elements {
            if two_byte {
                out.push(e.id);
                out.push(e.data.len() as u8);
            } else {
                out.push((e.id << 4) | ((e.data.len() as u8) - 1));
            }
            out.extend_from_slice(&e.data);
        }
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }
}
