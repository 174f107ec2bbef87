// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Immutable negotiated session description.
//!
//! A signalling layer (RTSP/SIP/SDP offer-answer) produces one of these per
//! media line; the session never mutates it, so it can be freely shared by
//! reference.

use std::net::SocketAddr;
use std::time::Duration;

use smallvec::SmallVec;

use crate::error::ErrorInt;
use crate::Error;

/// RTP profile from the SDP `m=` line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Profile {
    /// RTP/AVP (RFC 3551).
    Avp,
    /// RTP/AVPF (RFC 4585): feedback messages allowed.
    Avpf,
}

/// An entry in the session's payload table.
#[derive(Clone, Debug)]
pub struct PayloadType {
    pub id: u8,
    pub encoding_name: String,
    pub clock_rate: u32,
}

/// A local or remote (RTP, RTCP) address pair. With rtcp-mux the two are
/// equal. More than one pair is only meaningful with MPRTP.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EndpointPair {
    pub rtp: SocketAddr,
    pub rtcp: SocketAddr,
}

/// Retention policy for the send-side retransmission buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RtxPolicy {
    /// Bounded ring; eviction on insert.
    Circular { depth: usize },
    /// Each stored packet evicted after the negotiated window.
    NackTimed { window: Duration },
    /// Stored until named by an ACK feedback message.
    AckDriven,
}

/// RFC 4588 retransmission parameters.
#[derive(Copy, Clone, Debug)]
pub struct RtxParameters {
    /// The retransmission payload type.
    pub payload_type: u8,
    /// The primary payload type it protects (`apt` in SDP).
    pub associated_payload_type: u8,
    pub policy: RtxPolicy,
}

/// RFC 3611 extended report subreports to generate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum XrMode {
    None,
    /// Receiver reference time blocks (receiver side).
    ReceiverRtt,
    /// DLRR blocks responding to stored RRT samples (sender side).
    Dlrr,
}

/// RFC 6184 packetization mode for the H.264 payload format.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketizationMode {
    SingleNal,
    NonInterleaved,
    Interleaved,
}

/// SDES information for the local participant. CNAME is mandatory; the rest
/// are sent when present.
#[derive(Clone, Debug)]
pub struct SdesInfo {
    pub cname: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub loc: Option<String>,
    pub tool: Option<String>,
    pub note: Option<String>,
}

impl SdesInfo {
    pub fn new(cname: impl Into<String>) -> Self {
        Self {
            cname: cname.into(),
            name: None,
            email: None,
            phone: None,
            loc: None,
            tool: None,
            note: None,
        }
    }

    /// Items in SDES wire order, CNAME first.
    pub(crate) fn items(&self) -> SmallVec<[(u8, &str); 4]> {
        use crate::rtcp;
        let mut items = SmallVec::new();
        items.push((rtcp::SDES_CNAME, self.cname.as_str()));
        for (ty, v) in &[
            (rtcp::SDES_NAME, &self.name),
            (rtcp::SDES_EMAIL, &self.email),
            (rtcp::SDES_PHONE, &self.phone),
            (rtcp::SDES_LOC, &self.loc),
            (rtcp::SDES_TOOL, &self.tool),
            (rtcp::SDES_NOTE, &self.note),
        ] {
            if let Some(v) = v {
                items.push((*ty, v.as_str()));
            }
        }
        items
    }
}

/// Everything the session runtime needs to know about a negotiated RTP
/// session. Immutable post-construction; build with [`SessionParameters::builder`].
#[derive(Clone, Debug)]
pub struct SessionParameters {
    pub(crate) profile: Profile,
    pub(crate) media_type: String,
    pub(crate) mid: Option<String>,
    pub(crate) bandwidth_kbps: u32,
    pub(crate) payloads: Vec<PayloadType>,
    pub(crate) current_payload: usize,
    pub(crate) rtx: Option<RtxParameters>,
    pub(crate) local_endpoints: SmallVec<[EndpointPair; 1]>,
    pub(crate) remote_endpoints: SmallVec<[EndpointPair; 1]>,
    pub(crate) rtcp_mux: bool,
    pub(crate) reduced_minimum_rtcp: bool,
    pub(crate) mprtp_enabled: bool,
    pub(crate) extension_ids: Vec<(u8, String)>,
    pub(crate) xr: XrMode,
    pub(crate) packetization_mode: PacketizationMode,
    pub(crate) aggregate_stap: bool,
    pub(crate) mtu: usize,
    pub(crate) sdes: SdesInfo,
}

impl SessionParameters {
    pub fn builder() -> SessionParametersBuilder {
        SessionParametersBuilder::default()
    }

    #[inline]
    pub fn profile(&self) -> Profile {
        self.profile
    }

    #[inline]
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    #[inline]
    pub fn mid(&self) -> Option<&str> {
        self.mid.as_deref()
    }

    #[inline]
    pub fn bandwidth_kbps(&self) -> u32 {
        self.bandwidth_kbps
    }

    /// The currently active payload type.
    pub fn current_payload(&self) -> &PayloadType {
        &self.payloads[self.current_payload]
    }

    pub fn payloads(&self) -> &[PayloadType] {
        &self.payloads
    }

    pub fn clock_rate(&self, pt: u8) -> Option<u32> {
        self.payloads
            .iter()
            .find(|p| p.id == pt)
            .map(|p| p.clock_rate)
    }

    pub fn rtx(&self) -> Option<&RtxParameters> {
        self.rtx.as_ref()
    }

    pub fn is_rtx_payload_type(&self, pt: u8) -> bool {
        matches!(&self.rtx, Some(r) if r.payload_type == pt)
    }

    pub fn local_endpoints(&self) -> &[EndpointPair] {
        &self.local_endpoints
    }

    pub fn remote_endpoints(&self) -> &[EndpointPair] {
        &self.remote_endpoints
    }

    #[inline]
    pub fn rtcp_mux(&self) -> bool {
        self.rtcp_mux
    }

    #[inline]
    pub fn mprtp_enabled(&self) -> bool {
        self.mprtp_enabled
    }

    #[inline]
    pub fn xr(&self) -> XrMode {
        self.xr
    }

    pub fn sdes(&self) -> &SdesInfo {
        &self.sdes
    }

    /// The extension id mapped to `name`, per the local extmap.
    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.extension_ids
            .iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| *id)
    }

    /// Conservative per-packet payload budget: MTU less IP+UDP+RTP headers.
    pub fn payload_budget(&self) -> usize {
        self.mtu.saturating_sub(40)
    }
}

#[derive(Clone, Debug)]
pub struct SessionParametersBuilder {
    profile: Profile,
    media_type: String,
    mid: Option<String>,
    bandwidth_kbps: u32,
    payloads: Vec<PayloadType>,
    current_payload: Option<u8>,
    rtx: Option<RtxParameters>,
    local_endpoints: SmallVec<[EndpointPair; 1]>,
    remote_endpoints: SmallVec<[EndpointPair; 1]>,
    rtcp_mux: bool,
    reduced_minimum_rtcp: bool,
    mprtp_enabled: bool,
    extension_ids: Vec<(u8, String)>,
    xr: XrMode,
    packetization_mode: PacketizationMode,
    aggregate_stap: bool,
    mtu: usize,
    sdes: Option<SdesInfo>,
}

impl Default for SessionParametersBuilder {
    fn default() -> Self {
        Self {
            profile: Profile::Avp,
            media_type: "video".to_owned(),
            mid: None,
            bandwidth_kbps: 512,
            payloads: Vec::new(),
            current_payload: None,
            rtx: None,
            local_endpoints: SmallVec::new(),
            remote_endpoints: SmallVec::new(),
            rtcp_mux: false,
            reduced_minimum_rtcp: false,
            mprtp_enabled: false,
            extension_ids: Vec::new(),
            xr: XrMode::None,
            packetization_mode: PacketizationMode::NonInterleaved,
            aggregate_stap: true,
            mtu: 1500,
            sdes: None,
        }
    }
}

impl SessionParametersBuilder {
    pub fn profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = media_type.into();
        self
    }

    pub fn mid(mut self, mid: impl Into<String>) -> Self {
        self.mid = Some(mid.into());
        self
    }

    pub fn bandwidth_kbps(mut self, kbps: u32) -> Self {
        self.bandwidth_kbps = kbps;
        self
    }

    pub fn add_payload_type(mut self, id: u8, encoding_name: impl Into<String>, clock_rate: u32) -> Self {
        self.payloads.push(PayloadType {
            id,
            encoding_name: encoding_name.into(),
            clock_rate,
        });
        self
    }

    /// Marks a previously added payload type as the active one. Defaults to
    /// the first added.
    pub fn current_payload_type(mut self, id: u8) -> Self {
        self.current_payload = Some(id);
        self
    }

    pub fn rtx(mut self, rtx: RtxParameters) -> Self {
        self.rtx = Some(rtx);
        self
    }

    pub fn add_endpoints(mut self, local: EndpointPair, remote: EndpointPair) -> Self {
        self.local_endpoints.push(local);
        self.remote_endpoints.push(remote);
        self
    }

    pub fn rtcp_mux(mut self, on: bool) -> Self {
        self.rtcp_mux = on;
        self
    }

    pub fn reduced_minimum_rtcp(mut self, on: bool) -> Self {
        self.reduced_minimum_rtcp = on;
        self
    }

    pub fn mprtp(mut self, on: bool) -> Self {
        self.mprtp_enabled = on;
        self
    }

    pub fn add_extension(mut self, id: u8, name: impl Into<String>) -> Self {
        self.extension_ids.push((id, name.into()));
        self
    }

    pub fn xr(mut self, xr: XrMode) -> Self {
        self.xr = xr;
        self
    }

    pub fn packetization_mode(mut self, mode: PacketizationMode) -> Self {
        self.packetization_mode = mode;
        self
    }

    pub fn aggregate_stap(mut self, on: bool) -> Self {
        self.aggregate_stap = on;
        self
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn sdes(mut self, sdes: SdesInfo) -> Self {
        self.sdes = Some(sdes);
        self
    }

    pub fn build(self) -> Result<SessionParameters, Error> {
        let sdes = match self.sdes {
            Some(s) if !s.cname.is_empty() => s,
            _ => bail!(ErrorInt::InvalidConfiguration {
                description: "SDES CNAME is mandatory".to_owned(),
            }),
        };
        if self.payloads.is_empty() {
            bail!(ErrorInt::InvalidConfiguration {
                description: "at least one payload type is required".to_owned(),
            });
        }
        for (i, p) in self.payloads.iter().enumerate() {
            if p.id > 127 {
                bail!(ErrorInt::InvalidConfiguration {
                    description: format!("payload type {} exceeds 7 bits", p.id),
                });
            }
            if self.payloads[..i].iter().any(|q| q.id == p.id) {
                bail!(ErrorInt::InvalidConfiguration {
                    description: format!("duplicate payload type {}", p.id),
                });
            }
        }
        let current_payload = match self.current_payload {
            None => 0,
            Some(id) => match self.payloads.iter().position(|p| p.id == id) {
                Some(i) => i,
                None => bail!(ErrorInt::InvalidConfiguration {
                    description: format!("current payload type {} was never added", id),
                }),
            },
        };
        if let Some(rtx) = &self.rtx {
            if self.profile != Profile::Avpf {
                bail!(ErrorInt::InvalidConfiguration {
                    description: "retransmission requires the AVPF profile".to_owned(),
                });
            }
            if self.payloads.iter().any(|p| p.id == rtx.payload_type) {
                bail!(ErrorInt::InvalidConfiguration {
                    description: format!(
                        "RTX payload type {} collides with a media payload type",
                        rtx.payload_type
                    ),
                });
            }
            if !self.payloads.iter().any(|p| p.id == rtx.associated_payload_type) {
                bail!(ErrorInt::InvalidConfiguration {
                    description: format!(
                        "RTX associated payload type {} is not in the payload table",
                        rtx.associated_payload_type
                    ),
                });
            }
            if let RtxPolicy::Circular { depth: 0 } = rtx.policy {
                bail!(ErrorInt::InvalidConfiguration {
                    description: "circular RTX buffer depth must be non-zero".to_owned(),
                });
            }
        }
        if self.local_endpoints.is_empty() {
            bail!(ErrorInt::InvalidConfiguration {
                description: "at least one endpoint pair is required".to_owned(),
            });
        }
        debug_assert_eq!(self.local_endpoints.len(), self.remote_endpoints.len());
        if self.local_endpoints.len() > 1 && !self.mprtp_enabled {
            bail!(ErrorInt::InvalidConfiguration {
                description: format!(
                    "{} endpoint pairs configured but MPRTP is disabled",
                    self.local_endpoints.len()
                ),
            });
        }
        if self.mprtp_enabled && cfg!(not(feature = "mprtp")) {
            bail!(ErrorInt::InvalidConfiguration {
                description: "MPRTP requested but this build lacks the `mprtp` feature".to_owned(),
            });
        }
        for (i, (id, name)) in self.extension_ids.iter().enumerate() {
            if !(1..=14).contains(id) {
                bail!(ErrorInt::InvalidConfiguration {
                    description: format!("extension id {} out of the one-byte range 1..=14", id),
                });
            }
            if self.extension_ids[..i].iter().any(|(other, _)| other == id) {
                bail!(ErrorInt::InvalidConfiguration {
                    description: format!("extension id {} mapped twice", id),
                });
            }
            if self.extension_ids[..i].iter().any(|(_, n)| n == name) {
                bail!(ErrorInt::InvalidConfiguration {
                    description: format!("extension name {:?} mapped twice", name),
                });
            }
        }
        Ok(SessionParameters {
            profile: self.profile,
            media_type: self.media_type,
            mid: self.mid,
            bandwidth_kbps: self.bandwidth_kbps,
            payloads: self.payloads,
            current_payload,
            rtx: self.rtx,
            local_endpoints: self.local_endpoints,
            remote_endpoints: self.remote_endpoints,
            rtcp_mux: self.rtcp_mux,
            reduced_minimum_rtcp: self.reduced_minimum_rtcp,
            mprtp_enabled: self.mprtp_enabled,
            extension_ids: self.extension_ids,
            xr: self.xr,
            packetization_mode: self.packetization_mode,
            aggregate_stap: self.aggregate_stap,
            mtu: self.mtu,
            sdes,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn endpoints() -> (EndpointPair, EndpointPair) {
        (
            EndpointPair {
                rtp: "127.0.0.1:5000".parse().unwrap(),
                rtcp: "127.0.0.1:5001".parse().unwrap(),
            },
            EndpointPair {
                rtp: "127.0.0.1:6000".parse().unwrap(),
                rtcp: "127.0.0.1:6001".parse().unwrap(),
            },
        )
    }

    pub(crate) fn h264_builder() -> SessionParametersBuilder {
        let (local, remote) = endpoints();
        SessionParameters::builder()
            .add_payload_type(96, "h264", 90_000)
            .add_endpoints(local, remote)
            .sdes(SdesInfo::new("test@host"))
    }

    #[test]
    fn minimal_valid() {
        let p = h264_builder().build().unwrap();
        assert_eq!(p.current_payload().id, 96);
        assert_eq!(p.clock_rate(96), Some(90_000));
        assert_eq!(p.clock_rate(97), None);
        assert_eq!(p.payload_budget(), 1460);
    }

    #[test]
    fn cname_mandatory() {
        let (local, remote) = endpoints();
        let e = SessionParameters::builder()
            .add_payload_type(96, "h264", 90_000)
            .add_endpoints(local, remote)
            .build()
            .unwrap_err();
        assert!(e.is_invalid_configuration());
    }

    #[test]
    fn duplicate_payload_type_rejected() {
        let e = h264_builder()
            .add_payload_type(96, "h265", 90_000)
            .build()
            .unwrap_err();
        assert!(e.is_invalid_configuration());
    }

    #[test]
    fn rtx_requires_avpf_and_known_apt() {
        let rtx = RtxParameters {
            payload_type: 97,
            associated_payload_type: 96,
            policy: RtxPolicy::NackTimed {
                window: Duration::from_millis(3000),
            },
        };
        let e = h264_builder().rtx(rtx).build().unwrap_err();
        assert!(e.is_invalid_configuration()); // AVP profile

        let ok = h264_builder().profile(Profile::Avpf).rtx(rtx).build();
        assert!(ok.is_ok());

        let bad_apt = RtxParameters {
            associated_payload_type: 111,
            ..rtx
        };
        let e = h264_builder()
            .profile(Profile::Avpf)
            .rtx(bad_apt)
            .build()
            .unwrap_err();
        assert!(e.is_invalid_configuration());
    }

    #[test]
    fn multiple_endpoint_pairs_need_mprtp() {
        let (local, remote) = endpoints();
        let e = h264_builder()
            .add_endpoints(local, remote)
            .build()
            .unwrap_err();
        assert!(e.is_invalid_configuration());
    }

    #[test]
    fn duplicate_extension_id_rejected() {
        let e = h264_builder()
            .add_extension(3, "urn:a")
            .add_extension(3, "urn:b")
            .build()
            .unwrap_err();
        assert!(e.is_invalid_configuration());
    }
}
