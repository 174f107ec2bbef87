// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP/RTCP media transport session runtime; see
//! [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).
//!
//! This crate implements the per-session core of a real-time media transport
//! stack: the member/source database with RFC 3550 Appendix A validation, the
//! RTCP transmission schedule under the reconsideration algorithm, H.264
//! payload (de)packetization per [RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184),
//! send-side retransmission buffering per
//! [RFC 4588](https://datatracker.ietf.org/doc/html/rfc4588), and (behind the
//! `mprtp` feature) a multipath extension with per-subflow sequence spaces.
//!
//! Signalling (RTSP/SIP/SDP) and concrete sockets live elsewhere: a consumer
//! negotiates a [`SessionParameters`], implements [`transport::PacketTransport`],
//! and drives a [`Session`].

use std::fmt::Display;
use std::net::SocketAddr;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

mod error;

pub mod codec;
pub mod ext;
#[cfg(feature = "mprtp")]
pub mod mprtp;
pub mod rtcp;
pub mod rtp;
pub mod rtx;
pub mod session;
pub mod transport;

pub use error::Error;
pub use session::clock::{ManualClock, ReferenceClock, SystemClock};
pub use session::member::MemberUpdate;
pub use session::parameters::SessionParameters;
pub use session::{ReceivedPacket, Session, SessionHandle};

pub const UNIX_EPOCH: NtpTimestamp = NtpTimestamp((2_208_988_800) << 32);

/// A wallclock time represented using the format of the Network Time Protocol.
/// This isn't necessarily gathered from a real NTP server. Reported NTP
/// timestamps are allowed to jump backwards and/or be complete nonsense.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// The middle 32 bits, as carried in the LSR/DLRR fields of RTCP reports.
    #[inline]
    pub fn mid32(self) -> u32 {
        ((self.0 >> 16) & 0xFFFF_FFFF) as u32
    }

    #[inline]
    pub fn msw(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn lsw(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}

impl std::fmt::Display for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let since_epoch = self.0.wrapping_sub(UNIX_EPOCH.0);
        let sec_since_epoch = (since_epoch >> 32) as u32;
        let tm = time::at(time::Timespec {
            sec: i64::from(sec_since_epoch),
            nsec: 0,
        });
        let ms = ((since_epoch & 0xFFFF_FFFF) * 1_000) >> 32;
        let zone_minutes = tm.tm_utcoff.abs() / 60;
        write!(
            f,
            "{}.{:03}{}{:02}:{:02}",
            tm.strftime("%FT%T").map_err(|_| std::fmt::Error)?,
            ms,
            if tm.tm_utcoff > 0 { '+' } else { '-' },
            zone_minutes / 60,
            zone_minutes % 60
        )
    }
}

impl std::fmt::Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Write both the raw and display forms.
        write!(f, "{} /* {} */", self.0, self)
    }
}

/// A wall time taken from the local machine's realtime clock.
///
/// Used both for error reporting and as the presentation timebase before and
/// after RTCP synchronisation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WallTime(time::Timespec);

impl WallTime {
    pub fn now() -> Self {
        Self(time::get_time())
    }

    /// Converts to the NTP representation (seconds since 1900, 32.32 fixed point).
    pub fn to_ntp(self) -> NtpTimestamp {
        let sec = (self.0.sec as u64).wrapping_add(2_208_988_800);
        let frac = ((self.0.nsec as u64) << 32) / 1_000_000_000;
        NtpTimestamp((sec << 32) | frac)
    }

    /// Returns `self` shifted by `secs` seconds, which may be negative.
    pub(crate) fn offset_secs(self, secs: f64) -> WallTime {
        let nanos = (secs * 1e9) as i64;
        let mut sec = self.0.sec + nanos / 1_000_000_000;
        let mut nsec = i64::from(self.0.nsec) + nanos % 1_000_000_000;
        if nsec < 0 {
            sec -= 1;
            nsec += 1_000_000_000;
        } else if nsec >= 1_000_000_000 {
            sec += 1;
            nsec -= 1_000_000_000;
        }
        WallTime(time::Timespec {
            sec,
            nsec: nsec as i32,
        })
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(
            &time::at(self.0)
                .strftime("%FT%T")
                .map_err(|_| std::fmt::Error)?,
            f,
        )
    }
}

/// Context for a received RTP or RTCP packet.
///
/// This gives enough information to pick the packet out of a capture, and
/// carries the arrival instants the member database needs for jitter and
/// liveness accounting.
#[derive(Copy, Clone, Debug)]
pub struct PacketContext(PacketContextInner);

#[derive(Copy, Clone, Debug)]
enum PacketContextInner {
    Udp {
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        received_wall: WallTime,
        received: std::time::Instant,
    },
    Dummy {
        received_wall: WallTime,
        received: std::time::Instant,
    },
}

impl PacketContext {
    pub fn udp(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self(PacketContextInner::Udp {
            local_addr,
            peer_addr,
            received_wall: WallTime::now(),
            received: std::time::Instant::now(),
        })
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self(PacketContextInner::Dummy {
            received_wall: WallTime::now(),
            received: std::time::Instant::now(),
        })
    }

    /// A context with a caller-supplied arrival time, for tests driving a
    /// [`ManualClock`].
    #[doc(hidden)]
    pub fn at(received: std::time::Instant, received_wall: WallTime) -> Self {
        Self(PacketContextInner::Dummy {
            received_wall,
            received,
        })
    }

    #[inline]
    pub fn received(&self) -> std::time::Instant {
        match self.0 {
            PacketContextInner::Udp { received, .. } => received,
            PacketContextInner::Dummy { received, .. } => received,
        }
    }

    #[inline]
    pub fn received_wall(&self) -> WallTime {
        match self.0 {
            PacketContextInner::Udp { received_wall, .. } => received_wall,
            PacketContextInner::Dummy { received_wall, .. } => received_wall,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self.0 {
            PacketContextInner::Udp { peer_addr, .. } => Some(peer_addr),
            PacketContextInner::Dummy { .. } => None,
        }
    }
}

impl Display for PacketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            PacketContextInner::Udp {
                local_addr,
                peer_addr,
                received_wall,
                ..
            } => {
                write!(f, "{}->{}@{}", peer_addr, local_addr, received_wall)
            }
            PacketContextInner::Dummy { received_wall, .. } => write!(f, "dummy@{}", received_wall),
        }
    }
}

/// Returns the range within `buf` that represents `subset`.
/// If `subset` is empty, returns None; otherwise panics if `subset` is not within `buf`.
pub(crate) fn as_range(buf: &[u8], subset: &[u8]) -> Option<std::ops::Range<usize>> {
    if subset.is_empty() {
        return None;
    }
    let subset_p = subset.as_ptr() as usize;
    let buf_p = buf.as_ptr() as usize;
    let off = match subset_p.checked_sub(buf_p) {
        Some(off) => off,
        None => panic!(
            "{}-byte subset not within {}-byte buf",
            subset.len(),
            buf.len()
        ),
    };
    let end = off + subset.len();
    assert!(end <= buf.len());
    Some(off..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ntp_mid32() {
        let ts = NtpTimestamp(0x0123_4567_89AB_CDEF);
        assert_eq!(ts.mid32(), 0x4567_89AB);
        assert_eq!(ts.msw(), 0x0123_4567);
        assert_eq!(ts.lsw(), 0x89AB_CDEF);
    }

    #[test]
    fn wall_to_ntp_round() {
        let w = WallTime(time::Timespec {
            sec: 1_600_000_000,
            nsec: 500_000_000,
        });
        let ntp = w.to_ntp();
        assert_eq!(ntp.msw() as u64, 1_600_000_000 + 2_208_988_800);
        // 0.5 s is half the 32-bit fraction space.
        assert!((i64::from(ntp.lsw()) - 0x8000_0000i64).abs() < 8);
    }

    #[test]
    fn wall_offset() {
        let w = WallTime(time::Timespec {
            sec: 100,
            nsec: 900_000_000,
        });
        let later = w.offset_secs(0.2);
        assert_eq!(later.0.sec, 101);
        assert!((later.0.nsec - 100_000_000).abs() < 1_000);
        let earlier = w.offset_secs(-1.0);
        assert_eq!(earlier.0.sec, 99);
    }
}
