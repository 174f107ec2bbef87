// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The transport boundary.
//!
//! The session core is transport-agnostic: concrete adapters (UDP sockets,
//! RTSP-interleaved TCP, userland SCTP) live outside this crate. An adapter
//! implements [`PacketTransport`] for the outbound direction and marshals
//! inbound datagrams and completion errors onto the session task through a
//! [`crate::SessionHandle`], which wraps them as [`TransportEvent`]s.

use bytes::Bytes;

use crate::PacketContext;

/// Outbound half of a transport adapter.
///
/// Sends are non-blocking and infallible at this boundary: an adapter that
/// detects a send failure reports it asynchronously via
/// [`crate::SessionHandle::send_failed`], never synchronously. `shutdown`
/// must cancel pending I/O; completion callbacks for outstanding operations
/// still fire, with a cancelled error.
pub trait PacketTransport: Send {
    /// Queues one serialized RTP packet. `subflow_hint` selects the
    /// endpoint pair for multipath sessions; `None` or an unknown value
    /// means the first pair.
    fn send_rtp(&mut self, packet: Bytes, subflow_hint: Option<u16>);

    /// Queues one serialized compound RTCP packet.
    fn send_rtcp(&mut self, packet: Bytes);

    /// Cancels pending I/O and releases resources.
    fn shutdown(&mut self);
}

/// An inbound event marshalled onto the session task.
#[derive(Debug)]
pub enum TransportEvent {
    Rtp { data: Bytes, ctx: PacketContext },
    Rtcp { data: Bytes, ctx: PacketContext },
    /// A completion callback reported a failed send.
    SendFailed {
        channel: &'static str,
        description: String,
    },
    /// The transport is gone; the session shuts down.
    Closed,
}
