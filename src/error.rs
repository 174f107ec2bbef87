// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;

use crate::PacketContext;

/// An opaque `cochlea` error.
///
/// Currently the focus is on providing detailed human-readable error
/// descriptions rather than a matchable taxonomy; the cheap-to-clone `Arc`
/// wrapper lets the session retain the error for observability while also
/// returning it to the caller.
#[derive(Clone, Debug)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Returns true if this error indicates the session has been stopped.
    pub fn is_shutdown(&self) -> bool {
        matches!(*self.0, ErrorInt::SessionShuttingDown)
    }

    /// Returns true for construction-time configuration errors.
    pub fn is_invalid_configuration(&self) -> bool {
        matches!(*self.0, ErrorInt::InvalidConfiguration { .. })
    }
}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    #[error("malformed {protocol} packet ({ctx}): {description}")]
    MalformedPacket {
        protocol: &'static str,
        ctx: PacketContext,
        description: String,
    },

    #[error("payload type {pt} is not in the session's payload table ({ctx})")]
    UnknownPayloadType { pt: u8, ctx: PacketContext },

    #[error("packetize: {description}")]
    PacketizeError { description: String },

    #[error("depacketize ssrc={ssrc:08x} ts={timestamp}: {source}")]
    DepacketizeError {
        ssrc: u32,
        timestamp: u32,
        source: crate::codec::DepacketizeError,
    },

    #[error("session is shutting down")]
    SessionShuttingDown,

    #[error("invalid session configuration: {description}")]
    InvalidConfiguration { description: String },

    #[error("transport failure on {channel}: {description}")]
    TransportFailure {
        channel: &'static str,
        description: String,
    },
}
