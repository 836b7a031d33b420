//! Named outcomes, not per-call exceptions, that drive connection and
//! command lifecycle decisions.

use thiserror::Error;

/// Structural/codec-level decode failures (distinct from CRC mismatch, which
/// is logged but not fatal to parsing).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short: have {have} bytes, need at least {need}")]
    Truncated { have: usize, need: usize },
    #[error("length field inconsistent with buffer: len byte says {declared}, body is {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("missing start marker")]
    NoStartMarker,
    #[error("missing stop marker")]
    NoStopMarker,
    #[error("body too short for protocol 0x{proto:02X}")]
    BodyTooShort { proto: u8 },
}

/// Error surface of the connection handler and command dispatcher.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] CodecError),

    #[error("packet received before authentication")]
    UnauthenticatedTraffic,

    #[error("unknown protocol byte 0x{0:02X}")]
    UnknownProto(u8),

    #[error("persistence call failed: {0}")]
    StoreFailure(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection superseded by a newer login for the same identity")]
    Superseded,

    #[error("server is shutting down")]
    Shutdown,

    #[error("command timed out waiting for device reply")]
    CommandTimeout,

    #[error("device is not connected")]
    NotConnected,
}
