use std::time::Duration;

use thiserror::Error;

use crate::meshcore::NodeId;

/// Malformed byte stream on the companion serial link.
///
/// The offending bytes have already been discarded by the decoder when one of
/// these is returned; the caller logs it and keeps decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Length header larger than the frame maximum.
    #[error("frame length {len} exceeds maximum {max}")]
    Oversize { len: usize, max: usize },

    /// A zero-length frame carries no code byte.
    #[error("empty frame")]
    Empty,

    /// Bytes found where a direction marker was expected.
    #[error("expected marker 0x{expected:02x}, skipped {skipped} byte(s)")]
    BadMarker { expected: u8, skipped: usize },

    /// A known code whose payload is shorter than its layout requires.
    #[error("truncated payload for code 0x{code:02x} ({len} bytes)")]
    Truncated { code: u8, len: usize },

    /// Returned by the encoder when a payload cannot fit in one frame.
    #[error("payload of {len} bytes does not fit in a frame (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Errors raised by the link and delivery layers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Underlying interface failure (open, read, write).
    #[error("link error: {0}")]
    Link(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Link is between connections; the request was not written.
    #[error("link is not ready")]
    LinkDown,

    /// The node is not in the radio's contact table.
    #[error("{0} is not a device contact")]
    UnknownContact(NodeId),

    /// No answer to a negotiation command within the bounded wait.
    #[error("handshake timed out waiting for {0}")]
    HandshakeTimeout(&'static str),

    /// A non-handshake command was never answered.
    #[error("command {0} timed out")]
    CommandTimeout(&'static str),

    /// The device answered with its error response.
    #[error("device rejected {command} (code {code})")]
    DeviceRejected { command: &'static str, code: u8 },

    /// The device answered with something other than what was asked for.
    #[error("unexpected response to {command}: {got}")]
    UnexpectedResponse { command: &'static str, got: String },

    /// No delivery confirmation before the unit's deadline.
    #[error("no delivery confirmation within {0:?}")]
    AckTimeout(Duration),

    /// Retry ceiling exceeded; the owning session is torn down.
    #[error("delivery to {node} abandoned after {attempts} attempt(s)")]
    DeliveryAbandoned { node: NodeId, attempts: u32 },

    /// Reconnect attempts exhausted. Affects every session.
    #[error("link failed permanently after {attempts} reconnect attempt(s): {last}")]
    Fatal { attempts: u32, last: String },

    #[error("link task has shut down")]
    Closed,
}
