//! Error types for the WebSocket endpoint core.
//!
//! Every failure the codec or the connection state machine can produce maps
//! to an RFC 6455 close code via [`Error::close_code`]; the receive path
//! uses that mapping when it emits a best-effort close frame before
//! surfacing the error.

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::message::CloseCode;

/// Result type alias for WebSocket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during WebSocket operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The declared payload length does not fit the destination buffer.
    #[error("payload of {length} bytes exceeds receive buffer of {capacity} bytes")]
    BufferOverflow {
        /// Declared payload length from the frame header.
        length: u64,
        /// Capacity of the caller-supplied buffer.
        capacity: usize,
    },

    /// A 64-bit extended payload length with the high bit set.
    ///
    /// RFC 6455 requires the most significant bit of the 8-byte length to
    /// be zero.
    #[error("payload length {0} out of range (must be < 2^63)")]
    PayloadLengthOutOfRange(u64),

    /// The byte source ended in the middle of a frame.
    #[error("stream ended unexpectedly mid-frame")]
    UnexpectedEnd,

    /// The operation was cancelled by the caller's token or by the
    /// connection shutting down.
    #[error("operation cancelled")]
    Cancelled,

    /// A reserved opcode (0x3-0x7, 0xB-0xF) appeared on the wire.
    #[error("reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// Control frame payload exceeds 125 bytes.
    #[error("control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    /// Protocol violation detected.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The operation is not allowed in the connection's current state.
    #[error("connection is {0}")]
    InvalidState(ConnectionState),

    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// The close code to send to the peer when this error aborts the
    /// receive path.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            Error::BufferOverflow { .. } => CloseCode::MessageTooBig,
            Error::PayloadLengthOutOfRange(_)
            | Error::ReservedOpcode(_)
            | Error::ControlFrameTooLarge(_)
            | Error::ProtocolViolation(_) => CloseCode::ProtocolError,
            Error::UnexpectedEnd => CloseCode::InvalidPayloadData,
            Error::Cancelled => CloseCode::EndpointUnavailable,
            Error::InvalidState(_) | Error::Io(_) => CloseCode::InternalServerError,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::UnexpectedEnd
        } else {
            Error::Io(err.to_string())
        }
    }
}
