//! Close frame payload codec (RFC 6455 Section 5.5.1).
//!
//! A close payload is a 2-byte big-endian status code optionally followed
//! by a UTF-8 reason. A payload shorter than 2 bytes carries no status and
//! decodes as 1005 (no status received).

use crate::message::CloseCode;

/// Encode a close payload from a status code and reason.
///
/// An empty or whitespace-only reason encodes to the status code alone.
#[must_use]
pub fn encode_close(code: CloseCode, reason: &str) -> Vec<u8> {
    let reason = reason.trim();
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.as_u16().to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Decode a close payload into its status code and reason.
///
/// Reason bytes that are not valid UTF-8 are decoded lossily.
#[must_use]
pub fn decode_close(payload: &[u8]) -> (CloseCode, String) {
    if payload.len() < 2 {
        return (CloseCode::NoStatusReceived, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (CloseCode::from_u16(code), reason)
}
