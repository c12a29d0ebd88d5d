//! WebSocket frame reading and writing (RFC 6455 Section 5.2).
//!
//! The reader pulls exactly one frame from an async byte source and places
//! the payload at the start of a caller-supplied buffer; the writer appends
//! exactly one frame to a growable byte sink. Fragmentation policy lives
//! with the caller.
//!
//! ## Frame structure
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode |M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)   |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |                         Masking key (if present)              |
//! +---------------------------------------------------------------+
//! |                     Payload data                              |
//! +---------------------------------------------------------------+
//! ```

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::protocol::mask::apply_mask_fast;
use crate::protocol::OpCode;

/// Maximum payload size for control frames (RFC 6455 Section 5.5).
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

/// Largest possible frame header: 2 fixed bytes, 8 extended-length bytes,
/// 4 mask-key bytes.
pub const MAX_HEADER_LEN: usize = 14;

/// Descriptor of one parsed frame. The payload itself lives in the buffer
/// the caller handed to [`read_frame`], at offset 0 for [`len`](Frame::len)
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Frame opcode.
    pub opcode: OpCode,
    /// Final-fragment flag.
    pub fin: bool,
    /// Payload length in bytes.
    pub len: usize,
}

/// Read exactly one frame from `io`, placing the payload into `dst[..len]`.
///
/// The payload is unmasked in place when the frame carried a masking key.
///
/// # Errors
///
/// - `Error::BufferOverflow` if the declared payload length exceeds `dst`
/// - `Error::PayloadLengthOutOfRange` if the 64-bit length has its high bit set
/// - `Error::UnexpectedEnd` if the source is exhausted mid-frame
/// - `Error::ReservedOpcode` for opcodes 0x3-0x7 and 0xB-0xF
/// - `Error::ProtocolViolation` / `Error::ControlFrameTooLarge` for a
///   control frame with FIN=0 or more than 125 payload bytes
pub async fn read_frame<R>(io: &mut R, dst: &mut [u8]) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    io.read_exact(&mut head).await?;

    let fin = head[0] & 0x80 != 0;
    let opcode = OpCode::from_u8(head[0] & 0x0F)?;
    let masked = head[1] & 0x80 != 0;

    let declared = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            io.read_exact(&mut ext).await?;
            u64::from(u16::from_be_bytes(ext))
        }
        127 => {
            let mut ext = [0u8; 8];
            io.read_exact(&mut ext).await?;
            let len = u64::from_be_bytes(ext);
            if len & (1 << 63) != 0 {
                return Err(Error::PayloadLengthOutOfRange(len));
            }
            len
        }
        short => u64::from(short),
    };

    if opcode.is_control() {
        if !fin {
            return Err(Error::ProtocolViolation(format!(
                "fragmented {opcode} frame"
            )));
        }
        if declared > MAX_CONTROL_FRAME_PAYLOAD as u64 {
            return Err(Error::ControlFrameTooLarge(declared as usize));
        }
    }

    if declared > dst.len() as u64 {
        return Err(Error::BufferOverflow {
            length: declared,
            capacity: dst.len(),
        });
    }
    let len = declared as usize;

    let mask = if masked {
        let mut key = [0u8; 4];
        io.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    io.read_exact(&mut dst[..len]).await?;
    if let Some(key) = mask {
        apply_mask_fast(&mut dst[..len], key);
    }

    Ok(Frame { opcode, fin, len })
}

/// Append exactly one frame to `dst`.
///
/// When `mask` is given (client role) the key is written after the length
/// and the payload is XOR-masked on the way out; a zero-length masked frame
/// still carries its key. RSV bits are always zero.
///
/// # Errors
///
/// Returns `Error::ControlFrameTooLarge` or `Error::ProtocolViolation` for
/// a control frame with more than 125 payload bytes or FIN=0.
pub fn write_frame(
    dst: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) -> Result<()> {
    if opcode.is_control() {
        if !fin {
            return Err(Error::ProtocolViolation(format!(
                "fragmented {opcode} frame"
            )));
        }
        if payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
            return Err(Error::ControlFrameTooLarge(payload.len()));
        }
    }

    dst.reserve(MAX_HEADER_LEN + payload.len());

    let mut byte0 = opcode.as_u8();
    if fin {
        byte0 |= 0x80;
    }
    dst.put_u8(byte0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    match payload.len() {
        0..=125 => dst.put_u8(mask_bit | payload.len() as u8),
        126..=65535 => {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(payload.len() as u16);
        }
        _ => {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(payload.len() as u64);
        }
    }

    match mask {
        Some(key) => {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(payload);
            apply_mask_fast(&mut dst[start..], key);
        }
        None => dst.put_slice(payload),
    }

    Ok(())
}
