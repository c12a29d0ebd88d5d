//! RFC 6455 wire protocol: opcodes, masking, frame codec, close payloads.

pub mod close;
pub mod frame;
pub mod mask;
pub mod opcode;

pub use close::{decode_close, encode_close};
pub use frame::{read_frame, write_frame, Frame, MAX_CONTROL_FRAME_PAYLOAD};
pub use mask::{apply_mask, apply_mask_fast, make_mask};
pub use opcode::OpCode;
