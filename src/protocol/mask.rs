//! Payload masking per RFC 6455 Section 5.3.

/// Byte-by-byte XOR masking. Reference implementation; also used for tails.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// XOR masking processing 4 bytes at a time with u32 operations.
///
/// The mask key repeats every 4 bytes, so a whole-word XOR with the key as a
/// native-endian u32 is equivalent to the byte loop on aligned chunks.
#[inline]
pub fn apply_mask_fast(data: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);
    let mut chunks = data.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        chunk.copy_from_slice(&(word ^ mask_u32).to_ne_bytes());
    }
    let tail = chunks.into_remainder();
    apply_mask(tail, mask);
}

/// Generate a fresh 4-byte masking key for a client frame.
///
/// Draws from the OS entropy source; if that fails, falls back to mixing
/// the system clock so the mask is still non-constant.
#[must_use]
pub fn make_mask() -> [u8; 4] {
    let mut key = [0u8; 4];
    if getrandom::getrandom(&mut key).is_ok() {
        return key;
    }
    use std::time::{SystemTime, UNIX_EPOCH};
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u32)
        .unwrap_or(0x9E37_79B9);
    let a = seed.wrapping_mul(0x85EB_CA6B);
    let b = a ^ (a >> 13);
    b.wrapping_mul(0xC2B2_AE35).to_le_bytes()
}
