//! Payload masking per RFC 6455 §5.3.
//!
//! The operation is a repeating XOR with a 4-byte key and is its own
//! inverse: masking and unmasking are the same call.

/// Mask or unmask a buffer in place with the given key.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_fast32(buf, mask);
}

/// Mask or unmask a buffer whose first byte sits at `offset` bytes into the
/// frame payload. Used when a frame is transmitted in chunks: each chunk
/// continues the keystream where the previous one stopped.
#[inline]
pub(crate) fn apply_mask_offset(buf: &mut [u8], mask: [u8; 4], offset: u64) {
    let shift = (offset & 3) as usize;
    let rotated = [
        mask[shift & 3],
        mask[(shift + 1) & 3],
        mask[(shift + 2) & 3],
        mask[(shift + 3) & 3],
    ];
    apply_mask_fast32(buf, rotated);
}

/// Bytewise reference implementation.
#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// XOR in 4-byte blocks over the word-aligned middle of the buffer, with
/// bytewise handling of the unaligned prefix and suffix.
#[inline]
fn apply_mask_fast32(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);

    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u32>() };
    apply_mask_fallback(prefix, mask);
    let head = prefix.len() & 3;
    let mask_u32 = if head > 0 {
        if cfg!(target_endian = "big") {
            mask_u32.rotate_left(8 * head as u32)
        } else {
            mask_u32.rotate_right(8 * head as u32)
        }
    } else {
        mask_u32
    };
    for word in words.iter_mut() {
        *word ^= mask_u32;
    }
    apply_mask_fallback(suffix, mask_u32.to_ne_bytes());
}
