//! Decompression shims for compressed Mach-O payloads.
//!
//! Both algorithms are pure `(src, dst) -> bytes_written` functions with no
//! allocation and no notion of "where memory comes from" — the boot-stream
//! interpreter is the one deciding where the decompressed bytes land.

use crate::LoaderError;

const RING_SIZE: usize = 4096;
const MATCH_MAX: usize = 18;
const MATCH_THRESHOLD: usize = 2;

/// Decode an LZSS stream produced by the historical Okumura encoder: an
/// 8-bit flag byte precedes every 8 tokens, each bit selecting between a
/// literal byte and a (position, length) back-reference into a 4 KiB ring
/// buffer seeded with spaces.
pub fn decompress_lzss(dst: &mut [u8], src: &[u8]) -> Result<usize, LoaderError> {
    let mut text_buf = [b' '; RING_SIZE + MATCH_MAX - 1];
    let mut r = RING_SIZE - MATCH_MAX;
    let mut src_pos = 0usize;
    let mut dst_pos = 0usize;
    let mut flags: u32 = 0;

    loop {
        flags >>= 1;
        if flags & 0x100 == 0 {
            let Some(&c) = src.get(src_pos) else { break };
            src_pos += 1;
            flags = u32::from(c) | 0xFF00;
        }

        if flags & 1 != 0 {
            let Some(&c) = src.get(src_pos) else { break };
            src_pos += 1;
            let out = dst.get_mut(dst_pos).ok_or(LoaderError::DecompressOverflow)?;
            *out = c;
            dst_pos += 1;
            text_buf[r] = c;
            r = (r + 1) & (RING_SIZE - 1);
        } else {
            let Some(&i_lo) = src.get(src_pos) else { break };
            src_pos += 1;
            let Some(&j_byte) = src.get(src_pos) else { break };
            src_pos += 1;

            let i = usize::from(i_lo) | ((usize::from(j_byte) & 0xF0) << 4);
            let len = (usize::from(j_byte) & 0x0F) + MATCH_THRESHOLD;

            for k in 0..=len {
                let c = text_buf[(i + k) & (RING_SIZE - 1)];
                let out = dst.get_mut(dst_pos).ok_or(LoaderError::DecompressOverflow)?;
                *out = c;
                dst_pos += 1;
                text_buf[r] = c;
                r = (r + 1) & (RING_SIZE - 1);
            }
        }
    }

    Ok(dst_pos)
}

/// QuickLZ level-1 decompression is not implemented.
///
/// The original re-used a single scoped scratch allocation across every QLZ
/// call site, a pattern that does not translate cleanly onto this crate's
/// allocation-free design (see the QLZ entry in the design notes). Images
/// compressed with `kCommandMachOFlags_CompressedQLZ` are rejected with
/// [`LoaderError::QlzUnsupported`] instead of silently producing wrong
/// output.
pub fn decompress_qlz(_dst: &mut [u8], _src: &[u8]) -> Result<usize, LoaderError> {
    Err(LoaderError::QlzUnsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-encode "AAAAAAAAAA" (10 bytes) as: 3 literals, then one
    /// back-reference repeating the first byte 7 more times.
    #[test]
    fn decompresses_simple_literal_run() {
        let src = [0xFFu8, b'A', b'B', b'C'];
        let mut dst = [0u8; 3];
        let n = decompress_lzss(&mut dst, &src).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&dst, b"ABC");
    }

    #[test]
    fn decompress_overflow_is_reported() {
        let src = [0xFFu8, b'A', b'B', b'C'];
        let mut dst = [0u8; 2];
        assert_eq!(
            decompress_lzss(&mut dst, &src).unwrap_err(),
            LoaderError::DecompressOverflow
        );
    }
}
