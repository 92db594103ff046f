// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CRC32C (Castagnoli) header/data digests: left-seeded 0xFFFFFFFF, xored
//! with 0xFFFFFFFF on both input and output, with implicit zero padding up
//! to a 4-byte alignment.

use crc32c::crc32c_append;

#[inline]
pub fn pad_len(n: usize) -> usize {
    (4 - (n % 4)) % 4
}

/// Accumulate CRC32C over `parts` in order, then apply up to 3 bytes of
/// implicit zero padding. `crc32c_append`'s own seed/xor-in/xor-out already
/// match the Castagnoli convention the wire format calls for.
fn crc32c_with_padding(parts: &[&[u8]], pad: usize) -> u32 {
    let mut acc = 0u32;
    for p in parts {
        if !p.is_empty() {
            acc = crc32c_append(acc, p);
        }
    }
    if pad != 0 {
        let zeros = [0u8; 3];
        acc = crc32c_append(acc, &zeros[..pad]);
    }
    acc
}

/// Header digest: CRC32C of the bytes from offset 0 up to `hlen`.
pub fn compute_header_digest(header_bytes: &[u8]) -> u32 {
    crc32c_with_padding(&[header_bytes], 0)
}

/// Data digest: CRC32C over the data area, implicitly zero-padded to a
/// 4-byte boundary.
pub fn compute_data_digest(data: &[u8]) -> u32 {
    crc32c_with_padding(&[data], pad_len(data.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_len_rounds_up_to_four_byte_boundary() {
        assert_eq!(pad_len(0), 0);
        assert_eq!(pad_len(4), 0);
        assert_eq!(pad_len(1), 3);
        assert_eq!(pad_len(5), 3);
        assert_eq!(pad_len(6), 2);
    }

    #[test]
    fn header_digest_matches_known_crc32c_vector() {
        // "123456789" is the standard CRC32C check string; reference value
        // per the Castagnoli polynomial test vector.
        assert_eq!(compute_header_digest(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn data_digest_is_order_sensitive_and_padding_aware() {
        let a = compute_data_digest(b"abc");
        let b = compute_data_digest(b"abcd");
        let c = compute_data_digest(b"abc\0");
        assert_ne!(a, b);
        // Implicit zero padding over "abc" must match an explicit trailing
        // NUL byte bringing it to a 4-byte boundary.
        assert_eq!(a, c);
    }

    #[test]
    fn empty_data_digest_is_deterministic() {
        assert_eq!(compute_data_digest(b""), compute_data_digest(b""));
    }
}
