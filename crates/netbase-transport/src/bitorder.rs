//! Payload bit-order normalization.
//!
//! Little-endian hosts reverse the bit order inside every payload byte
//! (bit 0 swaps with bit 7, 1 with 6, 2 with 5, 3 with 4) before a payload
//! leaves the process, and apply the same reversal again after it arrives.
//! Big-endian hosts send payload bytes untouched. Length prefixes are not
//! affected; they always travel in network byte order.
//!
//! The transform depends only on the local host, so two peers interoperate
//! only when they share the same endianness.

/// True when compiled for a big-endian target.
pub const fn is_big_endian() -> bool {
    cfg!(target_endian = "big")
}

/// True when payload bytes are bit-reversed on this host.
pub const fn transforms_payload() -> bool {
    !is_big_endian()
}

/// Reverse the order of the bits in one byte.
pub const fn reverse_bits(b: u8) -> u8 {
    b.reverse_bits()
}

/// Apply the host's wire transform to a single byte.
#[inline]
pub fn normalize_byte(b: u8) -> u8 {
    if transforms_payload() {
        reverse_bits(b)
    } else {
        b
    }
}

/// Apply the host's wire transform to `buf` in place.
///
/// The transform is an involution: applying it twice restores the input.
pub fn normalize(buf: &mut [u8]) {
    if transforms_payload() {
        for b in buf.iter_mut() {
            *b = reverse_bits(*b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_bits_known_values() {
        assert_eq!(reverse_bits(0b0000_0001), 0b1000_0000);
        assert_eq!(reverse_bits(0b1100_1010), 0b0101_0011);
        assert_eq!(reverse_bits(0x00), 0x00);
        assert_eq!(reverse_bits(0xFF), 0xFF);
        assert_eq!(reverse_bits(b'p'), 0x0E);
    }

    #[test]
    fn normalize_twice_is_identity() {
        let original: Vec<u8> = (0..=255u8).collect();
        let mut buf = original.clone();
        normalize(&mut buf);
        normalize(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn normalize_matches_host_endianness() {
        let mut buf = *b"ping";
        normalize(&mut buf);
        if is_big_endian() {
            assert_eq!(&buf, b"ping");
        } else {
            assert_eq!(buf, [0x0E, 0x96, 0x76, 0xE6]);
        }
        assert_eq!(normalize_byte(b'i'), buf[1]);
    }
}
