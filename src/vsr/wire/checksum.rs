//! Deterministic SHA-256 checksum truncated to 128 bits.
//!
//! Both wire checksums (header and body) use the low 128 bits of a SHA-256
//! digest so tags are reproducible across implementations. This detects
//! corruption but is not a secret-key authenticator.

use sha2::{Digest, Sha256};

pub type Checksum128 = u128;

/// Computes the truncated SHA-256 checksum for `data`.
///
/// The low 128 bits of the 256-bit digest are returned as a little-endian
/// `u128` to match the wire format.
#[inline]
pub fn checksum(data: &[u8]) -> u128 {
    let digest = Sha256::digest(data);

    let low: [u8; 16] = digest[..16].try_into().expect("digest is 32 bytes");
    u128::from_le_bytes(low)
}

#[cfg(test)]
mod tests {
    use super::checksum;
    use proptest::prelude::*;

    // =========================================================================
    // Unit Tests: Determinism
    // =========================================================================

    #[test]
    fn determinism_empty() {
        let c1 = checksum(b"");
        let c2 = checksum(b"");
        assert_eq!(c1, c2, "Empty input must produce consistent checksum");
    }

    #[test]
    fn determinism_single_byte() {
        let c1 = checksum(b"a");
        let c2 = checksum(b"a");
        assert_eq!(c1, c2, "Single byte must produce consistent checksum");
    }

    #[test]
    fn determinism_large_input() {
        let data = vec![0xAB; 10_000];
        let c1 = checksum(&data);
        let c2 = checksum(&data);
        assert_eq!(c1, c2, "Large input must produce consistent checksum");
    }

    #[test]
    fn matches_truncated_sha256() {
        use sha2::{Digest, Sha256};

        let data = b"known answer";
        let digest = Sha256::digest(data);
        let expected = u128::from_le_bytes(digest[..16].try_into().unwrap());

        assert_eq!(checksum(data), expected);
    }

    // =========================================================================
    // Unit Tests: Collision Resistance
    // =========================================================================

    #[test]
    fn different_inputs_different_checksums() {
        let c1 = checksum(b"message1");
        let c2 = checksum(b"message2");
        assert_ne!(c1, c2, "Different inputs must produce different checksums");
    }

    #[test]
    fn single_bit_flip_changes_checksum() {
        let data1 = b"message";
        let mut data2 = data1.to_vec();
        data2[0] ^= 0x01;

        let c1 = checksum(data1);
        let c2 = checksum(&data2);
        assert_ne!(c1, c2, "Single bit flip must change checksum");
    }

    #[test]
    fn trailing_byte_changes_checksum() {
        let c1 = checksum(b"message");
        let c2 = checksum(b"message\0");
        assert_ne!(c1, c2, "Trailing byte must change checksum");
    }

    #[test]
    fn reordered_bytes_different_checksum() {
        let c1 = checksum(b"ab");
        let c2 = checksum(b"ba");
        assert_ne!(c1, c2, "Byte order must affect checksum");
    }

    // =========================================================================
    // Unit Tests: Edge Cases
    // =========================================================================

    #[test]
    fn empty_input_no_panic() {
        let data: [u8; 0] = [];
        let _ = checksum(&data);
    }

    #[test]
    fn boundary_sizes() {
        // Test sizes around SHA-256 block boundaries (64-byte blocks).
        for size in [0, 1, 31, 32, 33, 63, 64, 65, 127, 128, 129] {
            let data = vec![0x42u8; size];
            let c1 = checksum(&data);
            let c2 = checksum(&data);
            assert_eq!(c1, c2, "Size {} must produce deterministic checksum", size);
        }
    }

    #[test]
    fn large_realistic_message() {
        // VSR messages might be several KB
        let data = vec![0x5A; 64 * 1024]; // 64KB
        let _ = checksum(&data); // Should not panic
    }

    // =========================================================================
    // Property-Based Tests
    // =========================================================================

    proptest! {
        #[test]
        fn prop_deterministic(data: Vec<u8>) {
            let c1 = checksum(&data);
            let c2 = checksum(&data);
            prop_assert_eq!(c1, c2, "Checksum must be deterministic");
        }

        #[test]
        fn prop_collision_resistance(data1: Vec<u8>, data2: Vec<u8>) {
            prop_assume!(data1 != data2);
            let c1 = checksum(&data1);
            let c2 = checksum(&data2);
            prop_assert_ne!(c1, c2, "Different inputs produced same checksum");
        }

        #[test]
        fn prop_bit_sensitivity(data: Vec<u8>, byte_idx in 0usize..256, bit_idx in 0u8..8) {
            prop_assume!(!data.is_empty());
            let byte_idx = byte_idx % data.len();

            let original = checksum(&data);
            let mut modified = data.clone();
            modified[byte_idx] ^= 1 << bit_idx;
            let modified_sum = checksum(&modified);

            prop_assert_ne!(original, modified_sum, "Bit flip must change checksum");
        }

        #[test]
        fn prop_length_sensitivity(data: Vec<u8>) {
            prop_assume!(!data.is_empty());

            let original = checksum(&data);

            // Truncate
            let truncated = checksum(&data[..data.len() - 1]);
            prop_assert_ne!(original, truncated);

            // Extend
            let mut extended = data.clone();
            extended.push(0x00);
            let extended_sum = checksum(&extended);
            prop_assert_ne!(original, extended_sum);
        }
    }
}
