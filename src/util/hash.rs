//! Fixed-width hashing helpers.

const PRIME64_1: u64 = 0x9E3779B185EBCA87;
const PRIME64_2: u64 = 0xC2B2AE3D27D4EB4F;
const PRIME64_3: u64 = 0x165667B19E3779F9;
const PRIME64_4: u64 = 0x85EBCA77C2B2AE63;
const PRIME64_5: u64 = 0x27D4EB2F165667C5;

/// Hashes a single 64-bit value, producing the same result as reference
/// XXH64 (seed 0) over its 8 little-endian bytes.
///
/// This function is a bijection over `u64`, so distinct inputs are
/// guaranteed to produce distinct outputs. Callers relying on
/// collision-free hashing (trie keys, queue selection) depend on that.
pub const fn xxh64_fixed(value: u64) -> u64 {
    let mut h = PRIME64_5.wrapping_add(8);

    let k = value
        .wrapping_mul(PRIME64_2)
        .rotate_left(31)
        .wrapping_mul(PRIME64_1);
    h ^= k;
    h = h.rotate_left(27).wrapping_mul(PRIME64_1).wrapping_add(PRIME64_4);

    h ^= h >> 33;
    h = h.wrapping_mul(PRIME64_2);
    h ^= h >> 29;
    h = h.wrapping_mul(PRIME64_3);
    h ^= h >> 32;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vectors() {
        // Values from the reference XXH64 implementation with seed 0
        assert_eq!(xxh64_fixed(0), 0x34C96ACDCADB1BBB);

        assert_eq!(xxh64_fixed(0xC20369A413E28FC1), 0xE887D97F3EFE7B44);
        assert_eq!(xxh64_fixed(0xC722205F1C53D89F), 0x68BEC6640212567D);
        assert_eq!(xxh64_fixed(0x146AEAC22CD734F6), 0xECFBB0C2A1E3E878);
        assert_eq!(xxh64_fixed(0x33AF2950D2E525EC), 0x03760006CA050043);
        assert_eq!(xxh64_fixed(0x50745822FA9B4673), 0x199F8B0904FA343A);
    }

    #[test]
    fn test_distinct_inputs_distinct_outputs() {
        // The mixer is invertible, nearby inputs must never collide
        let mut seen = std::collections::HashSet::new();
        for i in 0..10_000u64 {
            assert!(seen.insert(xxh64_fixed(i)));
        }
    }
}
