//! Chunk key to storage tree path conversion.
//!
//! A tree path linearizes a [`ChunkKey`] into a u64 traversable one byte
//! at a time, root-first:
//!
//! ```text
//!                          Root   TriQRoot  Bridge    x256      x64      x16      x4       x1
//!                        ######## ~~XZXZXZ ~YXZXZXZ SNYXZYXZ SNYXZYXZ SNYXZYXZ SNYXZYXZ S~~~~YXZ
//! ```
//!
//! `#` root grid index, `S` stop bit (descent terminates at this level),
//! `N` sub-node bit (set when the key's scale is odd, making the lowest
//! three path bits a YXZ sub-node selector), `X/Y/Z` child index bits in
//! per-level Morton order. X and Z wrap toroidally around the world
//! span; the decomposition is invertible up to that wrap.

use glam::IVec3;

use super::chunk_key::ChunkKey;
use super::consts as Consts;
use crate::util::bits::{deposit_bits, extract_bits};

pub(crate) const XMASK: u64 =
    0b00000000_00101010_00101010_00010010_00010010_00010010_00010010_00000000;
pub(crate) const YMASK: u64 =
    0b00000000_00000000_01000000_00100100_00100100_00100100_00100100_00000000;
pub(crate) const ZMASK: u64 =
    0b00000000_00010101_00010101_00001001_00001001_00001001_00001001_00000000;

// Bit of the bridge byte holding the Y sign, as seen after gathering
// through YMASK
const Y_SIGN_BIT: u64 = 1 << 8;
const Y_SIGN_FILL_MASK: u64 = !((Y_SIGN_BIT << 1) - 1);

/// Minimal coordinate corner of one root grid item
pub fn root_item_min_coord(index: u32) -> IVec3 {
    let rsz = Consts::STORAGE_TREE_ROOT_ITEM_SIZE_CHUNKS;
    let min_x_unshifted = index / Consts::STORAGE_TREE_ROOT_ITEMS_Z * rsz;
    let min_z_unshifted = index % Consts::STORAGE_TREE_ROOT_ITEMS_Z * rsz;

    IVec3::new(
        min_x_unshifted as i32 + Consts::MIN_UNIQUE_WORLD_X_CHUNK,
        Consts::MIN_WORLD_Y_CHUNK,
        min_z_unshifted as i32 + Consts::MIN_UNIQUE_WORLD_Z_CHUNK,
    )
}

/// Encodes a chunk key, validating it along the way. Rejects keys out of
/// Y bounds, with a too-large scale, or misaligned to their LOD grid.
pub fn key_to_tree_path(key: ChunkKey) -> Option<u64> {
    let ChunkKey { x, y, z, scale_log2 } = key;

    if y < Consts::MIN_WORLD_Y_CHUNK || y > Consts::MAX_WORLD_Y_CHUNK {
        return None;
    }

    if scale_log2 >= Consts::NUM_LOD_SCALES {
        return None;
    }

    if (x | y | z) & ((1 << scale_log2) - 1) != 0 {
        // At least one dimension not aligned to the power-of-two grid
        return None;
    }

    // Wrap X/Z around to create torus topology. The origin shift by
    // half a span keeps the unique range centered on zero; the shift is
    // a multiple of the root item size, so the in-item offset bits of
    // the raw coordinate stay valid.
    let world_x = Consts::WORLD_X_SPAN_CHUNKS;
    let world_z = Consts::WORLD_Z_SPAN_CHUNKS;
    let rsz = Consts::STORAGE_TREE_ROOT_ITEM_SIZE_CHUNKS as i32;

    let x_wrapped = (x + world_x / 2) % world_x;
    let z_wrapped = (z + world_z / 2) % world_z;

    let x_root = (if x_wrapped < 0 { x_wrapped + world_x } else { x_wrapped } / rsz) as u64;
    let z_root = (if z_wrapped < 0 { z_wrapped + world_z } else { z_wrapped } / rsz) as u64;
    let root_selector = (x_root * Consts::STORAGE_TREE_ROOT_ITEMS_Z as u64 + z_root) << 56;

    // The stop bit goes into the byte of the duoctree (or chunk) level
    // this scale terminates at; odd scales add the sub-node bit
    let stop_subnode_shift = 8 * ((scale_log2 + 1) / 2) + 6;
    let stop_subnode_bits = (2u64 | (scale_log2 & 1) as u64) << stop_subnode_shift;

    // YXZ sub-node selector from the coordinate bits at the scale position
    let snx = ((x >> scale_log2) & 1) as u64;
    let sny = ((y >> scale_log2) & 1) as u64;
    let snz = ((z >> scale_log2) & 1) as u64;
    let subnode_selector = (sny << 2) | (snx << 1) | snz;

    Some(
        subnode_selector
            | stop_subnode_bits
            | root_selector
            | deposit_bits(x as u64, XMASK)
            | deposit_bits(y as u64, YMASK)
            | deposit_bits(z as u64, ZMASK),
    )
}

/// Recovers the (wrapped) chunk key from a tree path
pub fn tree_path_to_key(tree_path: u64) -> ChunkKey {
    // X/Z mean offsets from the minimal corner of the root item
    let x = extract_bits(tree_path, XMASK);
    let mut y = extract_bits(tree_path, YMASK);
    let z = extract_bits(tree_path, ZMASK);

    if y & Y_SIGN_BIT != 0 {
        // Restore a proper two's complement negative value
        y |= Y_SIGN_FILL_MASK;
    }

    let root_index = (tree_path >> 56) as u32;
    let mut coord = root_item_min_coord(root_index);

    coord.x += x as i32;
    coord.y = y as i32; // Not an offset, overwrite
    coord.z += z as i32;

    // Find the LOD scale by walking duoctree stop bits, coarse last
    for lod in (2..=Consts::NUM_LOD_SCALES).step_by(2) {
        let stop_bit = 128u64 << (8 * lod / 2);
        let subnode_bit = 64u64 << (8 * lod / 2);

        if tree_path & stop_bit != 0 {
            let lod = if tree_path & subnode_bit != 0 {
                // Odd scale stored one duoctree level up
                lod - 1
            } else {
                lod
            };
            return ChunkKey::new(coord, lod);
        }
    }

    // The path goes all the way down to a chunk
    ChunkKey::new(coord, 0)
}

// Traversal helpers used by the storage tree

pub(crate) fn path_component(tree_path: u64, byte: u32) -> u64 {
    (tree_path >> (8 * byte)) & 0xFF
}

pub(crate) fn component_child_bit(component: u64) -> u64 {
    1u64 << (component & 63)
}

pub(crate) fn component_stop_bit(component: u64) -> bool {
    component & 128 != 0
}

pub(crate) fn component_y_negative(component: u64) -> bool {
    component & 64 != 0
}

/// Live-key mask bit for a stop-level entry: bits 0..=7 for odd-scale
/// sub-node entries, bit 8 for the even-scale direct entry
pub(crate) fn component_key_mask_bit(tree_path: u64, component: u64) -> u32 {
    if component & 64 != 0 {
        1u32 << (tree_path & 7)
    } else {
        1u32 << 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn wrap_x_eq(a: i64, b: i64) -> bool {
        let modulus = Consts::WORLD_X_SPAN_CHUNKS as i64;
        let add = modulus / 2 + modulus * 10;
        (a + add) % modulus == (b + add) % modulus
    }

    fn wrap_z_eq(a: i64, b: i64) -> bool {
        let modulus = Consts::WORLD_Z_SPAN_CHUNKS as i64;
        let add = modulus / 2 + modulus * 10;
        (a + add) % modulus == (b + add) % modulus
    }

    fn check_roundtrip(x: i32, y: i32, z: i32, scale_log2: u32) {
        let key = ChunkKey { x, y, z, scale_log2 };

        let path = key_to_tree_path(key)
            .unwrap_or_else(|| panic!("key {key:?} must convert to a tree path"));
        let restored = tree_path_to_key(path);

        assert_eq!(key.scale_log2, restored.scale_log2, "{key:?} vs {restored:?}");
        assert_eq!(key.y, restored.y, "{key:?} vs {restored:?}");
        assert!(wrap_x_eq(key.x as i64, restored.x as i64), "{key:?} vs {restored:?}");
        assert!(wrap_z_eq(key.z as i64, restored.z as i64), "{key:?} vs {restored:?}");
    }

    #[test]
    fn test_random_roundtrip() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0xDEADBEEF);

        for _ in 0..25_000 {
            let scale = rng.gen_range(0..Consts::NUM_LOD_SCALES);
            // Masking aligns to the scale grid, works on negatives too
            let mask = !((1u32 << scale) - 1) as i32;

            // Stress X/Z wraparound with 4x out-of-range coordinates
            let x = rng.gen_range(Consts::MIN_UNIQUE_WORLD_X_CHUNK * 4..=Consts::MAX_UNIQUE_WORLD_X_CHUNK * 4) & mask;
            let y = rng.gen_range(Consts::MIN_WORLD_Y_CHUNK..=Consts::MAX_WORLD_Y_CHUNK) & mask;
            let z = rng.gen_range(Consts::MIN_UNIQUE_WORLD_Z_CHUNK * 4..=Consts::MAX_UNIQUE_WORLD_Z_CHUNK * 4) & mask;

            check_roundtrip(x, y, z, scale);
        }
    }

    #[test]
    fn test_select_roundtrip() {
        check_roundtrip(0, 0, 0, 0);
        check_roundtrip(0, 1, 0, 0);
        check_roundtrip(0, 1, -1, 0);
        check_roundtrip(-1, 0, 0, 0);

        check_roundtrip(-2, 0, 0, 1);
        check_roundtrip(-4, 0, 0, 1);
        check_roundtrip(-4, 0, 0, 2);

        for lod in 0..Consts::NUM_LOD_SCALES {
            check_roundtrip(
                Consts::MIN_UNIQUE_WORLD_X_CHUNK,
                Consts::MIN_WORLD_Y_CHUNK,
                Consts::MIN_UNIQUE_WORLD_Z_CHUNK,
                lod,
            );
            check_roundtrip(0, Consts::MIN_WORLD_Y_CHUNK, Consts::MIN_UNIQUE_WORLD_Z_CHUNK, lod);
            check_roundtrip(Consts::MIN_UNIQUE_WORLD_X_CHUNK, Consts::MIN_WORLD_Y_CHUNK, 0, lod);

            check_roundtrip(
                Consts::MAX_UNIQUE_WORLD_X_CHUNK + 1,
                0,
                Consts::MAX_UNIQUE_WORLD_Z_CHUNK + 1,
                lod,
            );
            check_roundtrip(0, 0, Consts::MAX_UNIQUE_WORLD_Z_CHUNK + 1, lod);
            check_roundtrip(Consts::MAX_UNIQUE_WORLD_X_CHUNK + 1, 0, 0, lod);
        }

        check_roundtrip((Consts::MAX_UNIQUE_WORLD_X_CHUNK + 1) * 2, 0, 0, 6);
        check_roundtrip(Consts::MIN_UNIQUE_WORLD_X_CHUNK * 2, 0, 0, 6);
        check_roundtrip(0, 0, (Consts::MAX_UNIQUE_WORLD_Z_CHUNK + 1) * 2, 6);
        check_roundtrip(0, 0, Consts::MIN_UNIQUE_WORLD_Z_CHUNK * 2, 6);
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let check = |x: i32, y: i32, z: i32, lod: u32| {
            assert!(key_to_tree_path(ChunkKey { x, y, z, scale_log2: lod }).is_none());
        };

        // Out of height bounds
        check(0, Consts::MAX_WORLD_Y_CHUNK + 1, 0, 0);
        check(0, Consts::MAX_WORLD_Y_CHUNK * 2, 0, 0);
        check(0, Consts::MIN_WORLD_Y_CHUNK - 1, 0, 0);
        check(0, Consts::MIN_WORLD_Y_CHUNK * 2, 0, 0);

        // Too large scale
        check(0, 0, 0, Consts::NUM_LOD_SCALES);
        check(0, 0, 0, Consts::NUM_LOD_SCALES + 1);
        check(Consts::MAX_UNIQUE_WORLD_X_CHUNK + 100, 0, 0, Consts::NUM_LOD_SCALES);

        // Misaligned to the power-of-two grid
        check(0, 0, 1, 1);
        check(0, -1, 0, 1);
        check(-1, 0, 0, 1);
        check(-4, -4, -4, 4);
        check(13, 0, 0, 3);
    }

    #[test]
    fn test_distinct_keys_distinct_paths() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0xF00D);
        let mut paths = std::collections::HashMap::new();

        for _ in 0..10_000 {
            let scale = rng.gen_range(0..Consts::NUM_LOD_SCALES);
            let mask = !((1u32 << scale) - 1) as i32;

            let key = ChunkKey {
                x: rng.gen_range(Consts::MIN_UNIQUE_WORLD_X_CHUNK..=Consts::MAX_UNIQUE_WORLD_X_CHUNK) & mask,
                y: rng.gen_range(Consts::MIN_WORLD_Y_CHUNK..=Consts::MAX_WORLD_Y_CHUNK) & mask,
                z: rng.gen_range(Consts::MIN_UNIQUE_WORLD_Z_CHUNK..=Consts::MAX_UNIQUE_WORLD_Z_CHUNK) & mask,
                scale_log2: scale,
            };

            let path = key_to_tree_path(key).unwrap();
            if let Some(prev) = paths.insert(path, key) {
                assert_eq!(prev, key, "distinct keys {prev:?} and {key:?} collided");
            }
        }
    }
}
