//! Chunk addressing at multiple LOD scales.

use glam::IVec3;

use super::consts as Consts;
use crate::core::TrieKey;
use crate::util::hash::xxh64_fixed;

/// Identifies a chunk at some LOD scale. `(x, y, z)` is the minimal
/// corner in chunk units, always aligned to the `1 << scale_log2` grid.
///
/// A chunk's world footprint is
/// `CHUNK_SIZE_BLOCKS * scale_multiplier()` blocks per edge.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ChunkKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub scale_log2: u32,
}

impl ChunkKey {
    pub fn new(base: IVec3, scale_log2: u32) -> Self {
        Self {
            x: base.x,
            y: base.y,
            z: base.z,
            scale_log2,
        }
    }

    pub fn new_lod0(base: IVec3) -> Self {
        Self::new(base, 0)
    }

    pub fn base(&self) -> IVec3 {
        IVec3::new(self.x, self.y, self.z)
    }

    pub fn scale_multiplier(&self) -> i32 {
        1 << self.scale_log2
    }

    /// Key of the containing chunk one LOD scale up
    pub fn parent_lod_key(&self) -> ChunkKey {
        let mask = !((1i32 << (self.scale_log2 + 1)) - 1);
        ChunkKey {
            x: self.x & mask,
            y: self.y & mask,
            z: self.z & mask,
            scale_log2: self.scale_log2 + 1,
        }
    }

    /// Packs into `x:24 | y:8 | z:24 | scale:3` bits. The packing is
    /// injective over in-range keys, which the hash contract relies on.
    pub fn packed(&self) -> u64 {
        debug_assert!(self.scale_log2 < Consts::NUM_LOD_SCALES);

        (self.x as u64 & 0xFF_FFFF)
            | ((self.y as u64 & 0xFF) << 24)
            | ((self.z as u64 & 0xFF_FFFF) << 32)
            | ((self.scale_log2 as u64) << 56)
    }

    pub fn from_packed(packed: u64) -> Self {
        // Sign-extend the coordinate fields
        let x = ((packed & 0xFF_FFFF) as i32) << 8 >> 8;
        let y = ((packed >> 24) & 0xFF) as i8 as i32;
        let z = (((packed >> 32) & 0xFF_FFFF) as i32) << 8 >> 8;
        let scale_log2 = ((packed >> 56) & 0x7) as u32;

        Self { x, y, z, scale_log2 }
    }
}

impl TrieKey for ChunkKey {
    fn hash64(&self) -> u64 {
        // Bijective mixer over an injective packing: collision-free
        xxh64_fixed(self.packed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanity() {
        let ck = ChunkKey::new(IVec3::new(8, 4, 2), 1);
        assert_eq!(ck.base(), IVec3::new(8, 4, 2));
        assert_eq!(ck.scale_log2, 1);
        assert_eq!(ck.scale_multiplier(), 2);

        let parent = ck.parent_lod_key();
        assert_eq!(parent.base(), IVec3::new(8, 4, 0));
        assert_eq!(parent.scale_log2, 2);

        let parent2 = parent.parent_lod_key();
        assert_eq!(parent2.base(), IVec3::new(8, 0, 0));
        assert_eq!(parent2.scale_log2, 3);

        assert_eq!(ChunkKey::from_packed(ck.packed()), ck);
        assert_eq!(ChunkKey::from_packed(parent.packed()), parent);
        assert_eq!(ChunkKey::from_packed(parent2.packed()), parent2);
    }

    #[test]
    fn test_negative_coordinates() {
        let ck = ChunkKey::new(IVec3::new(-8, -1, -3), 0);
        assert_eq!(ck.base(), IVec3::new(-8, -1, -3));

        let parent = ck.parent_lod_key();
        assert_eq!(parent.base(), IVec3::new(-8, -2, -4));
        assert_eq!(parent.scale_log2, 1);

        let parent2 = parent.parent_lod_key();
        assert_eq!(parent2.base(), IVec3::new(-8, -4, -4));
        assert_eq!(parent2.scale_log2, 2);

        assert_eq!(ChunkKey::from_packed(ck.packed()), ck);
        assert_eq!(ChunkKey::from_packed(parent.packed()), parent);
        assert_eq!(ChunkKey::from_packed(parent2.packed()), parent2);
    }

    #[test]
    fn test_packed_distinct() {
        let keys = [
            ChunkKey::new(IVec3::new(0, 0, 0), 0),
            ChunkKey::new(IVec3::new(1, 0, 0), 0),
            ChunkKey::new(IVec3::new(0, 1, 0), 0),
            ChunkKey::new(IVec3::new(0, 0, 1), 0),
            ChunkKey::new(IVec3::new(0, 0, 0), 1),
            ChunkKey::new(IVec3::new(-1, -1, -1), 0),
        ];

        let mut packed = std::collections::HashSet::new();
        let mut hashes = std::collections::HashSet::new();
        for key in keys {
            assert!(packed.insert(key.packed()));
            assert!(hashes.insert(key.hash64()));
        }
    }
}
