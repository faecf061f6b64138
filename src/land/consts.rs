//! World dimensions and terrain tunables.

use crate::core::Uid;

/// Blocks per chunk edge at LOD 0
pub const CHUNK_SIZE_BLOCKS: i32 = 32;
pub const CHUNK_VOLUME_BLOCKS: usize =
    (CHUNK_SIZE_BLOCKS * CHUNK_SIZE_BLOCKS * CHUNK_SIZE_BLOCKS) as usize;

pub const BLOCK_SIZE_METRES: f64 = 1.0;

pub const CHUNK_KEY_XZ_BITS: u32 = 24;
pub const CHUNK_KEY_Y_BITS: u32 = 8;
pub const CHUNK_KEY_SCALE_BITS: u32 = 3;

/// LOD scales 0..=7; even scales stop at duoctree levels directly, odd
/// scales are stored one duoctree level up through the sub-node selector
pub const NUM_LOD_SCALES: u32 = 1 << CHUNK_KEY_SCALE_BITS;

/// Root grid dimensions (X-major); the product must fit the single root
/// index byte of a tree path
pub const STORAGE_TREE_ROOT_ITEMS_X: u32 = 16;
pub const STORAGE_TREE_ROOT_ITEMS_Z: u32 = 16;

/// One root item spans a full tri-quadtree: 8 x 8 bridges of 8 x 8
/// duoctrees of 256 chunks
pub const STORAGE_TREE_ROOT_ITEM_SIZE_CHUNKS: u32 = 8 * 8 * 256;

pub const WORLD_X_SPAN_CHUNKS: i32 =
    (STORAGE_TREE_ROOT_ITEM_SIZE_CHUNKS * STORAGE_TREE_ROOT_ITEMS_X) as i32;
pub const WORLD_Z_SPAN_CHUNKS: i32 =
    (STORAGE_TREE_ROOT_ITEM_SIZE_CHUNKS * STORAGE_TREE_ROOT_ITEMS_Z) as i32;

/// X/Z wrap around toroidally; these bound the unique coordinate range
pub const MIN_UNIQUE_WORLD_X_CHUNK: i32 = -WORLD_X_SPAN_CHUNKS / 2;
pub const MAX_UNIQUE_WORLD_X_CHUNK: i32 = WORLD_X_SPAN_CHUNKS / 2 - 1;
pub const MIN_UNIQUE_WORLD_Z_CHUNK: i32 = -WORLD_Z_SPAN_CHUNKS / 2;
pub const MAX_UNIQUE_WORLD_Z_CHUNK: i32 = WORLD_Z_SPAN_CHUNKS / 2 - 1;

/// Y is clamped, not wrapped; the full range of the signed key field
pub const MIN_WORLD_Y_CHUNK: i32 = -(1 << (CHUNK_KEY_Y_BITS - 1));
pub const MAX_WORLD_Y_CHUNK: i32 = (1 << (CHUNK_KEY_Y_BITS - 1)) - 1;

pub const MAX_TICKET_BOX_AREA_SIZE: i32 = 24;
pub const MAX_TICKET_OCTA_AREA_RADIUS: u32 = 16;

/// LODs up to this are generated directly from the surface function;
/// larger ones are aggregated from child-LOD pseudo data
pub const MAX_DIRECT_GENERATE_LOD: u32 = NUM_LOD_SCALES - 3;

/// Shared sender identity for terrain jobs and ticket handles reporting
/// back to the land service
pub const LAND_SERVICE_SENDER_UID: Uid = Uid::parse("e242afb4-eb63b2c0-f82103c1-85324c1c");
