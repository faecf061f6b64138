//! Published land state: versioned tables plus the residency index.

use crate::core::VersionedHashTrie;
use crate::world::TickId;

use super::chunk::{Chunk, PseudoChunkData, PseudoChunkSurface};
use super::chunk_key::ChunkKey;
use super::storage_tree::{StorageTree, TreePayload};

/// Raw block data per chunk key. A present key with no value records a
/// chunk known to be empty.
pub type ChunkTable = VersionedHashTrie<ChunkKey, Chunk>;
/// Aggregated LOD data per chunk key
pub type PseudoChunkDataTable = VersionedHashTrie<ChunkKey, PseudoChunkData>;
/// Impostor geometry per chunk key, consumed by the renderer
pub type PseudoChunkSurfaceTable = VersionedHashTrie<ChunkKey, PseudoChunkSurface>;

/// Chunk-level residency record in the spatial index
#[derive(Clone, Copy, Debug)]
pub struct ChunkResidency {
    pub loaded_tick: TickId,
}

impl Default for ChunkResidency {
    fn default() -> Self {
        Self {
            loaded_tick: TickId::INVALID,
        }
    }
}

/// Aggregate-level residency record in the spatial index
#[derive(Clone, Copy, Debug)]
pub struct AggregateResidency {
    pub refreshed_tick: TickId,
}

impl Default for AggregateResidency {
    fn default() -> Self {
        Self {
            refreshed_tick: TickId::INVALID,
        }
    }
}

pub struct ResidencyPayload;

impl TreePayload for ResidencyPayload {
    type Chunk = ChunkResidency;
    type Agg = AggregateResidency;
}

/// Spatial index of loaded keys, walkable in tree order for external
/// serialization
pub type ResidencyTree = StorageTree<ResidencyPayload>;

/// All land data published to snapshot readers. Cloning is cheap; the
/// tables and the tree share unmodified subtrees across snapshots.
#[derive(Clone, Default)]
pub struct LandState {
    pub chunk_table: ChunkTable,
    pub pseudo_chunk_data_table: PseudoChunkDataTable,
    pub pseudo_chunk_surface_table: PseudoChunkSurfaceTable,
    pub residency_tree: ResidencyTree,
}
