//! Voxel terrain subsystem: chunk keys, spatial storage, land service.
pub mod chunk;
pub mod chunk_key;
pub mod consts;
pub mod service;
pub mod state;
pub mod storage_tree;
pub mod ticket;
pub mod tree_path;

// Selective re-exports
pub use chunk::{BlockId, Chunk, ChunkAdjacency, PseudoChunkData, PseudoChunkSurface};
pub use chunk_key::ChunkKey;
pub use service::LandService;
pub use state::LandState;
pub use storage_tree::{StorageTree, TreeDataMut, TreeDataRef, TreePayload};
pub use ticket::{
    ChunkTicket, ChunkTicketArea, ChunkTicketBoxArea, ChunkTicketOctahedronArea,
    ChunkTicketRequestMessage,
};
