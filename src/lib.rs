//! Voxel engine concurrency and world-state core

// Core systems
pub mod core;
pub mod engine;
pub mod land;
pub mod svc;
pub mod util;
pub mod world;

pub use engine::{Engine, EngineConfig};

/// Engine prelude
pub mod prelude {
    pub use crate::core::{Uid, UidRegistry, VersionedHashTrie};
    pub use crate::engine::{Engine, EngineConfig};
    pub use crate::land::{ChunkKey, LandService, LandState, StorageTree};
    pub use crate::svc::{
        Message, MessageQueue, MessagingService, ServiceLocator, TaskBuilder, TaskService,
    };
    pub use crate::world::{TickId, WorldControlService, WorldState};
}

/// Current engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
