//! Simulation loop and world-state snapshots.
pub mod control;
pub mod sim_thread;
pub mod state;
pub mod tick;

// Selective re-exports
pub use control::{SaveRequest, StartRequest, WorldControlService};
pub use sim_thread::{SimConfig, SimThread};
pub use state::{PlayerState, PlayerStateMessage, WorldState};
pub use tick::TickId;
