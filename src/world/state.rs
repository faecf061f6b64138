//! Player state and the published world snapshot.

use glam::{DQuat, DVec3};

use super::tick::TickId;
use crate::core::Uid;
use crate::land::LandState;
use crate::svc::Message;

#[derive(Clone, Copy, Debug)]
pub struct PlayerState {
    pub position: DVec3,
    pub orientation: DQuat,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            position: DVec3::ZERO,
            orientation: DQuat::IDENTITY,
        }
    }
}

impl PlayerState {
    pub fn update_state(&mut self, position: DVec3, orientation: DQuat) {
        self.position = position;
        self.orientation = orientation;
    }
}

/// Sent by the input layer to the sim thread once per input update.
#[derive(Clone, Copy, Debug)]
pub struct PlayerStateMessage {
    pub player_position: DVec3,
    pub player_orientation: DQuat,
    /// When set, chunk loading keeps its previous anchor point instead
    /// of following the player
    pub lock_chunk_loading_position: bool,
}

impl Message for PlayerStateMessage {
    const MESSAGE_UID: Uid = Uid::parse("92e3a5bf-0dc41788-61b20c3e-559cfa01");
}

/// Immutable world snapshot published by the sim thread each tick.
/// Readers obtain a consistent view for the snapshot's whole lifetime.
#[derive(Clone, Default)]
pub struct WorldState {
    pub tick_id: TickId,
    pub player: PlayerState,
    pub land: LandState,
}
