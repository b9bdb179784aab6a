//! Shared signaling state
//!
//! All registries sit behind one `parking_lot::Mutex`. The lock is only held
//! for in-memory bookkeeping and never across an engine call or a channel send.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::SfuConfig;
use crate::resources::ResourceRegistry;
use crate::room::RoomRegistry;
use crate::session::{PeerChannel, SessionRegistry};
use crate::types::{PeerId, RoomName};

pub struct SignalState {
    pub rooms: RoomRegistry,
    pub sessions: SessionRegistry,
    pub resources: ResourceRegistry,
}

pub type SharedState = Arc<Mutex<SignalState>>;

impl SignalState {
    #[must_use]
    pub fn new(config: &SfuConfig) -> Self {
        Self {
            rooms: RoomRegistry::new(config.max_rooms, config.max_peers_per_room),
            sessions: SessionRegistry::new(),
            resources: ResourceRegistry::new(),
        }
    }

    #[must_use]
    pub fn shared(config: &SfuConfig) -> SharedState {
        Arc::new(Mutex::new(Self::new(config)))
    }

    /// Channels of every live member of `room` except `excluded`
    #[must_use]
    pub fn room_channels_except(&self, room: &RoomName, excluded: &PeerId) -> Vec<(PeerId, PeerChannel)> {
        self.rooms
            .members(room)
            .into_iter()
            .filter(|id| id != excluded)
            .filter_map(|id| {
                let channel = self.sessions.get(&id).ok()?.channel.clone();
                Some((id, channel))
            })
            .collect()
    }
}
