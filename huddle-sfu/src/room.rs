//! Room registry
//!
//! A room owns exactly one engine router and the set of joined peer ids. Rooms
//! are created lazily by the first JOIN and reused by every later one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::engine::{Router, RtpCapabilities};
use crate::error::{Result, SignalError};
use crate::types::{PeerId, RoomName};

pub struct Room {
    pub name: RoomName,
    pub router: Arc<dyn Router>,
    pub peer_ids: HashSet<PeerId>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("router_id", self.router.id())
            .field("peer_ids", &self.peer_ids)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomName, Room>,
    /// 0 = unlimited
    max_rooms: usize,
    /// 0 = unlimited
    max_peers_per_room: usize,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(max_rooms: usize, max_peers_per_room: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            max_rooms,
            max_peers_per_room,
        }
    }

    /// Attach a peer to an existing room, returning its router.
    /// `None` means the room does not exist yet.
    pub fn try_attach(&mut self, name: &RoomName, peer_id: &PeerId) -> Result<Option<Arc<dyn Router>>> {
        let Some(room) = self.rooms.get_mut(name) else {
            return Ok(None);
        };
        Self::add_member(room, peer_id, self.max_peers_per_room)?;
        Ok(Some(Arc::clone(&room.router)))
    }

    /// Check the room limit before allocating a router for a new room
    pub fn ensure_room_capacity(&self) -> Result<()> {
        if self.max_rooms > 0 && self.rooms.len() >= self.max_rooms {
            return Err(SignalError::CapacityExceeded(format!(
                "room limit of {} reached",
                self.max_rooms
            )));
        }
        Ok(())
    }

    /// Insert a room with a freshly created router, or attach to the room a
    /// concurrent JOIN created first. Returns the router now serving the room
    /// and whether `router` was used.
    pub fn attach_or_create(
        &mut self,
        name: &RoomName,
        peer_id: &PeerId,
        router: Arc<dyn Router>,
    ) -> Result<(Arc<dyn Router>, bool)> {
        if let Some(existing) = self.try_attach(name, peer_id)? {
            return Ok((existing, false));
        }
        self.ensure_room_capacity()?;

        let mut room = Room {
            name: name.clone(),
            router: Arc::clone(&router),
            peer_ids: HashSet::new(),
        };
        room.peer_ids.insert(peer_id.clone());
        self.rooms.insert(name.clone(), room);
        Ok((router, true))
    }

    fn add_member(room: &mut Room, peer_id: &PeerId, max_peers: usize) -> Result<()> {
        if room.peer_ids.contains(peer_id) {
            return Ok(());
        }
        if max_peers > 0 && room.peer_ids.len() >= max_peers {
            return Err(SignalError::CapacityExceeded(format!(
                "room {} is full ({max_peers} peers)",
                room.name
            )));
        }
        room.peer_ids.insert(peer_id.clone());
        Ok(())
    }

    /// Remove a peer from a room's membership.
    ///
    /// With `close_empty`, a room left without members is deleted and its
    /// router is returned so the caller can close it outside the lock.
    pub fn leave(&mut self, name: &RoomName, peer_id: &PeerId, close_empty: bool) -> Option<Arc<dyn Router>> {
        let room = self.rooms.get_mut(name)?;
        room.peer_ids.remove(peer_id);
        if close_empty && room.peer_ids.is_empty() {
            return self.rooms.remove(name).map(|room| room.router);
        }
        None
    }

    pub fn capabilities_of(&self, name: &RoomName) -> Result<RtpCapabilities> {
        Ok(self.get(name)?.router.rtp_capabilities().clone())
    }

    pub fn router_of(&self, name: &RoomName) -> Result<Arc<dyn Router>> {
        Ok(Arc::clone(&self.get(name)?.router))
    }

    pub fn get(&self, name: &RoomName) -> Result<&Room> {
        self.rooms
            .get(name)
            .ok_or_else(|| SignalError::NotFound(format!("room {name}")))
    }

    /// Snapshot of a room's membership; empty for unknown rooms
    #[must_use]
    pub fn members(&self, name: &RoomName) -> Vec<PeerId> {
        self.rooms
            .get(name)
            .map(|room| room.peer_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove every room, handing back the routers to close
    pub fn drain(&mut self) -> Vec<Arc<dyn Router>> {
        self.rooms.drain().map(|(_, room)| room.router).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, LoopbackEngine, MediaEngine};

    async fn router() -> Arc<dyn Router> {
        LoopbackEngine::new(EngineConfig::default())
            .create_router()
            .await
            .unwrap()
    }

    fn room(name: &str) -> RoomName {
        RoomName::parse(name).unwrap()
    }

    #[tokio::test]
    async fn test_join_reuses_router() {
        let mut registry = RoomRegistry::new(0, 0);
        let r1 = room("r1");
        let a = PeerId::from("a");
        let b = PeerId::from("b");

        assert!(registry.try_attach(&r1, &a).unwrap().is_none());
        let (first, created) = registry.attach_or_create(&r1, &a, router().await).unwrap();
        assert!(created);

        let second = registry.try_attach(&r1, &b).unwrap().unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(registry.members(&r1).len(), 2);
        assert_eq!(
            registry.capabilities_of(&r1).unwrap(),
            first.rtp_capabilities().clone()
        );
    }

    #[tokio::test]
    async fn test_concurrent_create_keeps_first_router() {
        let mut registry = RoomRegistry::new(0, 0);
        let r1 = room("r1");

        let (winner, _) = registry
            .attach_or_create(&r1, &PeerId::from("a"), router().await)
            .unwrap();
        let (active, created) = registry
            .attach_or_create(&r1, &PeerId::from("b"), router().await)
            .unwrap();
        assert!(!created);
        assert_eq!(active.id(), winner.id());
    }

    #[tokio::test]
    async fn test_capacity_limits() {
        let mut registry = RoomRegistry::new(1, 1);
        registry
            .attach_or_create(&room("r1"), &PeerId::from("a"), router().await)
            .unwrap();

        assert!(matches!(
            registry.try_attach(&room("r1"), &PeerId::from("b")),
            Err(SignalError::CapacityExceeded(_))
        ));
        assert!(matches!(
            registry.attach_or_create(&room("r2"), &PeerId::from("c"), router().await),
            Err(SignalError::CapacityExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_leave_policy() {
        let mut registry = RoomRegistry::new(0, 0);
        let r1 = room("r1");
        let a = PeerId::from("a");
        registry.attach_or_create(&r1, &a, router().await).unwrap();

        assert!(registry.leave(&r1, &a, false).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.members(&r1).is_empty());

        registry.try_attach(&r1, &a).unwrap();
        assert!(registry.leave(&r1, &a, true).is_some());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.capabilities_of(&r1),
            Err(SignalError::NotFound(_))
        ));
    }
}
