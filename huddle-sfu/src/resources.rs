//! Transport, producer and consumer registries
//!
//! Each resource is keyed by its own id and tagged with the owning peer and
//! room. Secondary indexes keep per-room producer listing and per-producer
//! cascades proportional to the affected set rather than the whole server.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::{Consumer, Producer, WebRtcTransport};
use crate::error::{Result, SignalError};
use crate::types::{
    ConsumerId, MediaKind, PeerId, ProducerId, RoomName, TransportDirection, TransportId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Allocated, waiting for DTLS parameters
    New,
    /// Engine connect call in flight
    Connecting,
    Connected,
}

pub struct TransportRecord {
    pub id: TransportId,
    pub peer_id: PeerId,
    pub room: RoomName,
    pub direction: TransportDirection,
    pub state: TransportState,
    /// Recv transports are bound to the remote producer they carry
    pub remote_producer_id: Option<ProducerId>,
    pub consumer_id: Option<ConsumerId>,
    /// A CONSUME on this transport is in flight
    pub consumer_pending: bool,
    pub handle: Arc<dyn WebRtcTransport>,
}

pub struct ProducerRecord {
    pub id: ProducerId,
    pub peer_id: PeerId,
    pub room: RoomName,
    pub kind: MediaKind,
    pub transport_id: TransportId,
    pub handle: Arc<dyn Producer>,
}

pub struct ConsumerRecord {
    pub id: ConsumerId,
    pub peer_id: PeerId,
    pub room: RoomName,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub paused: bool,
    pub handle: Arc<dyn Consumer>,
}

#[derive(Default)]
pub struct ResourceRegistry {
    transports: HashMap<TransportId, TransportRecord>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,

    send_transports: HashMap<PeerId, TransportId>,
    /// Producers per room, in creation order
    producers_by_room: HashMap<RoomName, Vec<ProducerId>>,
    recv_transports_by_producer: HashMap<ProducerId, Vec<TransportId>>,
    consumers_by_producer: HashMap<ProducerId, Vec<ConsumerId>>,
}

fn unindex<K, V>(index: &mut HashMap<K, Vec<V>>, key: &K, value: &V)
where
    K: std::hash::Hash + Eq,
    V: PartialEq,
{
    if let Some(values) = index.get_mut(key) {
        values.retain(|v| v != value);
        if values.is_empty() {
            index.remove(key);
        }
    }
}

impl ResourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // Transports

    pub fn insert_transport(&mut self, record: TransportRecord) {
        match record.direction {
            TransportDirection::Send => {
                self.send_transports
                    .insert(record.peer_id.clone(), record.id.clone());
            }
            TransportDirection::Recv => {
                if let Some(producer_id) = &record.remote_producer_id {
                    self.recv_transports_by_producer
                        .entry(producer_id.clone())
                        .or_default()
                        .push(record.id.clone());
                }
            }
        }
        self.transports.insert(record.id.clone(), record);
    }

    #[must_use]
    pub fn send_transport_id(&self, peer_id: &PeerId) -> Option<&TransportId> {
        self.send_transports.get(peer_id)
    }

    /// Look up a transport owned by `peer_id`; foreign transports are `NotFound`
    pub fn transport_owned(&self, id: &TransportId, peer_id: &PeerId) -> Result<&TransportRecord> {
        self.transports
            .get(id)
            .filter(|t| &t.peer_id == peer_id)
            .ok_or_else(|| SignalError::NotFound(format!("transport {id}")))
    }

    pub fn transport_owned_mut(
        &mut self,
        id: &TransportId,
        peer_id: &PeerId,
    ) -> Result<&mut TransportRecord> {
        self.transports
            .get_mut(id)
            .filter(|t| &t.peer_id == peer_id)
            .ok_or_else(|| SignalError::NotFound(format!("transport {id}")))
    }

    pub fn remove_transport(&mut self, id: &TransportId) -> Option<TransportRecord> {
        let record = self.transports.remove(id)?;
        match record.direction {
            TransportDirection::Send => {
                if self.send_transports.get(&record.peer_id) == Some(id) {
                    self.send_transports.remove(&record.peer_id);
                }
            }
            TransportDirection::Recv => {
                if let Some(producer_id) = &record.remote_producer_id {
                    unindex(&mut self.recv_transports_by_producer, producer_id, id);
                }
            }
        }
        Some(record)
    }

    /// Recv transports bound to a producer
    #[must_use]
    pub fn recv_transports_for(&self, producer_id: &ProducerId) -> Vec<TransportId> {
        self.recv_transports_by_producer
            .get(producer_id)
            .cloned()
            .unwrap_or_default()
    }

    // Producers

    pub fn insert_producer(&mut self, record: ProducerRecord) {
        self.producers_by_room
            .entry(record.room.clone())
            .or_default()
            .push(record.id.clone());
        self.producers.insert(record.id.clone(), record);
    }

    /// Look up a producer in a specific room; other rooms' producers are `NotFound`
    pub fn producer_in_room(&self, id: &ProducerId, room: &RoomName) -> Result<&ProducerRecord> {
        self.producers
            .get(id)
            .filter(|p| &p.room == room)
            .ok_or_else(|| SignalError::NotFound(format!("producer {id} in room {room}")))
    }

    /// Producer ids in `room` not owned by `peer_id`, in creation order
    #[must_use]
    pub fn producer_ids_in_room_except(&self, room: &RoomName, peer_id: &PeerId) -> Vec<ProducerId> {
        self.producers_by_room
            .get(room)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        self.producers
                            .get(*id)
                            .is_some_and(|p| &p.peer_id != peer_id)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_other_producer(&self, room: &RoomName, peer_id: &PeerId) -> bool {
        self.producers_by_room.get(room).is_some_and(|ids| {
            ids.iter().any(|id| {
                self.producers
                    .get(id)
                    .is_some_and(|p| &p.peer_id != peer_id)
            })
        })
    }

    pub fn remove_producer(&mut self, id: &ProducerId) -> Option<ProducerRecord> {
        let record = self.producers.remove(id)?;
        unindex(&mut self.producers_by_room, &record.room, id);
        Some(record)
    }

    // Consumers

    pub fn insert_consumer(&mut self, record: ConsumerRecord) {
        self.consumers_by_producer
            .entry(record.producer_id.clone())
            .or_default()
            .push(record.id.clone());
        self.consumers.insert(record.id.clone(), record);
    }

    /// Look up a consumer owned by `peer_id`; foreign consumers are `NotFound`
    pub fn consumer_owned_mut(
        &mut self,
        id: &ConsumerId,
        peer_id: &PeerId,
    ) -> Result<&mut ConsumerRecord> {
        self.consumers
            .get_mut(id)
            .filter(|c| &c.peer_id == peer_id)
            .ok_or_else(|| SignalError::NotFound(format!("consumer {id}")))
    }

    #[must_use]
    pub fn consumers_of_producer(&self, producer_id: &ProducerId) -> Vec<ConsumerId> {
        self.consumers_by_producer
            .get(producer_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove_consumer(&mut self, id: &ConsumerId) -> Option<ConsumerRecord> {
        let record = self.consumers.remove(id)?;
        unindex(&mut self.consumers_by_producer, &record.producer_id, id);
        Some(record)
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}
