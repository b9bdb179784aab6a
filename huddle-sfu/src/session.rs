//! Per-connection session records

use nanoid::nanoid;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{Result, SignalError};
use crate::protocol::OutboundEnvelope;
use crate::types::{ConsumerId, PeerId, ProducerId, RoomName, TransportId};

/// Assigns each inbound connection a unique peer id
#[derive(Debug, Default)]
pub struct IdentityIssuer {
    issued: AtomicU64,
}

impl IdentityIssuer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> PeerId {
        self.issued.fetch_add(1, Ordering::Relaxed);
        PeerId::new(nanoid!(12))
    }

    #[must_use]
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

/// Result of a non-blocking delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The outbound queue is full; the message was not queued
    Full,
    /// The connection is gone
    Closed,
}

/// Opaque handle to a connection's outbound queue
#[derive(Debug, Clone)]
pub struct PeerChannel {
    tx: mpsc::Sender<OutboundEnvelope>,
}

impl PeerChannel {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<OutboundEnvelope>) -> Self {
        Self { tx }
    }

    /// Create a bounded channel pair for one connection
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<OutboundEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Deliver without waiting on a slow reader
    pub fn deliver(&self, envelope: OutboundEnvelope) -> DeliveryOutcome {
        match self.tx.try_send(envelope) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(TrySendError::Full(_)) => DeliveryOutcome::Full,
            Err(TrySendError::Closed(_)) => DeliveryOutcome::Closed,
        }
    }

    /// Deliver, waiting for queue space. Used for replies to the peer's own requests.
    pub async fn send(&self, envelope: OutboundEnvelope) -> DeliveryOutcome {
        match self.tx.send(envelope).await {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(_) => DeliveryOutcome::Closed,
        }
    }
}

/// Signaling state of one connection
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub room: Option<RoomName>,
    pub channel: PeerChannel,
    pub display_name: String,
    pub is_admin: bool,
    pub transport_ids: Vec<TransportId>,
    pub producer_ids: Vec<ProducerId>,
    pub consumer_ids: Vec<ConsumerId>,
    /// Remote producers with a recv negotiation in flight or established
    pub consuming: HashSet<ProducerId>,
    /// A send transport is being allocated
    pub send_transport_pending: bool,
}

impl Peer {
    fn new(id: PeerId, channel: PeerChannel) -> Self {
        Self {
            display_name: id.to_string(),
            id,
            room: None,
            channel,
            is_admin: false,
            transport_ids: Vec::new(),
            producer_ids: Vec::new(),
            consumer_ids: Vec::new(),
            consuming: HashSet::new(),
            send_transport_pending: false,
        }
    }
}

/// Everything a removed peer owned
#[derive(Debug, Default)]
pub struct OwnedResources {
    pub room: Option<RoomName>,
    pub transport_ids: Vec<TransportId>,
    pub producer_ids: Vec<ProducerId>,
    pub consumer_ids: Vec<ConsumerId>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    peers: HashMap<PeerId, Peer>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, peer_id: PeerId, channel: PeerChannel) -> Result<()> {
        if self.peers.contains_key(&peer_id) {
            return Err(SignalError::InvalidState(format!(
                "peer {peer_id} is already registered"
            )));
        }
        self.peers
            .insert(peer_id.clone(), Peer::new(peer_id, channel));
        Ok(())
    }

    pub fn assign_room(
        &mut self,
        peer_id: &PeerId,
        room: RoomName,
        display_name: Option<String>,
        is_admin: bool,
    ) -> Result<()> {
        let peer = self.get_mut(peer_id)?;
        if let Some(current) = &peer.room {
            return Err(SignalError::AlreadyJoined(current.to_string()));
        }
        peer.room = Some(room);
        peer.is_admin = is_admin;
        if let Some(name) = display_name {
            peer.display_name = name;
        }
        Ok(())
    }

    pub fn get(&self, peer_id: &PeerId) -> Result<&Peer> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| SignalError::NotFound(format!("peer {peer_id}")))
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Result<&mut Peer> {
        self.peers
            .get_mut(peer_id)
            .ok_or_else(|| SignalError::NotFound(format!("peer {peer_id}")))
    }

    /// The room the peer has joined; `InvalidState` before JOIN
    pub fn room_of(&self, peer_id: &PeerId) -> Result<&RoomName> {
        self.get(peer_id)?.room.as_ref().ok_or_else(|| {
            SignalError::InvalidState(format!("peer {peer_id} has not joined a room"))
        })
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<OwnedResources> {
        self.peers.remove(peer_id).map(|peer| OwnedResources {
            room: peer.room,
            transport_ids: peer.transport_ids,
            producer_ids: peer.producer_ids,
            consumer_ids: peer.consumer_ids,
        })
    }

    #[must_use]
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
