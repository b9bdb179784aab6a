//! Connection teardown and producer-close cascades

use std::sync::Arc;
use tracing::{debug, info};

use crate::engine::{Consumer, Producer, Router, WebRtcTransport};
use crate::notifier::FanoutNotifier;
use crate::protocol::ServerMessage;
use crate::session::PeerChannel;
use crate::state::{SharedState, SignalState};
use crate::types::{PeerId, ProducerId};

/// Engine handles detached from the registries, closed after the lock is released
#[derive(Default)]
struct Teardown {
    consumers: Vec<Arc<dyn Consumer>>,
    producers: Vec<Arc<dyn Producer>>,
    transports: Vec<Arc<dyn WebRtcTransport>>,
    router: Option<Arc<dyn Router>>,
    /// `producer-closed` notices to send, per closed producer
    notices: Vec<(ProducerId, Vec<(PeerId, PeerChannel)>)>,
}

impl Teardown {
    fn close_handles(&self) {
        for consumer in &self.consumers {
            consumer.close();
        }
        for producer in &self.producers {
            producer.close();
        }
        for transport in &self.transports {
            transport.close();
        }
        if let Some(router) = &self.router {
            router.close();
        }
    }
}

pub struct LifecycleHandler {
    state: SharedState,
    notifier: FanoutNotifier,
    close_empty_rooms: bool,
}

impl LifecycleHandler {
    #[must_use]
    pub const fn new(state: SharedState, notifier: FanoutNotifier, close_empty_rooms: bool) -> Self {
        Self {
            state,
            notifier,
            close_empty_rooms,
        }
    }

    /// Remove a peer and everything it owns.
    ///
    /// Peers consuming one of its producers receive `producer-closed`. Returns
    /// `false` when the peer was already gone, so repeated calls are harmless.
    pub fn disconnect(&self, peer_id: &PeerId) -> bool {
        let teardown = {
            let mut guard = self.state.lock();
            Self::detach_peer(&mut guard, peer_id, self.close_empty_rooms)
        };
        let Some(teardown) = teardown else {
            debug!(peer_id = %peer_id, "Disconnect for unknown peer ignored");
            return false;
        };

        info!(
            peer_id = %peer_id,
            transports = teardown.transports.len(),
            producers = teardown.producers.len(),
            consumers = teardown.consumers.len(),
            room_closed = teardown.router.is_some(),
            "Peer disconnected"
        );
        self.finish(&teardown);
        true
    }

    /// React to the engine closing a producer.
    ///
    /// Closes every consumer of the producer with its recv transport and tells
    /// the owning peers. Producers already cascaded by a disconnect are a no-op.
    pub fn on_producer_closed(&self, producer_id: &ProducerId) {
        let teardown = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut teardown = Teardown::default();
            if let Some(record) = state.resources.remove_producer(producer_id) {
                if let Ok(peer) = state.sessions.get_mut(&record.peer_id) {
                    peer.producer_ids.retain(|id| id != producer_id);
                }
                teardown.producers.push(record.handle);
            }
            Self::cascade_producer(state, producer_id, &mut teardown);
            teardown
        };

        if !teardown.notices.is_empty() {
            debug!(producer_id = %producer_id, consumers = teardown.consumers.len(), "Producer closed");
        }
        self.finish(&teardown);
    }

    fn finish(&self, teardown: &Teardown) {
        teardown.close_handles();
        for (producer_id, targets) in &teardown.notices {
            self.notifier.notify_peers(
                targets,
                &ServerMessage::ProducerClosed {
                    remote_producer_id: producer_id.clone(),
                },
            );
        }
    }

    fn detach_peer(state: &mut SignalState, peer_id: &PeerId, close_empty: bool) -> Option<Teardown> {
        let owned = state.sessions.remove(peer_id)?;
        let mut teardown = Teardown::default();

        for consumer_id in &owned.consumer_ids {
            if let Some(record) = state.resources.remove_consumer(consumer_id) {
                teardown.consumers.push(record.handle);
            }
        }
        for producer_id in &owned.producer_ids {
            if let Some(record) = state.resources.remove_producer(producer_id) {
                teardown.producers.push(record.handle);
            }
            Self::cascade_producer(state, producer_id, &mut teardown);
        }
        for transport_id in &owned.transport_ids {
            if let Some(record) = state.resources.remove_transport(transport_id) {
                teardown.transports.push(record.handle);
            }
        }
        if let Some(room) = &owned.room {
            teardown.router = state.rooms.leave(room, peer_id, close_empty);
        }
        Some(teardown)
    }

    /// Detach every consumer and recv transport depending on `producer_id`
    fn cascade_producer(state: &mut SignalState, producer_id: &ProducerId, teardown: &mut Teardown) {
        let mut targets: Vec<(PeerId, PeerChannel)> = Vec::new();

        for transport_id in state.resources.recv_transports_for(producer_id) {
            let Some(transport) = state.resources.remove_transport(&transport_id) else {
                continue;
            };
            let consumer = transport
                .consumer_id
                .as_ref()
                .and_then(|id| state.resources.remove_consumer(id));

            if let Ok(peer) = state.sessions.get_mut(&transport.peer_id) {
                peer.transport_ids.retain(|id| id != &transport_id);
                if let Some(consumer) = &consumer {
                    peer.consumer_ids.retain(|id| id != &consumer.id);
                }
                peer.consuming.remove(producer_id);
                if !targets.iter().any(|(id, _)| id == &peer.id) {
                    targets.push((peer.id.clone(), peer.channel.clone()));
                }
            }
            if let Some(consumer) = consumer {
                teardown.consumers.push(consumer.handle);
            }
            teardown.transports.push(transport.handle);
        }

        // Consumers whose transport was not bound to the producer
        for consumer_id in state.resources.consumers_of_producer(producer_id) {
            let Some(consumer) = state.resources.remove_consumer(&consumer_id) else {
                continue;
            };
            if let Ok(peer) = state.sessions.get_mut(&consumer.peer_id) {
                peer.consumer_ids.retain(|id| id != &consumer_id);
                peer.consuming.remove(producer_id);
                if !targets.iter().any(|(id, _)| id == &peer.id) {
                    targets.push((peer.id.clone(), peer.channel.clone()));
                }
            }
            if let Ok(transport) = state
                .resources
                .transport_owned_mut(&consumer.transport_id, &consumer.peer_id)
            {
                transport.consumer_id = None;
            }
            teardown.consumers.push(consumer.handle);
        }

        if !targets.is_empty() {
            teardown.notices.push((producer_id.clone(), targets));
        }
    }
}
