//! SFU Manager - entry point for the transport layer
//!
//! This module provides:
//! - Peer registration and connection-success handshake
//! - Envelope decoding and request dispatch with per-request error replies
//! - The engine event pump (producer-close cascades, worker death)
//! - Global statistics and orderly shutdown

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SfuConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::{EngineEvent, MediaEngine};
use crate::error::{Result, SignalError};
use crate::lifecycle::LifecycleHandler;
use crate::notifier::FanoutNotifier;
use crate::protocol::{ClientRequest, InboundEnvelope, OutboundEnvelope, ServerMessage};
use crate::session::{DeliveryOutcome, IdentityIssuer, PeerChannel};
use crate::state::{SharedState, SignalState};
use crate::types::PeerId;

/// Global signaling statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub rooms: usize,
    pub peers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    /// Peer ids issued since startup
    pub peers_issued: u64,
}

pub struct SfuManager {
    config: SfuConfig,
    state: SharedState,
    identity: IdentityIssuer,
    dispatcher: Dispatcher,
    lifecycle: LifecycleHandler,
    /// `Some(reason)` once the engine is unusable
    fatal_tx: watch::Sender<Option<String>>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
}

impl SfuManager {
    /// Create a manager on top of `engine`.
    ///
    /// Spawns the engine event pump, so this must run inside a tokio runtime.
    pub fn new(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> Arc<Self> {
        let state = SignalState::shared(&config);
        let notifier = FanoutNotifier::new(Arc::clone(&state));
        let events = engine.subscribe();
        let (fatal_tx, _) = watch::channel(None);

        let manager = Arc::new(Self {
            dispatcher: Dispatcher::new(
                Arc::clone(&state),
                engine,
                notifier.clone(),
                config.clone(),
            ),
            lifecycle: LifecycleHandler::new(Arc::clone(&state), notifier, config.close_empty_rooms),
            identity: IdentityIssuer::new(),
            state,
            fatal_tx,
            event_pump: Mutex::new(None),
            config,
        });

        let pump = tokio::spawn(Self::run_event_pump(Arc::downgrade(&manager), events));
        *manager.event_pump.lock() = Some(pump);

        info!(
            max_rooms = manager.config.max_rooms,
            max_peers_per_room = manager.config.max_peers_per_room,
            close_empty_rooms = manager.config.close_empty_rooms,
            "SFU Manager initialized"
        );

        manager
    }

    async fn run_event_pump(manager: Weak<Self>, mut events: broadcast::Receiver<EngineEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.handle_engine_event(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Engine event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Engine event channel closed");
                    break;
                }
            }
        }
    }

    fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::ProducerClosed { producer_id } => {
                self.lifecycle.on_producer_closed(&producer_id);
            }
            EngineEvent::WorkerDied { reason } => {
                error!(reason = %reason, "Media engine worker died");
                self.fatal_tx.send_replace(Some(reason));
            }
        }
    }

    /// Register a new connection and greet it with `connection-success`
    pub fn connect(&self, channel: PeerChannel) -> Result<PeerId> {
        let peer_id = self.identity.issue();
        self.state.lock().sessions.create(peer_id.clone(), channel.clone())?;

        let greeting = OutboundEnvelope::notification(ServerMessage::ConnectionSuccess {
            peer_id: peer_id.clone(),
        });
        if channel.deliver(greeting) != DeliveryOutcome::Delivered {
            warn!(peer_id = %peer_id, "Could not deliver connection-success");
        }

        info!(peer_id = %peer_id, "Peer connected");
        Ok(peer_id)
    }

    /// Handle one raw inbound message and build the reply.
    ///
    /// Failures become error replies; they never affect other peers.
    pub async fn handle_message(&self, peer_id: &PeerId, raw: &str) -> OutboundEnvelope {
        let envelope = match InboundEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Rejected malformed message");
                return OutboundEnvelope::reply(ServerMessage::from_error(&e, None), None);
            }
        };

        let result = match ClientRequest::from_envelope(&envelope) {
            Ok(request) => self.handle_request(peer_id, request).await,
            Err(e) => Err(e),
        };
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                self.report_failure(peer_id, &envelope.event, &e);
                ServerMessage::from_error(&e, Some(envelope.event.as_str()))
            }
        };
        OutboundEnvelope::reply(message, envelope.request_id)
    }

    /// Dispatch an already decoded request
    pub async fn handle_request(&self, peer_id: &PeerId, request: ClientRequest) -> Result<ServerMessage> {
        debug!(peer_id = %peer_id, event = request.event(), "Dispatching request");
        self.dispatcher.dispatch(peer_id, request).await
    }

    fn report_failure(&self, peer_id: &PeerId, event: &str, err: &SignalError) {
        if err.is_fatal() {
            error!(peer_id = %peer_id, event, error = %err, "Media engine is no longer usable");
            self.fatal_tx.send_replace(Some(err.to_string()));
        } else {
            warn!(peer_id = %peer_id, event, code = err.code(), error = %err, "Request failed");
        }
    }

    /// Tear down a connection. Safe to call more than once.
    pub fn disconnect(&self, peer_id: &PeerId) -> bool {
        self.lifecycle.disconnect(peer_id)
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let state = self.state.lock();
        ManagerStats {
            rooms: state.rooms.len(),
            peers: state.sessions.len(),
            transports: state.resources.transport_count(),
            producers: state.resources.producer_count(),
            consumers: state.resources.consumer_count(),
            peers_issued: self.identity.issued(),
        }
    }

    /// Fires with `Some(reason)` when the engine can no longer be trusted
    #[must_use]
    pub fn fatal_signal(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }

    #[must_use]
    pub const fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Disconnect every peer and close every room's router
    pub fn shutdown(&self) {
        let peer_ids = self.state.lock().sessions.ids();
        for peer_id in &peer_ids {
            self.lifecycle.disconnect(peer_id);
        }

        let routers = self.state.lock().rooms.drain();
        for router in &routers {
            router.close();
        }

        if let Some(pump) = self.event_pump.lock().take() {
            pump.abort();
        }

        info!(peers = peer_ids.len(), rooms = routers.len(), "SFU Manager shut down");
    }
}

impl Drop for SfuManager {
    fn drop(&mut self) {
        if let Some(pump) = self.event_pump.get_mut().take() {
            pump.abort();
        }
    }
}
