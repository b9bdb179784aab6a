//! Huddle SFU signaling
//!
//! Session coordination for a multi-party Selective Forwarding Unit. Clients
//! join named rooms and negotiate transports, producers and consumers with a
//! media engine; this crate keeps the shared room/peer/resource state
//! consistent and tells the right peers when the topology changes.
//!
//! ## Architecture
//!
//! - **`SfuManager`**: entry point used by the transport layer
//! - **`Dispatcher`**: per-request negotiation state machine
//! - **`RoomRegistry`** / **`SessionRegistry`** / **`ResourceRegistry`**: shared state
//! - **`FanoutNotifier`**: `new-producer` and `producer-closed` delivery
//! - **`LifecycleHandler`**: disconnect teardown and producer-close cascades
//! - **`engine`**: media engine capability traits and the in-process `LoopbackEngine`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use huddle_sfu::{engine::{EngineConfig, LoopbackEngine}, PeerChannel, SfuConfig, SfuManager};
//!
//! let engine = Arc::new(LoopbackEngine::new(EngineConfig::default()));
//! let manager = SfuManager::new(SfuConfig::default(), engine);
//!
//! let (channel, mut outbound) = PeerChannel::bounded(64);
//! let peer_id = manager.connect(channel)?;
//! let reply = manager
//!     .handle_message(&peer_id, r#"{"event":"join-room","data":{"roomName":"r1"}}"#)
//!     .await;
//! ```

mod config;
mod dispatcher;
pub mod engine;
mod error;
mod lifecycle;
mod manager;
mod notifier;
pub mod protocol;
mod resources;
mod room;
mod session;
mod state;
mod types;

pub use config::SfuConfig;
pub use dispatcher::Dispatcher;
pub use error::{EngineError, Result, SignalError};
pub use lifecycle::LifecycleHandler;
pub use manager::{ManagerStats, SfuManager};
pub use notifier::FanoutNotifier;
pub use protocol::{ClientRequest, OutboundEnvelope, ServerMessage};
pub use resources::{
    ConsumerRecord, ProducerRecord, ResourceRegistry, TransportRecord, TransportState,
};
pub use room::{Room, RoomRegistry};
pub use session::{
    DeliveryOutcome, IdentityIssuer, OwnedResources, Peer, PeerChannel, SessionRegistry,
};
pub use state::{SharedState, SignalState};
pub use types::{
    ConsumerId, MediaKind, PeerId, ProducerId, RoomName, RouterId, TransportDirection,
    TransportId, MAX_ROOM_NAME_LEN,
};
