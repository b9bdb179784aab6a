// Huddle API Library
//
// HTTP surface of the signaling server: the WebSocket signaling endpoint plus
// health and statistics routes

pub mod connections;
pub mod http;

pub use connections::{ConnectionInfo, ConnectionTracker};
pub use http::{create_router, AppState, WsSettings};
