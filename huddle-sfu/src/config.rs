//! SFU signaling configuration

use serde::{Deserialize, Serialize};

use crate::engine::WebRtcTransportOptions;

/// Signaling layer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Delete a room and close its router when the last peer leaves
    pub close_empty_rooms: bool,
    /// CONSUME requires the recv transport to have completed TRANSPORT_RECV_CONNECT
    pub consume_requires_connected_transport: bool,
    /// Listen options for every WebRTC transport
    pub webrtc_transport: WebRtcTransportOptions,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            max_peers_per_room: 50,
            close_empty_rooms: true,
            consume_requires_connected_transport: true,
            webrtc_transport: WebRtcTransportOptions::default(),
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let transport = &self.webrtc_transport;
        if !transport.enable_udp && !transport.enable_tcp {
            errors.push("engine: at least one of enable_udp and enable_tcp must be true".to_string());
        }
        if transport.advertised_ip().is_unspecified() {
            errors.push(
                "engine.announced_ip must be set when listen_ip is unspecified".to_string(),
            );
        }
        errors
    }
}
