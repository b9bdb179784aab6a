use chrono::{DateTime, Utc};
use dashmap::DashMap;
use huddle_sfu::PeerId;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Connection information
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub messages_received: u64,
}

impl ConnectionInfo {
    #[must_use]
    pub fn new(peer_id: PeerId) -> Self {
        let now = Utc::now();
        Self {
            peer_id,
            connected_at: now,
            last_activity: now,
            messages_received: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConnectionStats {
    pub active: usize,
    pub total: u64,
    pub messages: u64,
}

/// Tracks active WebSocket signaling connections
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    connections: Arc<DashMap<PeerId, ConnectionInfo>>,
    total_connections: Arc<AtomicU64>,
    total_messages: Arc<AtomicU64>,
}

impl ConnectionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer_id: PeerId) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.connections
            .insert(peer_id.clone(), ConnectionInfo::new(peer_id));
    }

    pub fn record_message(&self, peer_id: &PeerId) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        if let Some(mut info) = self.connections.get_mut(peer_id) {
            info.messages_received += 1;
            info.last_activity = Utc::now();
        }
    }

    pub fn unregister(&self, peer_id: &PeerId) -> Option<ConnectionInfo> {
        let (_, info) = self.connections.remove(peer_id)?;
        debug!(
            peer_id = %peer_id,
            duration_secs = (Utc::now() - info.connected_at).num_seconds(),
            messages = info.messages_received,
            "Connection unregistered"
        );
        Some(info)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active: self.connections.len(),
            total: self.total_connections.load(Ordering::Relaxed),
            messages: self.total_messages.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let tracker = ConnectionTracker::new();
        let peer = PeerId::from("peer-1");

        tracker.register(peer.clone());
        tracker.record_message(&peer);
        tracker.record_message(&peer);

        assert_eq!(tracker.connection_count(), 1);

        let info = tracker.unregister(&peer).unwrap();
        assert_eq!(info.peer_id, peer);
        assert_eq!(info.messages_received, 2);
        assert!(tracker.unregister(&peer).is_none());

        let stats = tracker.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.messages, 2);
    }

    #[test]
    fn test_messages_for_unknown_peer_are_counted_only_globally() {
        let tracker = ConnectionTracker::new();
        tracker.record_message(&PeerId::from("ghost"));
        assert_eq!(tracker.stats().messages, 1);
        assert_eq!(tracker.connection_count(), 0);
    }
}
