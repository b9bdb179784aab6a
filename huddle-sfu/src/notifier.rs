//! Fan-out of topology changes to room members

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::protocol::{OutboundEnvelope, ServerMessage};
use crate::session::{DeliveryOutcome, PeerChannel};
use crate::state::SharedState;
use crate::types::{PeerId, RoomName};

#[derive(Clone)]
pub struct FanoutNotifier {
    state: SharedState,
}

impl FanoutNotifier {
    #[must_use]
    pub const fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Notify every member of `room` except `excluded`.
    ///
    /// Membership is snapshotted under the lock; delivery happens after it is
    /// released. Returns the number of peers the message was queued for.
    pub fn notify_room_except(&self, room: &RoomName, excluded: &PeerId, message: &ServerMessage) -> usize {
        let targets = self.state.lock().room_channels_except(room, excluded);
        Self::deliver(&targets, message)
    }

    /// Notify an already resolved set of peers
    pub fn notify_peers(&self, targets: &[(PeerId, PeerChannel)], message: &ServerMessage) -> usize {
        Self::deliver(targets, message)
    }

    fn deliver(targets: &[(PeerId, PeerChannel)], message: &ServerMessage) -> usize {
        let envelope = OutboundEnvelope::notification(message.clone());
        let mut delivered = 0;
        for (peer_id, channel) in targets {
            match channel.deliver(envelope.clone()) {
                DeliveryOutcome::Delivered => delivered += 1,
                DeliveryOutcome::Closed => {
                    debug!(peer_id = %peer_id, event = message.event(), "Skipping closed peer channel");
                }
                DeliveryOutcome::Full => {
                    if Self::deliver_later(peer_id, channel, envelope.clone()) {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    /// Wait for room on a full channel without blocking the caller.
    ///
    /// A deferred notice can reach the peer after messages queued later.
    fn deliver_later(peer_id: &PeerId, channel: &PeerChannel, envelope: OutboundEnvelope) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            warn!(peer_id = %peer_id, event = envelope.message.event(), "Peer channel full, notification dropped");
            return false;
        };
        debug!(peer_id = %peer_id, event = envelope.message.event(), "Peer channel full, deferring notification");
        let channel = channel.clone();
        runtime.spawn(async move {
            channel.send(envelope).await;
        });
        true
    }
}
