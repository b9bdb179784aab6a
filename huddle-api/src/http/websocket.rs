//! WebSocket signaling handler
//!
//! One worker per connection reads text frames in order and hands each to the
//! SFU manager; the reply is queued before the next frame is read. A separate
//! writer task drains the connection's bounded outbound queue, which also
//! carries fan-out notifications from other peers.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use huddle_sfu::{DeliveryOutcome, OutboundEnvelope, PeerChannel, ServerMessage, SignalError};
use tracing::{debug, error, info, warn};

use crate::http::AppState;

/// Upgrade to a signaling WebSocket
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(state.ws.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (channel, mut outbound) = PeerChannel::bounded(state.ws.outbound_channel_capacity);
    let peer_id = match state.sfu.connect(channel.clone()) {
        Ok(peer_id) => peer_id,
        Err(e) => {
            error!(error = %e, "Failed to register WebSocket connection");
            return;
        }
    };
    state.connections.register(peer_id.clone());
    info!(peer_id = %peer_id, "WebSocket connection established");

    let (mut sink, mut stream) = socket.split();

    // Spawn task to drain the outbound queue into the socket
    let writer_peer = peer_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let text = match envelope.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(peer_id = %writer_peer, error = %e, "Failed to encode outbound message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(peer_id = %writer_peer, error = %e, "WebSocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            frame = stream.next() => {
                let reply = match frame {
                    Some(Ok(Message::Text(text))) => {
                        state.connections.record_message(&peer_id);
                        state.sfu.handle_message(&peer_id, text.as_str()).await
                    }
                    Some(Ok(Message::Binary(_))) => OutboundEnvelope::reply(
                        ServerMessage::from_error(
                            &SignalError::Protocol("binary frames are not supported".to_string()),
                            None,
                        ),
                        None,
                    ),
                    Some(Ok(Message::Close(_))) | None => break,
                    // Ping/pong are answered by axum
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(peer_id = %peer_id, error = %e, "WebSocket read failed");
                        break;
                    }
                };
                if channel.send(reply).await == DeliveryOutcome::Closed {
                    warn!(peer_id = %peer_id, "Outbound queue closed, dropping connection");
                    break;
                }
            }
            _ = &mut writer => break,
        }
    }

    state.sfu.disconnect(&peer_id);
    state.connections.unregister(&peer_id);
    writer.abort();

    info!(peer_id = %peer_id, "WebSocket connection closed");
}
