//! WebSocket endpoint at `/api`
//!
//! Upgrades the connection, greets with the version frame, then pumps
//! command dispatch, event broadcast, and a heartbeat until either side
//! closes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;

use crate::state::AppState;

/// Heartbeat interval
const HEARTBEAT_SECS: u64 = 30;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    // A broker without handlers cannot answer anything useful
    if !state.broker.has_handlers() {
        return (StatusCode::SERVICE_UNAVAILABLE, "no command handlers registered")
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let broker = state.broker.clone();
    let (peer_id, mut outbound) = broker.connect_peer();

    if sender
        .send(Message::Text(broker.version_frame()))
        .await
        .is_err()
    {
        broker.disconnect_peer(peer_id);
        return;
    }

    let mut heartbeat =
        tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_SECS));
    heartbeat.tick().await; // immediate first tick

    loop {
        tokio::select! {
            // Command from the peer
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response = broker.dispatch(&text).await;
                        if sender.send(Message::Text(response)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket receive error: {}", e);
                        break;
                    }
                }
            }

            // Broadcast frame from the broker
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if sender.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Heartbeat
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    broker.disconnect_peer(peer_id);
}
