//! WebSocket viewer connections
//!
//! Every accepted connection is one subscriber. Each binary message is one
//! complete JPEG frame with no extra framing; the server never sends text.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

use crate::stream::StreamSupervisor;
use crate::web::server::AppState;

/// Handle WebSocket upgrade requests
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let supervisor = state.supervisor.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, supervisor))
}

/// Relay frames to one viewer until either side goes away
pub async fn handle_socket(socket: WebSocket, supervisor: StreamSupervisor) {
    let mut subscription = match supervisor.subscribe() {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::debug!(error = %e, "Rejecting viewer");
            let mut socket = socket;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let id = subscription.id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            frame = subscription.recv() => {
                match frame {
                    Some(frame) => {
                        if ws_tx.send(Message::Binary(frame.data().to_vec())).await.is_err() {
                            tracing::debug!(subscriber = %id, "Viewer send failed");
                            break;
                        }
                    }
                    None => {
                        // Removed by the broadcaster or relay shutdown
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(subscriber = %id, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {} // Viewers have nothing to say
                }
            }
        }
    }

    supervisor.unsubscribe(&id);
}
