// ABOUTME: Axum websocket endpoint serving one gateway connection per socket
// ABOUTME: Multiplexes client requests with the connection's outbox until either side closes

use crate::gateway::Gateway;
use crate::protocol::{ClientMessage, ServerMessage};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use runhub_core::ErrorCode;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// GET /ws?token=...
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let identity = gateway.authenticate(query.token.as_deref()).await;
    ws.on_upgrade(move |socket| async move {
        let registration = gateway.connect(identity);
        serve_connection(&gateway, socket, registration).await;
    })
}

async fn serve_connection(
    gateway: &Gateway,
    socket: WebSocket,
    registration: crate::registry::Registration,
) {
    let id = registration.id;
    let mut events = registration.events;
    let (mut sender, mut receiver) = socket.split();

    loop {
        let reply = tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(message) => gateway.handle_message(id, message).await,
                        Err(e) => ServerMessage::error(ErrorCode::InvalidMessage, e.to_string()),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(connection_id = id, "Websocket receive failed: {}", e);
                    break;
                }
            },
            outbound = events.recv() => match outbound {
                Ok(event) => ServerMessage::Event { event },
                Err(RecvError::Lagged(dropped)) => {
                    warn!(connection_id = id, dropped = dropped, "Slow connection, dropped oldest events");
                    ServerMessage::Lagged { dropped }
                }
                Err(RecvError::Closed) => break,
            },
        };

        let payload = match serde_json::to_string(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(connection_id = id, "Failed to encode message: {}", e);
                continue;
            }
        };
        if sender.send(Message::Text(payload.into())).await.is_err() {
            break;
        }
    }

    gateway.disconnect(id).await;
}
