// ABOUTME: Runhub gateway: tracks live client connections and their topic rooms
// ABOUTME: Forwards channel events to local websockets and accepts client cancels

pub mod auth;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod ws;

pub use auth::{Authenticator, Identity, StaticTokenAuthenticator};
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{ConnectionId, ConnectionRegistry, Registration};

use axum::{routing::get, Router};
use std::sync::Arc;

/// Websocket route bound to a gateway
pub fn create_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(gateway)
}
