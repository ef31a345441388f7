// WebSocket transport and read-only room queries.

mod handler;
mod protocol;
mod query;

pub use handler::{ws_upgrade, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, MAX_FRAME_BYTES};
pub use query::{HistoryDepthResponse, RoomLocksResponse};

use std::sync::Arc;

use axum::{middleware, routing::get, Router};

use crate::auth::{jwt::JwtCredentialVerifier, middleware::require_bearer_auth};
use crate::collab::CollabHub;

#[derive(Clone)]
pub struct CollabRouterState {
    pub(crate) hub: CollabHub,
    pub(crate) verifier: Arc<JwtCredentialVerifier>,
}

pub fn router(hub: CollabHub, verifier: Arc<JwtCredentialVerifier>) -> Router {
    let auth_layer = middleware::from_fn_with_state(Arc::clone(&verifier), require_bearer_auth);
    let state = CollabRouterState { hub, verifier };

    Router::new()
        .route("/v1/ws", get(ws_upgrade))
        .route(
            "/v1/rooms/{room_id}/locks",
            get(query::room_locks).route_layer(auth_layer.clone()),
        )
        .route(
            "/v1/rooms/{room_id}/history/{user_id}",
            get(query::history_depth).route_layer(auth_layer),
        )
        .with_state(state)
}
