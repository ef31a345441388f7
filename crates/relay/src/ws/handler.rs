use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, Uri},
    response::IntoResponse,
};
use easel_common::protocol::ws::{decode_client_message, ServerMessage};
use easel_common::types::{now_millis, Identity};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::protocol::{close_rejected, send_server_message};
use super::CollabRouterState;
use crate::auth::{jwt::AuthRejection, middleware::request_token};
use crate::collab::CollabHub;
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
};
use crate::metrics;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Silence (no frame of any kind) after which the socket is dropped.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);
pub const MAX_FRAME_BYTES: usize = 262_144;

/// Authenticate before the upgrade; a rejected credential still upgrades so
/// the client can read the reason from the close frame.
pub async fn ws_upgrade(
    State(state): State<CollabRouterState>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let authenticated = match request_token(&headers, &uri) {
        Some(token) => state.verifier.authenticate(&token),
        None => Err(AuthRejection::Malformed),
    };
    let request_id = request_id_from_headers_or_generate(&headers);
    let hub = state.hub.clone();

    ws.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |mut socket| async move {
        match authenticated {
            Ok(identity) => {
                with_request_id_scope(request_id, handle_socket(hub, identity, socket)).await;
            }
            Err(rejection) => {
                metrics::record_auth_rejection(rejection.as_str());
                warn!(request_id = %request_id, reason = rejection.as_str(), "rejecting websocket credential");
                close_rejected(&mut socket, rejection).await;
            }
        }
    })
}

async fn handle_socket(hub: CollabHub, identity: Identity, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let user_id = identity.user_id.clone();
    let (connection_id, outbound) = hub.connect(identity).await;
    info!(
        connection_id = %connection_id,
        user_id = %user_id,
        request_id = %request_id,
        "websocket connected"
    );

    // Server pings every HEARTBEAT_INTERVAL; any inbound frame counts as
    // proof of life.
    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_seen.elapsed() > HEARTBEAT_TIMEOUT {
                    warn!(
                        connection_id = %connection_id,
                        user_id = %user_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound.next() => {
                let Some(message) = maybe_outbound else {
                    // Deregistered elsewhere: superseded or expired.
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                if send_server_message(&mut socket, &message).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(Ok(message)) = maybe_message else {
                    break;
                };
                last_seen = Instant::now();

                match message {
                    Message::Text(raw_message) => match decode_client_message(raw_message.as_str()) {
                        Ok(inbound) => {
                            metrics::record_ws_message(inbound.kind(), false);
                            hub.handle_message(connection_id, inbound, now_millis()).await;
                        }
                        Err(error) => {
                            metrics::record_ws_message("invalid", true);
                            debug!(connection_id = %connection_id, error = %error, "undecodable frame");
                            outbound.push(invalid_message(error.to_string()));
                        }
                    },
                    Message::Binary(_) => {
                        metrics::record_ws_message("binary", true);
                        outbound.push(invalid_message("binary frames are not supported"));
                    }
                    Message::Pong(_) => hub.touch(connection_id, now_millis()).await,
                    // axum answers pings itself.
                    Message::Ping(_) => {}
                    Message::Close(_) => break,
                }
            }
        }
    }

    hub.disconnect(connection_id, now_millis()).await;
    info!(connection_id = %connection_id, user_id = %user_id, "websocket disconnected");
}

fn invalid_message(message: impl Into<String>) -> ServerMessage {
    ErrorCode::InvalidMessage.frame(message, None)
}
