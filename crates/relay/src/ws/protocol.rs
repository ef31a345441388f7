use axum::extract::ws::{CloseFrame, Message, WebSocket};
use easel_common::protocol::ws::{encode_server_message, ServerMessage};

use crate::auth::jwt::AuthRejection;

pub async fn send_server_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let encoded = encode_server_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

/// Close an upgraded socket whose credential was rejected. The close code
/// and reason name the rejection.
pub async fn close_rejected(socket: &mut WebSocket, rejection: AuthRejection) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: rejection.close_code(),
            reason: rejection.as_str().into(),
        })))
        .await;
}
