// Snapshot endpoints for diagnostics and the document persistence service.

use axum::{
    extract::{Path, State},
    Json,
};
use easel_common::types::LockInfo;
use serde::{Deserialize, Serialize};

use super::CollabRouterState;
use crate::collab::validate_room_id;
use crate::error::{ErrorCode, RelayError};

fn checked_room_id(room_id: String) -> Result<String, RelayError> {
    validate_room_id(&room_id)
        .map_err(|problem| RelayError::new(ErrorCode::ValidationFailed, problem))?;
    Ok(room_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomLocksResponse {
    pub room_id: String,
    pub locks: Vec<LockInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryDepthResponse {
    pub room_id: String,
    pub user_id: String,
    pub undo_depth: usize,
    pub redo_depth: usize,
}

/// Unknown rooms answer with an empty lock list.
pub async fn room_locks(
    Path(room_id): Path<String>,
    State(state): State<CollabRouterState>,
) -> Result<Json<RoomLocksResponse>, RelayError> {
    let room_id = checked_room_id(room_id)?;
    let locks = state.hub.locks(&room_id).await;
    Ok(Json(RoomLocksResponse { room_id, locks }))
}

pub async fn history_depth(
    Path((room_id, user_id)): Path<(String, String)>,
    State(state): State<CollabRouterState>,
) -> Result<Json<HistoryDepthResponse>, RelayError> {
    let room_id = checked_room_id(room_id)?;
    let (undo_depth, redo_depth) = state.hub.history_depth(&room_id, &user_id).await;
    Ok(Json(HistoryDepthResponse { room_id, user_id, undo_depth, redo_depth }))
}
