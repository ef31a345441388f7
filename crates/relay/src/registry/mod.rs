// Connection Registry: live transports on this process and the identity each
// one authenticated as. Owns connection lifecycle; room state lives elsewhere.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use easel_common::types::Identity;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::outbound::OutboundQueue;

#[derive(Clone)]
struct ConnectionRecord {
    identity: Identity,
    outbound: OutboundQueue,
    rooms: HashSet<String>,
}

/// What a deregistered connection leaves behind for room cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departed {
    pub identity: Identity,
    pub rooms: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<Uuid, ConnectionRecord>,
    room_index: HashMap<String, HashSet<Uuid>>,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl ConnectionRegistry {
    pub async fn register(&self, identity: Identity, outbound: OutboundQueue) -> Uuid {
        let connection_id = Uuid::new_v4();
        let user_id = identity.user_id.clone();
        self.state.write().await.connections.insert(
            connection_id,
            ConnectionRecord { identity, outbound, rooms: HashSet::new() },
        );
        info!(connection_id = %connection_id, user_id = %user_id, "connection registered");
        connection_id
    }

    /// Remove a connection. Idempotent: the second call returns `None`.
    pub async fn deregister(&self, connection_id: Uuid) -> Option<Departed> {
        let mut state = self.state.write().await;
        let record = state.connections.remove(&connection_id)?;
        for room_id in &record.rooms {
            if let Some(members) = state.room_index.get_mut(room_id) {
                members.remove(&connection_id);
                if members.is_empty() {
                    state.room_index.remove(room_id);
                }
            }
        }
        drop(state);

        record.outbound.close();
        info!(
            connection_id = %connection_id,
            user_id = %record.identity.user_id,
            rooms = record.rooms.len(),
            "connection deregistered"
        );
        let mut rooms: Vec<String> = record.rooms.into_iter().collect();
        rooms.sort();
        Some(Departed { identity: record.identity, rooms })
    }

    /// Record that `connection_id` is a member of `room_id`. Returns false if
    /// the connection is gone.
    pub async fn track_room(&self, connection_id: Uuid, room_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(record) = state.connections.get_mut(&connection_id) else {
            return false;
        };
        if record.rooms.insert(room_id.to_string()) {
            state.room_index.entry(room_id.to_string()).or_default().insert(connection_id);
            debug!(connection_id = %connection_id, room_id, "connection joined room");
        }
        true
    }

    pub async fn untrack_room(&self, connection_id: Uuid, room_id: &str) {
        let mut state = self.state.write().await;
        if let Some(record) = state.connections.get_mut(&connection_id) {
            record.rooms.remove(room_id);
        }
        if let Some(members) = state.room_index.get_mut(room_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                state.room_index.remove(room_id);
            }
        }
    }

    pub async fn is_in_room(&self, connection_id: Uuid, room_id: &str) -> bool {
        self.state
            .read()
            .await
            .connections
            .get(&connection_id)
            .is_some_and(|record| record.rooms.contains(room_id))
    }

    /// Rooms the connection has joined, sorted.
    pub async fn rooms(&self, connection_id: Uuid) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .state
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(|record| record.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub async fn identity(&self, connection_id: Uuid) -> Option<Identity> {
        self.state.read().await.connections.get(&connection_id).map(|r| r.identity.clone())
    }

    pub async fn outbound(&self, connection_id: Uuid) -> Option<OutboundQueue> {
        self.state.read().await.connections.get(&connection_id).map(|r| r.outbound.clone())
    }

    /// Outbound queues of every local connection in `room_id`, minus `exclude`.
    pub async fn recipients(&self, room_id: &str, exclude: Option<Uuid>) -> Vec<OutboundQueue> {
        let state = self.state.read().await;
        let Some(members) = state.room_index.get(room_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|connection_id| Some(**connection_id) != exclude)
            .filter_map(|connection_id| state.connections.get(connection_id))
            .map(|record| record.outbound.clone())
            .collect()
    }

    /// Local connections of `user_id` in `room_id`.
    pub async fn user_connections(&self, room_id: &str, user_id: &str) -> Vec<Uuid> {
        let state = self.state.read().await;
        let Some(members) = state.room_index.get(room_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|connection_id| {
                state
                    .connections
                    .get(connection_id)
                    .is_some_and(|record| record.identity.user_id == user_id)
            })
            .copied()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
