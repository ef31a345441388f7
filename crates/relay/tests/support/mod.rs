#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use easel_common::protocol::ws::{ClientMessage, ServerMessage};
use easel_common::types::{Action, Identity, OpType};
use easel_relay::broker::{Broadcaster, MemoryBroker, PublishConfig};
use easel_relay::collab::CollabHub;
use easel_relay::config::CollabConfig;
use easel_relay::outbound::OutboundQueue;
use serde_json::Value;
use uuid::Uuid;

pub const ROOM: &str = "doc-1";

/// A relay instance wired to `broker` and already consuming remote events.
pub async fn instance(name: &str, broker: &MemoryBroker) -> CollabHub {
    let (broadcaster, _worker) =
        Broadcaster::start(name, Arc::new(broker.clone()), PublishConfig::default());
    let remote = broadcaster.subscribe().await.expect("subscribe to room channels");
    let hub = CollabHub::new(CollabConfig::default(), broadcaster);
    hub.spawn_remote_loop(remote);
    hub
}

pub fn identity(user_id: &str) -> Identity {
    Identity::new(user_id, format!("User {user_id}"), None)
}

pub fn join(room: &str) -> ClientMessage {
    ClientMessage::JoinRoom { room: room.into(), user_id: None, username: None }
}

pub fn lock(room: &str, element_id: &str) -> ClientMessage {
    ClientMessage::LockElement { room: room.into(), element_id: element_id.into() }
}

pub fn unlock(room: &str, element_id: &str) -> ClientMessage {
    ClientMessage::UnlockElement { room: room.into(), element_id: element_id.into() }
}

pub fn perform(room: &str, element_id: &str, after: Value) -> ClientMessage {
    ClientMessage::ActionPerformed {
        room: room.into(),
        action: Action {
            op_id: Uuid::new_v4(),
            element_id: element_id.into(),
            op_type: OpType::Move,
            before_state: None,
            after_state: Some(after),
        },
    }
}

/// Wait for the first queued message matching `predicate`, skipping others.
pub async fn recv_matching<F>(outbound: &OutboundQueue, mut predicate: F) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let message = outbound.next().await.expect("outbound queue should stay open");
            if predicate(&message) {
                return message;
            }
        }
    })
    .await
    .expect("expected message did not arrive")
}

/// The element state a client ends up with after applying `messages` in order.
pub fn rendered_state(messages: &[ServerMessage], element_id: &str) -> Option<Value> {
    let mut state = None;
    for message in messages {
        match message {
            ServerMessage::ActionApplied { action, .. }
            | ServerMessage::ActionUndone { action, .. }
            | ServerMessage::ActionRedone { action, .. }
                if action.element_id == element_id =>
            {
                state = action.after_state.clone();
            }
            ServerMessage::ActionConflictResolved { winning_action, .. }
                if winning_action.element_id == element_id =>
            {
                state = winning_action.after_state.clone();
            }
            _ => {}
        }
    }
    state
}
