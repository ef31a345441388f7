// Collaboration hub: maps protocol messages onto the registry, rooms, the
// transform engine and history, then fans results out to local connections
// and replicates them to other instances.
//
// Every room change comes back with a delivery ticket drawn while the room or
// element lock was held. Replies and broadcasts are collected into a
// `Delivery` after the lock is released and handed to the ticket, so local
// members see a room's events in the order they were applied.

use std::sync::Arc;
use std::time::Duration;

use easel_common::protocol::ws::{ClientMessage, ServerMessage, LOCK_COLLISION, UNLOCK_NOT_OWNER};
use easel_common::types::{now_millis, Action, Identity, LockInfo, LockOwner, MemberInfo, Operation};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broadcaster, RemoteEvents, RoomEnvelope, RoomEvent, MAX_ROOM_ID_BYTES};
use crate::config::CollabConfig;
use crate::delivery::{Delivery, DeliveryLanes, Ticket};
use crate::engine::{Integration, SubmitKind, TransformEngine};
use crate::error::ErrorCode;
use crate::history::HistoryStore;
use crate::metrics;
use crate::outbound::OutboundQueue;
use crate::registry::ConnectionRegistry;
use crate::room::{LockOutcome, Presence, RemoteLockOutcome, RoomManager, UnlockOutcome};

struct HubInner {
    config: CollabConfig,
    registry: ConnectionRegistry,
    rooms: RoomManager,
    engine: TransformEngine,
    history: HistoryStore,
    broadcaster: Broadcaster,
}

#[derive(Clone)]
pub struct CollabHub {
    inner: Arc<HubInner>,
}

/// What one maintenance pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepSummary {
    pub expired: Vec<Presence>,
    /// Locks released because their owner never reappeared in the room.
    pub orphaned_locks: Vec<LockInfo>,
    pub rooms_dropped: Vec<String>,
}

/// Room ids are non-blank and short enough to fit a broker channel name.
pub fn validate_room_id(room_id: &str) -> Result<(), String> {
    if room_id.trim().is_empty() {
        return Err("room must not be empty".to_string());
    }
    if room_id.len() > MAX_ROOM_ID_BYTES {
        return Err(format!("room must be at most {MAX_ROOM_ID_BYTES} bytes"));
    }
    Ok(())
}

fn event_for(kind: SubmitKind, room_id: &str, op: &Operation) -> ServerMessage {
    let room = room_id.to_string();
    let action = op.clone();
    match kind {
        SubmitKind::Action => ServerMessage::ActionApplied { room, action },
        SubmitKind::Undo => ServerMessage::ActionUndone { room, action },
        SubmitKind::Redo => ServerMessage::ActionRedone { room, action },
    }
}

impl CollabHub {
    pub fn new(config: CollabConfig, broadcaster: Broadcaster) -> Self {
        let lanes = DeliveryLanes::default();
        let engine = TransformEngine::new(config.conflict_window_ms)
            .with_lanes(lanes.clone())
            .with_max_op_bytes(broadcaster.max_operation_bytes());
        Self {
            inner: Arc::new(HubInner {
                config,
                registry: ConnectionRegistry::default(),
                rooms: RoomManager::with_lanes(lanes),
                engine,
                history: HistoryStore::new(config.history_depth),
                broadcaster,
            }),
        }
    }

    pub fn config(&self) -> CollabConfig {
        self.inner.config
    }

    pub fn instance_id(&self) -> &str {
        self.inner.broadcaster.instance_id()
    }

    // ── Connection lifecycle ─────────────────────────────────────────────

    /// Register an authenticated transport. The returned queue is drained by
    /// the transport task; it closes when the connection is deregistered.
    pub async fn connect(&self, identity: Identity) -> (Uuid, OutboundQueue) {
        let outbound = OutboundQueue::new(self.inner.config.outbound_buffer);
        let connection_id = self.inner.registry.register(identity, outbound.clone()).await;
        metrics::connection_opened();
        (connection_id, outbound)
    }

    /// Deregister a connection and leave every room it joined. Idempotent.
    pub async fn disconnect(&self, connection_id: Uuid, now: i64) {
        let Some(departed) = self.inner.registry.deregister(connection_id).await else {
            return;
        };
        metrics::connection_closed();

        for room_id in &departed.rooms {
            let left = self
                .inner
                .rooms
                .leave(room_id, &departed.identity.user_id, Some(connection_id), now)
                .await;
            if let Some(left) = left {
                let (outcome, ticket) = left.into_parts();
                self.announce_departure(room_id, &outcome.presence, &outcome.released, true, ticket)
                    .await;
            }
        }
    }

    /// Refresh liveness of every presence owned by the connection.
    pub async fn touch(&self, connection_id: Uuid, now: i64) {
        let Some(identity) = self.inner.registry.identity(connection_id).await else {
            return;
        };
        for room_id in self.inner.registry.rooms(connection_id).await {
            self.inner.rooms.touch(&room_id, &identity.user_id, now, false).await;
        }
    }

    // ── Client messages ──────────────────────────────────────────────────

    pub async fn handle_message(&self, connection_id: Uuid, message: ClientMessage, now: i64) {
        let Some(identity) = self.inner.registry.identity(connection_id).await else {
            return;
        };
        if let Some(room_id) = message.room() {
            if let Err(problem) = validate_room_id(room_id) {
                self.reply(connection_id, ErrorCode::InvalidMessage.frame(problem, None)).await;
                return;
            }
        }

        match message {
            ClientMessage::JoinRoom { room, .. } => {
                self.join(connection_id, &identity, &room, now).await;
            }
            ClientMessage::LeaveRoom { room } => {
                self.leave(connection_id, &identity, &room, now).await;
            }
            ClientMessage::CursorMove { room, x, y } => {
                self.ensure_joined(connection_id, &identity, &room, now).await;
                self.move_cursor(connection_id, &identity, &room, x, y, now).await;
            }
            ClientMessage::LockElement { room, element_id } => {
                if element_id.is_empty() {
                    self.reply(
                        connection_id,
                        ErrorCode::InvalidMessage
                            .frame("element_id must not be empty", Some(room.as_str())),
                    )
                    .await;
                    return;
                }
                self.ensure_joined(connection_id, &identity, &room, now).await;
                self.lock(connection_id, &identity, &room, &element_id, now).await;
            }
            ClientMessage::UnlockElement { room, element_id } => {
                self.unlock(connection_id, &identity, &room, &element_id).await;
            }
            ClientMessage::ActionPerformed { room, action } => {
                if action.element_id.is_empty() {
                    self.reply(
                        connection_id,
                        ErrorCode::InvalidMessage
                            .frame("element_id must not be empty", Some(room.as_str())),
                    )
                    .await;
                    return;
                }
                self.ensure_joined(connection_id, &identity, &room, now).await;
                self.submit(connection_id, &identity, &room, action, SubmitKind::Action, now).await;
            }
            ClientMessage::UndoAction { room } => {
                self.ensure_joined(connection_id, &identity, &room, now).await;
                let Some(entry) = self.inner.history.undo(&room, &identity.user_id).await else {
                    debug!(room_id = %room, user_id = %identity.user_id, "nothing to undo");
                    return;
                };
                let action = entry.inverse_action();
                self.submit(connection_id, &identity, &room, action, SubmitKind::Undo, now).await;
            }
            ClientMessage::RedoAction { room } => {
                self.ensure_joined(connection_id, &identity, &room, now).await;
                let Some(entry) = self.inner.history.redo(&room, &identity.user_id).await else {
                    debug!(room_id = %room, user_id = %identity.user_id, "nothing to redo");
                    return;
                };
                let action = entry.forward_action();
                self.submit(connection_id, &identity, &room, action, SubmitKind::Redo, now).await;
            }
            ClientMessage::Ping => {
                self.touch(connection_id, now).await;
                self.reply(connection_id, ServerMessage::Pong { server_time: now }).await;
            }
        }
    }

    async fn join(&self, connection_id: Uuid, identity: &Identity, room_id: &str, now: i64) {
        let (outcome, ticket) =
            self.inner.rooms.join(room_id, identity, connection_id, now).await.into_parts();
        self.inner.registry.track_room(connection_id, room_id).await;
        info!(
            room_id,
            user_id = %identity.user_id,
            connection_id = %connection_id,
            members = outcome.members.len(),
            "user joined room"
        );

        if let Some(superseded) = outcome.superseded {
            self.evict(superseded, room_id, now).await;
        }

        let mut delivery = Delivery::new();
        self.address(
            &mut delivery,
            connection_id,
            ServerMessage::RoomJoined {
                room: room_id.to_string(),
                success: true,
                members: outcome.members,
                locks: outcome.locks,
            },
        )
        .await;
        self.broadcast(
            &mut delivery,
            room_id,
            Some(connection_id),
            ServerMessage::UserJoined { room: room_id.to_string(), member: outcome.member.clone() },
        )
        .await;
        ticket.deliver(delivery);
        self.inner
            .broadcaster
            .publish(room_id, RoomEvent::MemberJoined { member: outcome.member, connection_id });
    }

    /// Close an older connection of a user that rejoined from a new one.
    async fn evict(&self, connection_id: Uuid, room_id: &str, now: i64) {
        warn!(room_id, connection_id = %connection_id, "evicting superseded session");
        self.reply(
            connection_id,
            ErrorCode::SessionSuperseded
                .frame(ErrorCode::SessionSuperseded.default_message(), Some(room_id)),
        )
        .await;
        self.disconnect(connection_id, now).await;
    }

    async fn ensure_joined(&self, connection_id: Uuid, identity: &Identity, room_id: &str, now: i64) {
        if !self.inner.registry.is_in_room(connection_id, room_id).await {
            self.join(connection_id, identity, room_id, now).await;
        }
    }

    async fn leave(&self, connection_id: Uuid, identity: &Identity, room_id: &str, now: i64) {
        self.inner.registry.untrack_room(connection_id, room_id).await;
        let left =
            self.inner.rooms.leave(room_id, &identity.user_id, Some(connection_id), now).await;
        if let Some(left) = left {
            info!(room_id, user_id = %identity.user_id, "user left room");
            let (outcome, ticket) = left.into_parts();
            self.announce_departure(room_id, &outcome.presence, &outcome.released, true, ticket)
                .await;
        }
    }

    /// Tell local members that a presence is gone along with its locks, and
    /// replicate the departure when this instance owned it.
    async fn announce_departure(
        &self,
        room_id: &str,
        presence: &Presence,
        released: &[LockInfo],
        publish: bool,
        ticket: Ticket,
    ) {
        let user_id = &presence.identity.user_id;
        let recipients = self.inner.registry.recipients(room_id, None).await;
        let mut delivery = Delivery::new();
        for lock in released {
            delivery.push_all(
                recipients.clone(),
                &ServerMessage::ElementUnlocked {
                    room: room_id.to_string(),
                    element_id: lock.element_id.clone(),
                    user_id: user_id.clone(),
                },
            );
        }
        delivery.push_all(
            recipients,
            &ServerMessage::UserLeft { room: room_id.to_string(), user_id: user_id.clone() },
        );
        ticket.deliver(delivery);

        if publish {
            for lock in released {
                self.inner.broadcaster.publish(
                    room_id,
                    RoomEvent::ElementUnlocked {
                        element_id: lock.element_id.clone(),
                        user_id: user_id.clone(),
                    },
                );
            }
            self.inner.broadcaster.publish(
                room_id,
                RoomEvent::MemberLeft {
                    user_id: user_id.clone(),
                    connection_id: presence.connection_id,
                },
            );
        }
    }

    async fn move_cursor(
        &self,
        connection_id: Uuid,
        identity: &Identity,
        room_id: &str,
        x: f64,
        y: f64,
        now: i64,
    ) {
        let Some(moved) =
            self.inner.rooms.update_presence(room_id, &identity.user_id, x, y, now).await
        else {
            return;
        };
        let (presence, ticket) = moved.into_parts();
        let mut delivery = Delivery::new();
        let update = cursor_update(room_id, &presence, now);
        self.broadcast(&mut delivery, room_id, Some(connection_id), update).await;
        ticket.deliver(delivery);
        self.inner.broadcaster.publish(
            room_id,
            RoomEvent::CursorMoved { user_id: identity.user_id.clone(), x, y, timestamp: now },
        );
    }

    async fn lock(
        &self,
        connection_id: Uuid,
        identity: &Identity,
        room_id: &str,
        element_id: &str,
        now: i64,
    ) {
        let room = room_id.to_string();
        let element = element_id.to_string();
        let (outcome, ticket) =
            self.inner.rooms.lock(room_id, identity, element_id, now).await.into_parts();
        let mut delivery = Delivery::new();
        match outcome {
            LockOutcome::Granted(lock) => {
                debug!(room_id, element_id, user_id = %identity.user_id, "lock granted");
                self.address(
                    &mut delivery,
                    connection_id,
                    ServerMessage::LockResult {
                        room: room.clone(),
                        element_id: element,
                        success: true,
                        error: None,
                        owner: None,
                    },
                )
                .await;
                self.broadcast(
                    &mut delivery,
                    room_id,
                    Some(connection_id),
                    ServerMessage::ElementLocked { room, lock: lock.clone() },
                )
                .await;
                ticket.deliver(delivery);
                self.inner.broadcaster.publish(room_id, RoomEvent::ElementLocked { lock });
            }
            LockOutcome::AlreadyHeld(_) => {
                self.address(
                    &mut delivery,
                    connection_id,
                    ServerMessage::LockResult {
                        room,
                        element_id: element,
                        success: true,
                        error: None,
                        owner: None,
                    },
                )
                .await;
                ticket.deliver(delivery);
            }
            LockOutcome::Denied(existing) => {
                info!(
                    room_id,
                    element_id,
                    user_id = %identity.user_id,
                    owner_user_id = %existing.owner_user_id,
                    "lock collision"
                );
                self.address(
                    &mut delivery,
                    connection_id,
                    ServerMessage::LockResult {
                        room,
                        element_id: element,
                        success: false,
                        error: Some(LOCK_COLLISION.to_string()),
                        owner: Some(LockOwner {
                            user_id: existing.owner_user_id,
                            username: existing.owner_username,
                        }),
                    },
                )
                .await;
                ticket.deliver(delivery);
            }
        }
    }

    async fn unlock(&self, connection_id: Uuid, identity: &Identity, room_id: &str, element_id: &str) {
        let room = room_id.to_string();
        let element = element_id.to_string();
        let (outcome, ticket) =
            self.inner.rooms.unlock(room_id, &identity.user_id, element_id).await.into_parts();
        let mut delivery = Delivery::new();
        match outcome {
            UnlockOutcome::Released(lock) => {
                self.address(
                    &mut delivery,
                    connection_id,
                    ServerMessage::UnlockResult {
                        room: room.clone(),
                        element_id: element.clone(),
                        success: true,
                        error: None,
                    },
                )
                .await;
                self.broadcast(
                    &mut delivery,
                    room_id,
                    Some(connection_id),
                    ServerMessage::ElementUnlocked {
                        room,
                        element_id: element,
                        user_id: lock.owner_user_id.clone(),
                    },
                )
                .await;
                ticket.deliver(delivery);
                self.inner.broadcaster.publish(
                    room_id,
                    RoomEvent::ElementUnlocked {
                        element_id: lock.element_id,
                        user_id: lock.owner_user_id,
                    },
                );
            }
            UnlockOutcome::NotLocked => {
                self.address(
                    &mut delivery,
                    connection_id,
                    ServerMessage::UnlockResult { room, element_id: element, success: true, error: None },
                )
                .await;
                ticket.deliver(delivery);
            }
            UnlockOutcome::NotOwner(_) => {
                self.address(
                    &mut delivery,
                    connection_id,
                    ServerMessage::UnlockResult {
                        room,
                        element_id: element,
                        success: false,
                        error: Some(UNLOCK_NOT_OWNER.to_string()),
                    },
                )
                .await;
                ticket.deliver(delivery);
            }
        }
    }

    async fn submit(
        &self,
        connection_id: Uuid,
        identity: &Identity,
        room_id: &str,
        action: Action,
        kind: SubmitKind,
        now: i64,
    ) {
        let (integration, ticket) = self
            .inner
            .engine
            .submit(room_id, &identity.user_id, action, kind, now)
            .await
            .into_parts();
        self.inner.rooms.touch(room_id, &identity.user_id, now, true).await;

        match &integration {
            Integration::Duplicate { op, kind: first } => {
                debug!(room_id, op_id = %op.op_id, "duplicate operation acknowledged");
                let mut delivery = Delivery::new();
                self.address(&mut delivery, connection_id, event_for(*first, room_id, op)).await;
                ticket.deliver(delivery);
                return;
            }
            Integration::Rejected { op, encoded_bytes, limit } => {
                warn!(
                    room_id,
                    op_id = %op.op_id,
                    user_id = %identity.user_id,
                    encoded_bytes,
                    limit,
                    "operation too large to replicate"
                );
                let mut delivery = Delivery::new();
                self.address(
                    &mut delivery,
                    connection_id,
                    ErrorCode::InvalidMessage.frame(
                        format!(
                            "action encodes to {encoded_bytes} bytes, above the {limit} byte limit"
                        ),
                        Some(room_id),
                    ),
                )
                .await;
                ticket.deliver(delivery);
                return;
            }
            Integration::Applied { .. } | Integration::Resolved { .. } => {}
        }

        // Undo and redo move entries between stacks themselves.
        if kind == SubmitKind::Action && integration.op_won() {
            self.inner.history.push(integration.op()).await;
        }
        let operation = Operation::clone(integration.op());
        self.dispatch_integration(room_id, &integration, kind, ticket).await;
        self.inner.broadcaster.publish(room_id, RoomEvent::OperationSubmitted { operation, kind });
    }

    /// Fan an integrated operation out to the room's local connections.
    async fn dispatch_integration(
        &self,
        room_id: &str,
        integration: &Integration,
        kind: SubmitKind,
        ticket: Ticket,
    ) {
        let mut delivery = Delivery::new();
        match integration {
            Integration::Applied { op } => {
                self.broadcast(&mut delivery, room_id, None, event_for(kind, room_id, op)).await;
            }
            Integration::Resolved { op, winner, loser } => {
                let recipients = self.inner.registry.recipients(room_id, None).await;
                if op.op_id == winner.op_id {
                    // The superseded edit no longer describes the element.
                    self.inner.history.retract(room_id, &loser.user_id, loser.op_id).await;
                    if kind != SubmitKind::Action {
                        delivery.push_all(recipients.clone(), &event_for(kind, room_id, op));
                    }
                }
                delivery.push_all(
                    recipients,
                    &ServerMessage::ActionConflictResolved {
                        room: room_id.to_string(),
                        element_id: winner.element_id.clone(),
                        winning_action: Operation::clone(winner),
                    },
                );
            }
            Integration::Duplicate { .. } | Integration::Rejected { .. } => {}
        }
        ticket.deliver(delivery);
    }

    // ── Replication ──────────────────────────────────────────────────────

    /// Apply an envelope published by another instance. Local connections
    /// are only notified when the replica actually changed.
    pub async fn apply_remote(&self, envelope: RoomEnvelope, now: i64) {
        let room_id = envelope.room_id.as_str();
        let event_kind = envelope.event.kind();
        debug!(
            room_id,
            event = event_kind,
            origin_instance = %envelope.origin_instance,
            "applying remote room event"
        );

        let mut delivery = Delivery::new();
        match envelope.event {
            RoomEvent::MemberJoined { member, connection_id } => {
                let ticket =
                    self.inner.rooms.apply_remote_join(room_id, &member, connection_id, now).await;
                if let Some(ticket) = ticket {
                    self.broadcast(
                        &mut delivery,
                        room_id,
                        None,
                        ServerMessage::UserJoined { room: room_id.to_string(), member },
                    )
                    .await;
                    ticket.deliver(delivery);
                }
            }
            RoomEvent::MemberLeft { user_id, connection_id } => {
                let left =
                    self.inner.rooms.leave(room_id, &user_id, Some(connection_id), now).await;
                if let Some(left) = left {
                    let (outcome, ticket) = left.into_parts();
                    self.announce_departure(
                        room_id,
                        &outcome.presence,
                        &outcome.released,
                        false,
                        ticket,
                    )
                    .await;
                }
            }
            RoomEvent::CursorMoved { user_id, x, y, timestamp } => {
                let moved =
                    self.inner.rooms.apply_remote_cursor(room_id, &user_id, x, y, now).await;
                if let Some(moved) = moved {
                    let (presence, ticket) = moved.into_parts();
                    let update = cursor_update(room_id, &presence, timestamp);
                    self.broadcast(&mut delivery, room_id, None, update).await;
                    ticket.deliver(delivery);
                }
            }
            RoomEvent::ElementLocked { lock } => {
                let applied = self.inner.rooms.apply_remote_lock(room_id, lock.clone(), now).await;
                let (outcome, ticket) = applied.into_parts();
                match outcome {
                    RemoteLockOutcome::Applied => {
                        self.broadcast(
                            &mut delivery,
                            room_id,
                            None,
                            ServerMessage::ElementLocked { room: room_id.to_string(), lock },
                        )
                        .await;
                    }
                    RemoteLockOutcome::Replaced { previous } => {
                        info!(
                            room_id,
                            element_id = %lock.element_id,
                            winner = %lock.owner_user_id,
                            loser = %previous.owner_user_id,
                            "cross-instance lock race resolved"
                        );
                        let recipients = self.inner.registry.recipients(room_id, None).await;
                        delivery.push_all(
                            recipients.clone(),
                            &ServerMessage::ElementUnlocked {
                                room: room_id.to_string(),
                                element_id: previous.element_id,
                                user_id: previous.owner_user_id,
                            },
                        );
                        delivery.push_all(
                            recipients,
                            &ServerMessage::ElementLocked { room: room_id.to_string(), lock },
                        );
                    }
                    RemoteLockOutcome::Ignored => {}
                }
                ticket.deliver(delivery);
            }
            RoomEvent::ElementUnlocked { element_id, user_id } => {
                let released =
                    self.inner.rooms.apply_remote_unlock(room_id, &element_id, &user_id).await;
                if let Some(released) = released {
                    let (_, ticket) = released.into_parts();
                    self.broadcast(
                        &mut delivery,
                        room_id,
                        None,
                        ServerMessage::ElementUnlocked {
                            room: room_id.to_string(),
                            element_id,
                            user_id,
                        },
                    )
                    .await;
                    ticket.deliver(delivery);
                }
            }
            RoomEvent::OperationSubmitted { operation, kind } => {
                let (integration, ticket) =
                    self.inner.engine.integrate_remote(operation, kind).await.into_parts();
                self.dispatch_integration(room_id, &integration, kind, ticket).await;
            }
            RoomEvent::Heartbeat { members } => {
                let (joined, ticket) =
                    self.inner.rooms.refresh_remote(room_id, &members, now).await.into_parts();
                if !joined.is_empty() {
                    let recipients = self.inner.registry.recipients(room_id, None).await;
                    for member in joined {
                        debug!(room_id, user_id = %member.user_id, "presence learned from heartbeat");
                        delivery.push_all(
                            recipients.clone(),
                            &ServerMessage::UserJoined { room: room_id.to_string(), member },
                        );
                    }
                }
                ticket.deliver(delivery);
            }
        }
        metrics::increment_remote_events_applied();
    }

    /// Drive [`apply_remote`](Self::apply_remote) from the broker subscription.
    pub fn spawn_remote_loop(&self, mut events: RemoteEvents) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = events.next().await {
                hub.apply_remote(envelope, now_millis()).await;
            }
            warn!(instance_id = %hub.instance_id(), "remote room event stream ended");
        })
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Expire silent presences and ownerless locks, drop idle rooms and
    /// advertise local presences to other instances.
    pub async fn sweep(&self, now: i64) -> SweepSummary {
        let config = self.inner.config;
        let report =
            self.inner.rooms.sweep(now, config.presence_ttl_ms, config.room_grace_ms).await;
        let mut summary = SweepSummary { rooms_dropped: report.rooms_dropped, ..Default::default() };

        let mut locks_released = 0u64;
        for expired in report.expired {
            let presence = expired.presence;
            locks_released += expired.released.len() as u64;
            info!(
                room_id = %expired.room_id,
                user_id = %presence.identity.user_id,
                connection_id = %presence.connection_id,
                local = presence.local,
                locks_released = expired.released.len(),
                "presence expired"
            );
            self.announce_departure(
                &expired.room_id,
                &presence,
                &expired.released,
                presence.local,
                expired.ticket,
            )
            .await;
            if presence.local {
                // The transport stopped heartbeating; treat it as closed.
                self.disconnect(presence.connection_id, now).await;
            }
            summary.expired.push(presence);
        }

        for orphaned in report.orphaned {
            locks_released += orphaned.released.len() as u64;
            info!(
                room_id = %orphaned.room_id,
                user_id = %orphaned.user_id,
                locks_released = orphaned.released.len(),
                "released locks of an absent owner"
            );
            let recipients = self.inner.registry.recipients(&orphaned.room_id, None).await;
            let mut delivery = Delivery::new();
            for lock in &orphaned.released {
                delivery.push_all(
                    recipients.clone(),
                    &ServerMessage::ElementUnlocked {
                        room: orphaned.room_id.clone(),
                        element_id: lock.element_id.clone(),
                        user_id: lock.owner_user_id.clone(),
                    },
                );
            }
            orphaned.ticket.deliver(delivery);
            summary.orphaned_locks.extend(orphaned.released);
        }
        if locks_released > 0 {
            metrics::add_locks_expired(locks_released);
        }

        for room_id in &summary.rooms_dropped {
            self.inner.engine.discard(room_id).await;
            self.inner.history.discard_room(room_id).await;
        }

        for (room_id, members) in self.inner.rooms.local_members().await {
            self.inner.broadcaster.publish(&room_id, RoomEvent::Heartbeat { members });
        }

        summary
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                hub.sweep(now_millis()).await;
            }
        })
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn locks(&self, room_id: &str) -> Vec<LockInfo> {
        self.inner.rooms.locks_snapshot(room_id).await
    }

    /// `(undo_depth, redo_depth)` for a user in a room.
    pub async fn history_depth(&self, room_id: &str, user_id: &str) -> (usize, usize) {
        self.inner.history.depth(room_id, user_id).await
    }

    pub async fn members(&self, room_id: &str) -> Vec<MemberInfo> {
        self.inner.rooms.members(room_id).await
    }

    pub async fn operation_log(&self, room_id: &str) -> Vec<Arc<Operation>> {
        self.inner.engine.log(room_id).await
    }

    pub async fn element_state(&self, room_id: &str, element_id: &str) -> Option<serde_json::Value> {
        self.inner.engine.current_state(room_id, element_id).await
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.registry.len().await
    }

    // ── Delivery ─────────────────────────────────────────────────────────

    /// Push straight to one connection, outside any room's delivery order.
    async fn reply(&self, connection_id: Uuid, message: ServerMessage) {
        if let Some(outbound) = self.inner.registry.outbound(connection_id).await {
            outbound.push(message);
        }
    }

    async fn address(&self, delivery: &mut Delivery, connection_id: Uuid, message: ServerMessage) {
        if let Some(outbound) = self.inner.registry.outbound(connection_id).await {
            delivery.push(outbound, message);
        }
    }

    async fn broadcast(
        &self,
        delivery: &mut Delivery,
        room_id: &str,
        exclude: Option<Uuid>,
        message: ServerMessage,
    ) {
        let recipients = self.inner.registry.recipients(room_id, exclude).await;
        delivery.push_all(recipients, &message);
    }
}

fn cursor_update(room_id: &str, presence: &Presence, timestamp: i64) -> ServerMessage {
    ServerMessage::CursorUpdate {
        room: room_id.to_string(),
        user_id: presence.identity.user_id.clone(),
        username: presence.identity.display_name.clone(),
        color: presence.identity.color.clone(),
        x: presence.cursor_x,
        y: presence.cursor_y,
        timestamp,
    }
}
