// Room Manager: membership, presence and advisory locks per document.
//
// Rooms live in an arena keyed by room id. Each room sits behind its own
// mutex, so unrelated documents never contend. Every change draws a delivery
// ticket before the guard is dropped; callers resolve recipients and fan out
// afterwards. Nothing here touches sockets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use easel_common::types::{millis_to_datetime, Identity, LockInfo, MemberInfo};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::delivery::{DeliveryLanes, Sequenced, Ticket};

/// A user's live state in one room.
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    pub identity: Identity,
    /// Connection that owns this entry. For remote entries this id belongs to
    /// another instance.
    pub connection_id: Uuid,
    /// True when the owning connection is on this instance.
    pub local: bool,
    pub cursor_x: f64,
    pub cursor_y: f64,
    /// Last cursor, lock or edit activity (unix ms).
    pub last_active_at: i64,
    /// Last proof of liveness of any kind (unix ms); drives TTL expiry.
    pub last_seen_at: i64,
}

impl Presence {
    pub fn member_info(&self, is_current: bool) -> MemberInfo {
        MemberInfo {
            user_id: self.identity.user_id.clone(),
            username: self.identity.display_name.clone(),
            color: self.identity.color.clone(),
            cursor_x: self.cursor_x,
            cursor_y: self.cursor_y,
            last_active_at: millis_to_datetime(self.last_active_at),
            is_current,
        }
    }

    fn remote(member: &MemberInfo, connection_id: Uuid, now: i64) -> Self {
        Self {
            identity: Identity::new(
                member.user_id.clone(),
                member.username.clone(),
                Some(member.color.clone()),
            ),
            connection_id,
            local: false,
            cursor_x: member.cursor_x,
            cursor_y: member.cursor_y,
            last_active_at: member.last_active_at.timestamp_millis(),
            last_seen_at: now,
        }
    }
}

/// Locally owned presence advertised in cross-instance heartbeats. Carries
/// the full member so a peer that missed the join can still list it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMember {
    pub member: MemberInfo,
    pub connection_id: Uuid,
}

type Members = HashMap<String, Presence>;

#[derive(Debug, Default)]
struct Room {
    /// Shared with snapshot readers; writers copy only while a snapshot is
    /// still held.
    members: Arc<Members>,
    locks: HashMap<String, LockInfo>,
    locks_by_owner: HashMap<String, HashSet<String>>,
    /// First time each lock owner was seen without a presence in the room.
    orphaned_since: HashMap<String, i64>,
    empty_since: Option<i64>,
    retired: bool,
}

impl Room {
    fn members_mut(&mut self) -> &mut Members {
        Arc::make_mut(&mut self.members)
    }

    fn insert_lock(&mut self, lock: LockInfo) {
        self.locks_by_owner
            .entry(lock.owner_user_id.clone())
            .or_default()
            .insert(lock.element_id.clone());
        self.locks.insert(lock.element_id.clone(), lock);
    }

    fn remove_lock(&mut self, element_id: &str) -> Option<LockInfo> {
        let lock = self.locks.remove(element_id)?;
        if let Some(owned) = self.locks_by_owner.get_mut(&lock.owner_user_id) {
            owned.remove(element_id);
            if owned.is_empty() {
                self.locks_by_owner.remove(&lock.owner_user_id);
            }
        }
        Some(lock)
    }

    fn release_all(&mut self, user_id: &str) -> Vec<LockInfo> {
        self.orphaned_since.remove(user_id);
        let Some(owned) = self.locks_by_owner.remove(user_id) else {
            return Vec::new();
        };
        let mut released: Vec<LockInfo> =
            owned.iter().filter_map(|element_id| self.locks.remove(element_id)).collect();
        released.sort_by(|left, right| left.element_id.cmp(&right.element_id));
        released
    }

    fn insert_member(&mut self, presence: Presence) {
        self.orphaned_since.remove(&presence.identity.user_id);
        self.members_mut().insert(presence.identity.user_id.clone(), presence);
        self.empty_since = None;
    }

    fn remove_member(&mut self, user_id: &str, now: i64) -> Option<(Presence, Vec<LockInfo>)> {
        let presence = self.members_mut().remove(user_id)?;
        let released = self.release_all(user_id);
        if self.members.is_empty() {
            self.empty_since = Some(now);
        }
        Some((presence, released))
    }

    /// Release locks whose owner has had no presence here for longer than
    /// `ttl_ms`. Such locks arrive from peers that went away without
    /// announcing departures.
    fn expire_orphaned_locks(&mut self, now: i64, ttl_ms: i64) -> Vec<(String, Vec<LockInfo>)> {
        let members = &self.members;
        let owners = &self.locks_by_owner;
        self.orphaned_since
            .retain(|owner, _| owners.contains_key(owner) && !members.contains_key(owner));

        let mut orphaned: Vec<String> = self
            .locks_by_owner
            .keys()
            .filter(|owner| !self.members.contains_key(*owner))
            .cloned()
            .collect();
        orphaned.sort();

        let mut expired = Vec::new();
        for owner in orphaned {
            let since = *self.orphaned_since.entry(owner.clone()).or_insert(now);
            if now.saturating_sub(since) > ttl_ms {
                let released = self.release_all(&owner);
                expired.push((owner, released));
            }
        }
        expired
    }

    fn sorted_locks(&self) -> Vec<LockInfo> {
        let mut locks: Vec<LockInfo> = self.locks.values().cloned().collect();
        locks.sort_by(|left, right| left.element_id.cmp(&right.element_id));
        locks
    }
}

fn sorted_members(members: &Members, current_user: Option<&str>) -> Vec<MemberInfo> {
    let mut listed: Vec<MemberInfo> = members
        .values()
        .map(|presence| presence.member_info(Some(presence.identity.user_id.as_str()) == current_user))
        .collect();
    listed.sort_by(|left, right| left.user_id.cmp(&right.user_id));
    listed
}

#[derive(Debug)]
pub struct JoinOutcome {
    pub member: MemberInfo,
    pub members: Vec<MemberInfo>,
    pub locks: Vec<LockInfo>,
    /// Older local connection of the same user that this join replaced.
    pub superseded: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaveOutcome {
    pub presence: Presence,
    pub released: Vec<LockInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted(LockInfo),
    /// The caller already owns the lock.
    AlreadyHeld(LockInfo),
    Denied(LockInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    Released(LockInfo),
    NotLocked,
    NotOwner(LockInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLockOutcome {
    Applied,
    /// The incoming lock won a race against `previous`.
    Replaced { previous: LockInfo },
    Ignored,
}

#[derive(Debug)]
pub struct ExpiredPresence {
    pub room_id: String,
    pub presence: Presence,
    pub released: Vec<LockInfo>,
    pub ticket: Ticket,
}

/// Locks released because their owner never reappeared in the room.
#[derive(Debug)]
pub struct OrphanedLocks {
    pub room_id: String,
    pub user_id: String,
    pub released: Vec<LockInfo>,
    pub ticket: Ticket,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub expired: Vec<ExpiredPresence>,
    pub orphaned: Vec<OrphanedLocks>,
    pub rooms_dropped: Vec<String>,
}

#[derive(Clone, Default)]
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<Mutex<Room>>>>>,
    lanes: DeliveryLanes,
}

impl RoomManager {
    /// Share delivery lanes with the other components that feed room fan-out.
    pub fn with_lanes(lanes: DeliveryLanes) -> Self {
        Self { rooms: Arc::default(), lanes }
    }

    async fn room(&self, room_id: &str) -> Arc<Mutex<Room>> {
        if let Some(room) = self.rooms.read().await.get(room_id) {
            return Arc::clone(room);
        }
        let mut rooms = self.rooms.write().await;
        Arc::clone(rooms.entry(room_id.to_string()).or_default())
    }

    async fn existing(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Run `f` against the live room, creating it lazily. Retries if the
    /// sweeper retired the room between lookup and lock.
    async fn with_room<T>(&self, room_id: &str, mut f: impl FnMut(&mut Room) -> T) -> T {
        loop {
            let room = self.room(room_id).await;
            let mut guard = room.lock().await;
            if guard.retired {
                continue;
            }
            return f(&mut guard);
        }
    }

    async fn with_existing<T>(&self, room_id: &str, f: impl FnOnce(&mut Room) -> T) -> Option<T> {
        let room = self.existing(room_id).await?;
        let mut guard = room.lock().await;
        if guard.retired {
            return None;
        }
        Some(f(&mut guard))
    }

    /// Idempotent per user: a re-join replaces the user's presence and keeps
    /// their cursor and locks. The member list is rendered after the room
    /// guard is released.
    pub async fn join(
        &self,
        room_id: &str,
        identity: &Identity,
        connection_id: Uuid,
        now: i64,
    ) -> Sequenced<JoinOutcome> {
        let (members, member, locks, superseded, ticket) = self
            .with_room(room_id, |room| {
                let previous = room.members.get(&identity.user_id);
                let superseded = previous
                    .filter(|presence| presence.local && presence.connection_id != connection_id)
                    .map(|presence| presence.connection_id);
                let (cursor_x, cursor_y) = previous
                    .map(|presence| (presence.cursor_x, presence.cursor_y))
                    .unwrap_or_default();

                let presence = Presence {
                    identity: identity.clone(),
                    connection_id,
                    local: true,
                    cursor_x,
                    cursor_y,
                    last_active_at: now,
                    last_seen_at: now,
                };
                let member = presence.member_info(false);
                room.insert_member(presence);

                (
                    Arc::clone(&room.members),
                    member,
                    room.sorted_locks(),
                    superseded,
                    self.lanes.ticket(room_id),
                )
            })
            .await;

        let members = sorted_members(&members, Some(identity.user_id.as_str()));
        Sequenced { outcome: JoinOutcome { member, members, locks, superseded }, ticket }
    }

    /// Remove a user's presence and release every lock they hold. When
    /// `connection_id` is given, only a presence owned by that connection is
    /// removed, so a late close never evicts a newer session.
    pub async fn leave(
        &self,
        room_id: &str,
        user_id: &str,
        connection_id: Option<Uuid>,
        now: i64,
    ) -> Option<Sequenced<LeaveOutcome>> {
        self.with_existing(room_id, |room| {
            let owned = room.members.get(user_id).is_some_and(|presence| {
                connection_id.map_or(true, |connection_id| presence.connection_id == connection_id)
            });
            if !owned {
                return None;
            }
            room.remove_member(user_id, now).map(|(presence, released)| {
                self.lanes.sequenced(room_id, LeaveOutcome { presence, released })
            })
        })
        .await
        .flatten()
    }

    pub async fn update_presence(
        &self,
        room_id: &str,
        user_id: &str,
        cursor_x: f64,
        cursor_y: f64,
        now: i64,
    ) -> Option<Sequenced<Presence>> {
        self.with_existing(room_id, |room| {
            let presence = room.members_mut().get_mut(user_id)?;
            presence.cursor_x = cursor_x;
            presence.cursor_y = cursor_y;
            presence.last_active_at = now;
            presence.last_seen_at = now;
            let presence = presence.clone();
            Some(self.lanes.sequenced(room_id, presence))
        })
        .await
        .flatten()
    }

    /// Refresh liveness (and optionally activity) without moving the cursor.
    pub async fn touch(&self, room_id: &str, user_id: &str, now: i64, active: bool) -> bool {
        self.with_existing(room_id, |room| match room.members_mut().get_mut(user_id) {
            Some(presence) => {
                presence.last_seen_at = presence.last_seen_at.max(now);
                if active {
                    presence.last_active_at = presence.last_active_at.max(now);
                }
                true
            }
            None => false,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn is_member(&self, room_id: &str, user_id: &str) -> bool {
        self.with_existing(room_id, |room| room.members.contains_key(user_id))
            .await
            .unwrap_or(false)
    }

    pub async fn presence(&self, room_id: &str, user_id: &str) -> Option<Presence> {
        self.with_existing(room_id, |room| room.members.get(user_id).cloned()).await.flatten()
    }

    /// Grant only if nobody else holds the element. Unknown elements are
    /// always lockable; the relay does not track element lifecycle.
    pub async fn lock(
        &self,
        room_id: &str,
        identity: &Identity,
        element_id: &str,
        now: i64,
    ) -> Sequenced<LockOutcome> {
        self.with_room(room_id, |room| {
            if let Some(presence) = room.members_mut().get_mut(&identity.user_id) {
                presence.last_active_at = now;
                presence.last_seen_at = now;
            }
            let outcome = match room.locks.get(element_id) {
                Some(existing) if existing.owner_user_id == identity.user_id => {
                    LockOutcome::AlreadyHeld(existing.clone())
                }
                Some(existing) => LockOutcome::Denied(existing.clone()),
                None => {
                    let lock = LockInfo {
                        element_id: element_id.to_string(),
                        owner_user_id: identity.user_id.clone(),
                        owner_username: identity.display_name.clone(),
                        acquired_at: millis_to_datetime(now),
                    };
                    room.insert_lock(lock.clone());
                    LockOutcome::Granted(lock)
                }
            };
            self.lanes.sequenced(room_id, outcome)
        })
        .await
    }

    pub async fn unlock(
        &self,
        room_id: &str,
        user_id: &str,
        element_id: &str,
    ) -> Sequenced<UnlockOutcome> {
        let sequenced = self
            .with_existing(room_id, |room| {
                let outcome = match room.locks.get(element_id) {
                    None => UnlockOutcome::NotLocked,
                    Some(existing) if existing.owner_user_id != user_id => {
                        UnlockOutcome::NotOwner(existing.clone())
                    }
                    Some(_) => match room.remove_lock(element_id) {
                        Some(lock) => UnlockOutcome::Released(lock),
                        None => UnlockOutcome::NotLocked,
                    },
                };
                self.lanes.sequenced(room_id, outcome)
            })
            .await;
        sequenced.unwrap_or_else(|| Sequenced {
            outcome: UnlockOutcome::NotLocked,
            ticket: Ticket::detached(),
        })
    }

    pub async fn locks_snapshot(&self, room_id: &str) -> Vec<LockInfo> {
        self.with_existing(room_id, |room| room.sorted_locks()).await.unwrap_or_default()
    }

    pub async fn members(&self, room_id: &str) -> Vec<MemberInfo> {
        match self.with_existing(room_id, |room| Arc::clone(&room.members)).await {
            Some(members) => sorted_members(&members, None),
            None => Vec::new(),
        }
    }

    // ── Replica updates from other instances ─────────────────────────────

    /// Upsert a presence owned by a connection on another instance. Returns
    /// a ticket when the room's membership changed. A local presence of the
    /// same user is kept as is.
    pub async fn apply_remote_join(
        &self,
        room_id: &str,
        member: &MemberInfo,
        connection_id: Uuid,
        now: i64,
    ) -> Option<Ticket> {
        self.with_room(room_id, |room| {
            let existing = room.members.get(&member.user_id);
            if existing.is_some_and(|presence| presence.local) {
                return None;
            }
            let unchanged =
                existing.is_some_and(|presence| presence.connection_id == connection_id);
            room.insert_member(Presence::remote(member, connection_id, now));
            (!unchanged).then(|| self.lanes.ticket(room_id))
        })
        .await
    }

    pub async fn apply_remote_cursor(
        &self,
        room_id: &str,
        user_id: &str,
        cursor_x: f64,
        cursor_y: f64,
        now: i64,
    ) -> Option<Sequenced<Presence>> {
        self.update_presence(room_id, user_id, cursor_x, cursor_y, now).await
    }

    /// Converge concurrent grants across instances on the lock with the
    /// earliest `(acquired_at, owner_user_id)`. A lock whose owner has no
    /// presence here starts its orphan clock at `now`.
    pub async fn apply_remote_lock(
        &self,
        room_id: &str,
        lock: LockInfo,
        now: i64,
    ) -> Sequenced<RemoteLockOutcome> {
        self.with_room(room_id, |room| {
            let outcome = match room.locks.get(&lock.element_id) {
                None => {
                    room.insert_lock(lock.clone());
                    RemoteLockOutcome::Applied
                }
                Some(existing) if existing == &lock => RemoteLockOutcome::Ignored,
                Some(existing) => {
                    let existing_key = (existing.acquired_at, existing.owner_user_id.as_str());
                    let incoming_key = (lock.acquired_at, lock.owner_user_id.as_str());
                    if incoming_key < existing_key {
                        let previous = room.remove_lock(&lock.element_id);
                        room.insert_lock(lock.clone());
                        match previous {
                            Some(previous) => RemoteLockOutcome::Replaced { previous },
                            None => RemoteLockOutcome::Applied,
                        }
                    } else {
                        RemoteLockOutcome::Ignored
                    }
                }
            };
            if outcome != RemoteLockOutcome::Ignored
                && !room.members.contains_key(&lock.owner_user_id)
            {
                room.orphaned_since.entry(lock.owner_user_id.clone()).or_insert(now);
            }
            self.lanes.sequenced(room_id, outcome)
        })
        .await
    }

    pub async fn apply_remote_unlock(
        &self,
        room_id: &str,
        element_id: &str,
        user_id: &str,
    ) -> Option<Sequenced<LockInfo>> {
        self.with_existing(room_id, |room| {
            let owned = room.locks.get(element_id).is_some_and(|lock| lock.owner_user_id == user_id);
            if !owned {
                return None;
            }
            room.remove_lock(element_id).map(|lock| self.lanes.sequenced(room_id, lock))
        })
        .await
        .flatten()
    }

    /// Apply a heartbeat from the instance owning `live`. Known presences get
    /// their TTL refreshed; presences this instance never saw (or saw on an
    /// older connection) are upserted and returned so they can be announced.
    pub async fn refresh_remote(
        &self,
        room_id: &str,
        live: &[LiveMember],
        now: i64,
    ) -> Sequenced<Vec<MemberInfo>> {
        self.with_room(room_id, |room| {
            let mut joined = Vec::new();
            for entry in live {
                let user_id = entry.member.user_id.as_str();
                match room.members_mut().get_mut(user_id) {
                    Some(presence) if presence.local => continue,
                    Some(presence) if presence.connection_id == entry.connection_id => {
                        presence.last_seen_at = presence.last_seen_at.max(now);
                        continue;
                    }
                    _ => {}
                }
                room.insert_member(Presence::remote(&entry.member, entry.connection_id, now));
                joined.push(MemberInfo { is_current: false, ..entry.member.clone() });
            }
            self.lanes.sequenced(room_id, joined)
        })
        .await
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    async fn all_rooms(&self) -> Vec<(String, Arc<Mutex<Room>>)> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(room_id, room)| (room_id.clone(), Arc::clone(room)))
            .collect()
    }

    /// Locally owned presences per room, for the cross-instance heartbeat.
    pub async fn local_members(&self) -> Vec<(String, Vec<LiveMember>)> {
        let mut result = Vec::new();
        for (room_id, room) in self.all_rooms().await {
            let members = Arc::clone(&room.lock().await.members);
            let mut live: Vec<LiveMember> = members
                .values()
                .filter(|presence| presence.local)
                .map(|presence| LiveMember {
                    member: presence.member_info(false),
                    connection_id: presence.connection_id,
                })
                .collect();
            if !live.is_empty() {
                live.sort_by(|left, right| left.member.user_id.cmp(&right.member.user_id));
                result.push((room_id, live));
            }
        }
        result.sort_by(|left, right| left.0.cmp(&right.0));
        result
    }

    /// Expire presences silent for longer than `ttl_ms` (releasing their
    /// locks), release locks whose owner has been absent for longer than
    /// `ttl_ms`, and drop rooms that have held nothing for longer than
    /// `grace_ms`.
    pub async fn sweep(&self, now: i64, ttl_ms: i64, grace_ms: i64) -> SweepReport {
        let mut report = SweepReport::default();
        for (room_id, room) in self.all_rooms().await {
            let mut guard = room.lock().await;
            if guard.retired {
                continue;
            }
            let stale: Vec<String> = guard
                .members
                .iter()
                .filter(|(_, presence)| now.saturating_sub(presence.last_seen_at) > ttl_ms)
                .map(|(user_id, _)| user_id.clone())
                .collect();
            for user_id in stale {
                if let Some((presence, released)) = guard.remove_member(&user_id, now) {
                    report.expired.push(ExpiredPresence {
                        room_id: room_id.clone(),
                        presence,
                        released,
                        ticket: self.lanes.ticket(&room_id),
                    });
                }
            }

            for (user_id, released) in guard.expire_orphaned_locks(now, ttl_ms) {
                report.orphaned.push(OrphanedLocks {
                    room_id: room_id.clone(),
                    user_id,
                    released,
                    ticket: self.lanes.ticket(&room_id),
                });
            }

            if !guard.locks.is_empty() {
                guard.empty_since = None;
            } else if guard.members.is_empty() && guard.empty_since.is_none() {
                guard.empty_since = Some(now);
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms.retain(|room_id, room| {
            let Ok(mut guard) = room.try_lock() else {
                return true;
            };
            let idle = guard.members.is_empty()
                && guard.locks.is_empty()
                && guard
                    .empty_since
                    .is_some_and(|since| now.saturating_sub(since) >= grace_ms);
            if idle {
                guard.retired = true;
                report.rooms_dropped.push(room_id.clone());
                debug!(room_id = %room_id, "dropping idle room");
            }
            !idle
        });
        drop(rooms);

        report.rooms_dropped.sort();
        for room_id in &report.rooms_dropped {
            self.lanes.remove(room_id);
        }
        report
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
