// Operation Log & Transform Engine.
//
// Each element is a last-writer-wins register ordered by
// `(server_timestamp, user_id)`. An element is Pending while operations keep
// arriving within the conflict window of the previous arrival; an arrival
// during Pending is a concurrent edit and is reported as resolved so every
// author converges on the winner. Every operation is appended to the room log
// whether it won or not.

use std::collections::HashMap;
use std::sync::Arc;

use easel_common::types::{Action, Operation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::delivery::{DeliveryLanes, Sequenced};
use crate::metrics;

/// Why an operation was submitted; drives the event sent to the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitKind {
    Action,
    Undo,
    Redo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementPhase {
    Idle,
    Pending,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Integration {
    /// No concurrent edit: `op` is the element's new state.
    Applied { op: Arc<Operation> },
    /// `op` raced another edit inside the conflict window (or arrived
    /// carrying an older order key). `winner` is the element's state now.
    Resolved { op: Arc<Operation>, winner: Arc<Operation>, loser: Arc<Operation> },
    /// The op id was already integrated; `op` is the logged original and
    /// `kind` the reason it was first submitted.
    Duplicate { op: Arc<Operation>, kind: SubmitKind },
    /// The stamped operation would not fit a cross-instance event. Nothing
    /// was logged.
    Rejected { op: Arc<Operation>, encoded_bytes: usize, limit: usize },
}

impl Integration {
    pub fn op(&self) -> &Arc<Operation> {
        match self {
            Self::Applied { op }
            | Self::Resolved { op, .. }
            | Self::Duplicate { op, .. }
            | Self::Rejected { op, .. } => op,
        }
    }

    /// True when the submitted operation is now the element's state.
    pub fn op_won(&self) -> bool {
        match self {
            Self::Applied { .. } => true,
            Self::Resolved { op, winner, .. } => op.op_id == winner.op_id,
            Self::Duplicate { .. } | Self::Rejected { .. } => false,
        }
    }
}

#[derive(Debug, Default)]
struct ElementState {
    current: Option<Arc<Operation>>,
    window_ends_at: Option<i64>,
    seen: HashMap<Uuid, (Arc<Operation>, SubmitKind)>,
}

impl ElementState {
    fn phase_at(&self, now: i64) -> ElementPhase {
        match self.window_ends_at {
            Some(ends_at) if now < ends_at => ElementPhase::Pending,
            _ => ElementPhase::Idle,
        }
    }
}

#[derive(Debug, Default)]
struct DocumentLog {
    entries: RwLock<Vec<Arc<Operation>>>,
    elements: Mutex<HashMap<String, Arc<Mutex<ElementState>>>>,
}

impl DocumentLog {
    async fn element(&self, element_id: &str) -> Arc<Mutex<ElementState>> {
        let mut elements = self.elements.lock().await;
        Arc::clone(elements.entry(element_id.to_string()).or_default())
    }
}

#[derive(Clone)]
pub struct TransformEngine {
    docs: Arc<RwLock<HashMap<String, Arc<DocumentLog>>>>,
    window_ms: i64,
    lanes: DeliveryLanes,
    max_op_bytes: Option<usize>,
}

impl TransformEngine {
    pub fn new(window_ms: i64) -> Self {
        Self {
            docs: Arc::new(RwLock::new(HashMap::new())),
            window_ms: window_ms.max(1),
            lanes: DeliveryLanes::default(),
            max_op_bytes: None,
        }
    }

    pub fn with_lanes(mut self, lanes: DeliveryLanes) -> Self {
        self.lanes = lanes;
        self
    }

    /// Reject local operations whose JSON encoding exceeds `limit` bytes.
    pub fn with_max_op_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_op_bytes = limit;
        self
    }

    pub fn max_op_bytes(&self) -> Option<usize> {
        self.max_op_bytes
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    async fn document(&self, room_id: &str) -> Arc<DocumentLog> {
        if let Some(doc) = self.docs.read().await.get(room_id) {
            return Arc::clone(doc);
        }
        let mut docs = self.docs.write().await;
        Arc::clone(docs.entry(room_id.to_string()).or_default())
    }

    /// Stamp a client action with the server receive time and integrate it.
    /// `before_state` is taken from the element's authoritative state when
    /// one is known; the client's value is only a fallback.
    pub async fn submit(
        &self,
        room_id: &str,
        user_id: &str,
        action: Action,
        kind: SubmitKind,
        now: i64,
    ) -> Sequenced<Integration> {
        let op = Operation {
            op_id: action.op_id,
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            element_id: action.element_id,
            op_type: action.op_type,
            before_state: action.before_state,
            after_state: action.after_state,
            server_timestamp: now,
        };
        self.integrate_op(op, kind, true).await
    }

    /// Integrate an operation stamped by another instance, unchanged.
    pub async fn integrate_remote(&self, op: Operation, kind: SubmitKind) -> Sequenced<Integration> {
        self.integrate_op(op, kind, false).await
    }

    async fn integrate_op(
        &self,
        mut op: Operation,
        kind: SubmitKind,
        local: bool,
    ) -> Sequenced<Integration> {
        let doc = self.document(&op.room_id).await;
        let element = doc.element(&op.element_id).await;
        let mut state = element.lock().await;

        if let Some((existing, first_kind)) = state.seen.get(&op.op_id) {
            let duplicate = Integration::Duplicate { op: Arc::clone(existing), kind: *first_kind };
            return self.lanes.sequenced(&op.room_id, duplicate);
        }

        if local {
            if let Some(current) = &state.current {
                op.before_state = current.after_state.clone();
            }
            if let Some(limit) = self.max_op_bytes {
                let encoded_bytes = serde_json::to_vec(&op).map_or(usize::MAX, |bytes| bytes.len());
                if encoded_bytes > limit {
                    let room_id = op.room_id.clone();
                    let rejected = Integration::Rejected { op: Arc::new(op), encoded_bytes, limit };
                    return self.lanes.sequenced(&room_id, rejected);
                }
            }
        }

        let arrived_at = op.server_timestamp;
        let pending = state.phase_at(arrived_at) == ElementPhase::Pending;
        let op = Arc::new(op);

        let integration = match state.current.clone() {
            None => {
                state.current = Some(Arc::clone(&op));
                Integration::Applied { op: Arc::clone(&op) }
            }
            Some(current) if op.wins_over(&current) => {
                state.current = Some(Arc::clone(&op));
                if pending {
                    Integration::Resolved {
                        op: Arc::clone(&op),
                        winner: Arc::clone(&op),
                        loser: current,
                    }
                } else {
                    Integration::Applied { op: Arc::clone(&op) }
                }
            }
            Some(current) => Integration::Resolved {
                op: Arc::clone(&op),
                winner: current,
                loser: Arc::clone(&op),
            },
        };

        let window_end = arrived_at.saturating_add(self.window_ms);
        state.window_ends_at =
            Some(state.window_ends_at.map_or(window_end, |ends_at| ends_at.max(window_end)));
        state.seen.insert(op.op_id, (Arc::clone(&op), kind));

        // Appended and sequenced while the element is held so per-element log
        // and delivery order match resolution order.
        doc.entries.write().await.push(Arc::clone(&op));
        let ticket = self.lanes.ticket(&op.room_id);
        drop(state);

        if let Integration::Resolved { winner, loser, .. } = &integration {
            metrics::increment_conflicts_resolved();
            debug!(
                room_id = %op.room_id,
                element_id = %op.element_id,
                winner_op_id = %winner.op_id,
                loser_op_id = %loser.op_id,
                "concurrent edit resolved"
            );
        }

        Sequenced { outcome: integration, ticket }
    }

    /// Snapshot of the room's log in append order.
    pub async fn log(&self, room_id: &str) -> Vec<Arc<Operation>> {
        let doc = self.docs.read().await.get(room_id).cloned();
        match doc {
            Some(doc) => doc.entries.read().await.clone(),
            None => Vec::new(),
        }
    }

    pub async fn current_state(&self, room_id: &str, element_id: &str) -> Option<Value> {
        let doc = self.docs.read().await.get(room_id).cloned()?;
        let element = doc.elements.lock().await.get(element_id).cloned()?;
        let state = element.lock().await;
        state.current.as_ref().and_then(|op| op.after_state.clone())
    }

    pub async fn phase(&self, room_id: &str, element_id: &str, now: i64) -> ElementPhase {
        let Some(doc) = self.docs.read().await.get(room_id).cloned() else {
            return ElementPhase::Idle;
        };
        let Some(element) = doc.elements.lock().await.get(element_id).cloned() else {
            return ElementPhase::Idle;
        };
        let phase = element.lock().await.phase_at(now);
        phase
    }

    /// Discard a room's log. Canonical state lives in document storage, so
    /// this never loses data that matters.
    pub async fn discard(&self, room_id: &str) -> bool {
        self.docs.write().await.remove(room_id).is_some()
    }
}
